// ROM file backings. Everything read-mostly that the bus exposes comes
// through here: the PIF boot ROM, the cart, and the optional 64DD images.
// Byte-swapped cart dumps are normalized to big-endian at load time, so the
// rest of the core only ever sees native byte order.

use std::fs;
use std::path::Path;
use thiserror::Error;

pub const PIFROM_SIZE: usize = 0x800;
pub const CART_MAX_SIZE: usize = 64 * 1024 * 1024;
pub const DD_IPL_SIZE: usize = 4 * 1024 * 1024;

const Z64_MAGIC: u32 = 0x8037_1240;
const V64_MAGIC: u32 = 0x3780_4012;
const N64_MAGIC: u32 = 0x4012_3780;

#[derive(Debug, Error)]
pub enum RomError {
    #[error("failed to read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("{path}: unexpected size {actual:#x} (wanted {wanted:#x})")]
    BadSize { path: String, actual: usize, wanted: usize },
    #[error("{path}: larger than the cart bus allows ({actual:#x} > {max:#x})")]
    TooLarge { path: String, actual: usize, max: usize },
}

pub struct RomFile {
    pub data: Vec<u8>,
}

impl RomFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RomFile, RomError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| RomError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(RomFile { data })
    }

    pub fn open_exact<P: AsRef<Path>>(path: P, size: usize) -> Result<RomFile, RomError> {
        let rom = RomFile::open(&path)?;
        if rom.data.len() != size {
            return Err(RomError::BadSize {
                path: path.as_ref().display().to_string(),
                actual: rom.data.len(),
                wanted: size,
            });
        }
        Ok(rom)
    }

    // Carts come in three byte orders; sniff the boot word and normalize.
    pub fn open_cart<P: AsRef<Path>>(path: P) -> Result<RomFile, RomError> {
        let mut rom = RomFile::open(&path)?;
        if rom.data.len() > CART_MAX_SIZE {
            return Err(RomError::TooLarge {
                path: path.as_ref().display().to_string(),
                actual: rom.data.len(),
                max: CART_MAX_SIZE,
            });
        }
        normalize_byte_order(&mut rom.data);
        Ok(rom)
    }

    pub fn read_word(&self, offset: usize) -> u32 {
        if offset + 4 > self.data.len() {
            return 0;
        }
        u32::from_be_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }
}

fn normalize_byte_order(data: &mut [u8]) {
    if data.len() < 4 {
        return;
    }
    let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    match magic {
        Z64_MAGIC => {}
        V64_MAGIC => {
            for pair in data.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
        }
        N64_MAGIC => {
            for quad in data.chunks_exact_mut(4) {
                quad.swap(0, 3);
                quad.swap(1, 2);
            }
        }
        _ => log::warn!("cart boot word {:#010x} is not a known byte order", magic),
    }
}

// Identification pulled from the cart header. The full cart database lives
// outside the core; callers may overwrite `description` from theirs.
pub struct CartId {
    pub rom_id: String,
    pub region: char,
    pub description: String,
    pub hdr_hi: u32,
    pub hdr_lo: u32,
}

impl CartId {
    pub fn from_header(cart: &RomFile) -> Option<CartId> {
        if cart.data.len() < 0x40 {
            return None;
        }
        let id: String = cart.data[0x3b..0x3e].iter().map(|&b| b as char).collect();
        let region = cart.data[0x3e] as char;
        Some(CartId {
            rom_id: id,
            region,
            description: String::from("unknown"),
            hdr_hi: cart.read_word(0x10),
            hdr_lo: cart.read_word(0x14),
        })
    }
}

// The SHA class of a boot ROM is a host concern (the hashing itself lives
// outside the core); the device just reports and optionally enforces it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RomValidation {
    Unchecked,
    NtscU,
    NtscJ,
    Pal,
    Mismatch,
}

impl RomValidation {
    pub fn describe(&self) -> &'static str {
        match self {
            RomValidation::Unchecked => "unchecked",
            RomValidation::NtscU => "NTSC-U",
            RomValidation::NtscJ => "NTSC-J",
            RomValidation::Pal => "PAL",
            RomValidation::Mismatch => "unknown or corrupted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(magic: u32) -> Vec<u8> {
        let mut data = magic.to_be_bytes().to_vec();
        data.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        data
    }

    #[test]
    fn z64_is_untouched() {
        let mut data = sample(Z64_MAGIC);
        normalize_byte_order(&mut data);
        assert_eq!(&data[4..8], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn v64_swaps_halfword_bytes() {
        let mut data = sample(Z64_MAGIC);
        for pair in data.chunks_exact_mut(2) {
            pair.swap(0, 1);
        }
        normalize_byte_order(&mut data);
        assert_eq!(&data[0..4], &Z64_MAGIC.to_be_bytes());
        assert_eq!(&data[4..8], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn n64_reverses_word_bytes() {
        let mut data = sample(Z64_MAGIC);
        for quad in data.chunks_exact_mut(4) {
            quad.reverse();
        }
        normalize_byte_order(&mut data);
        assert_eq!(&data[0..4], &Z64_MAGIC.to_be_bytes());
        assert_eq!(&data[4..8], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn cart_id_reads_header_fields() {
        let mut data = vec![0u8; 0x40];
        data[0x3b] = b'N';
        data[0x3c] = b'S';
        data[0x3d] = b'M';
        data[0x3e] = b'E';
        data[0x10] = 0x63;
        let cart = RomFile { data };
        let id = CartId::from_header(&cart).unwrap();
        assert_eq!(id.rom_id, "NSM");
        assert_eq!(id.region, 'E');
        assert_eq!(id.hdr_hi, 0x6300_0000);
    }
}
