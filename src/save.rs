// Save-media backings. Each is a fixed-size byte vector bound to a path;
// freshly created files get the initial pattern the hardware expects. The
// device flushes dirty backings back to disk when the machine is torn down.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const EEPROM_4K_SIZE: usize = 0x200;
pub const EEPROM_16K_SIZE: usize = 0x800;
pub const SRAM_SIZE: usize = 0x8000;
pub const FLASHRAM_SIZE: usize = 0x20000;
pub const MEMPAK_SIZE: usize = 0x8000;

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("failed to open save {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("{path}: save is {actual:#x} bytes, expected {wanted:#x}")]
    BadSize { path: String, actual: usize, wanted: usize },
}

pub struct SaveFile {
    path: Option<PathBuf>,
    pub data: Vec<u8>,
    dirty: bool,
}

impl SaveFile {
    // A backing with no path behind it; contents are lost on exit.
    pub fn volatile(size: usize, fill: u8) -> SaveFile {
        SaveFile { path: None, data: vec![fill; size], dirty: false }
    }

    // Opens the file at its fixed size, creating it from `fill` when absent.
    // Returns whether the file was freshly created so callers can format it.
    pub fn open<P: AsRef<Path>>(path: P, size: usize, fill: u8) -> Result<(SaveFile, bool), SaveError> {
        let path = path.as_ref();
        match fs::read(path) {
            Ok(data) => {
                if data.len() != size {
                    return Err(SaveError::BadSize {
                        path: path.display().to_string(),
                        actual: data.len(),
                        wanted: size,
                    });
                }
                Ok((SaveFile { path: Some(path.to_path_buf()), data, dirty: false }, false))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let save = SaveFile {
                    path: Some(path.to_path_buf()),
                    data: vec![fill; size],
                    dirty: true,
                };
                Ok((save, true))
            }
            Err(source) => Err(SaveError::Io { path: path.display().to_string(), source }),
        }
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) {
        let end = (offset + out.len()).min(self.data.len());
        if offset >= end {
            out.iter_mut().for_each(|b| *b = 0);
            return;
        }
        let len = end - offset;
        out[..len].copy_from_slice(&self.data[offset..end]);
        out[len..].iter_mut().for_each(|b| *b = 0);
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        let end = (offset + bytes.len()).min(self.data.len());
        if offset >= end {
            return;
        }
        self.data[offset..end].copy_from_slice(&bytes[..end - offset]);
        self.dirty = true;
    }

    pub fn flush(&mut self) -> Result<(), SaveError> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.path {
            fs::write(path, &self.data).map_err(|source| SaveError::Io {
                path: path.display().to_string(),
                source,
            })?;
        }
        self.dirty = false;
        Ok(())
    }
}

// Lays down the controller pak filesystem: the id block (with its three
// backup copies), and the index table plus backup. Checksums follow the
// hardware layout: the sum of the id block's first fourteen words, then
// 0xFFF2 minus that sum.
pub fn controller_pak_format(data: &mut [u8]) {
    for byte in data.iter_mut() {
        *byte = 0;
    }
    data[0] = 0x81;

    let mut id_block = [0u8; 32];
    // Serial area; arbitrary but stable so checksums stay reproducible.
    for (i, byte) in id_block[..24].iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(0x11);
    }
    id_block[25] = 0x01; // device id
    id_block[26] = 0x01; // banks
    let sum = id_block_checksum(&id_block);
    id_block[28..30].copy_from_slice(&sum.to_be_bytes());
    id_block[30..32].copy_from_slice(&(0xFFF2u16.wrapping_sub(sum)).to_be_bytes());

    for &base in &[0x20usize, 0x60, 0x80, 0xC0] {
        data[base..base + 32].copy_from_slice(&id_block);
    }

    // Index table: pages 5..127 free (0x0003), first five reserved.
    for table in &[0x100usize, 0x200] {
        for page in 5..128usize {
            data[table + 2 * page + 1] = 0x03;
        }
        data[table + 1] = index_checksum(&data[table + 0xA..table + 0x100]);
    }
}

pub fn id_block_checksum(block: &[u8; 32]) -> u16 {
    let mut sum = 0u16;
    for word in block[..28].chunks_exact(2) {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]));
    }
    sum
}

pub fn index_checksum(entries: &[u8]) -> u8 {
    entries.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}
