// Peripheral interface: the cart bus. Owns the cart ROM, the optional 64DD
// IPL, and the domain-2 save media, and runs the DMA engine that moves bytes
// between them and RDRAM. Transfers drain a bounded number of bytes per
// stepper tick, so the engine stays busy across cycles like the real one.

use crate::bus::{OpResult, Size};
use crate::rdram::Rdram;
use crate::rom::RomFile;
use crate::save::SaveFile;

pub const PI_DRAM_ADDR_REG: u32 = 0x00;
pub const PI_CART_ADDR_REG: u32 = 0x04;
pub const PI_RD_LEN_REG: u32 = 0x08;
pub const PI_WR_LEN_REG: u32 = 0x0C;
pub const PI_STATUS_REG: u32 = 0x10;

pub const PI_STATUS_DMA_BUSY: u32 = 1 << 0;
pub const PI_STATUS_IO_BUSY: u32 = 1 << 1;
pub const PI_STATUS_INTERRUPT: u32 = 1 << 3;

// Bytes moved per stepper tick while a transfer is in flight.
pub const PI_DMA_BUDGET: usize = 128;

pub const CART_ROM_BASE: u32 = 0x1000_0000;
pub const CART_DOM2_BASE: u32 = 0x0800_0000;
pub const DD_IPL_BASE: u32 = 0x0600_0000;

#[derive(Debug, Clone, Copy, PartialEq)]
enum DmaDirection {
    // RDRAM -> cart (PI_RD_LEN)
    ToCart,
    // cart -> RDRAM (PI_WR_LEN)
    ToDram,
}

struct DmaTransfer {
    direction: DmaDirection,
    cart_addr: u32,
    dram_addr: u32,
    remaining: usize,
}

pub enum CartSave {
    None,
    Sram(SaveFile),
    Flash(FlashRam),
}

pub struct Pi {
    pub cart: RomFile,
    pub dd_ipl: Option<RomFile>,
    pub save: CartSave,
    dram_addr: u32,
    cart_addr: u32,
    interrupt: bool,
    transfer: Option<DmaTransfer>,
    bsd_regs: [u32; 8],
}

impl Pi {
    pub fn new(cart: RomFile, dd_ipl: Option<RomFile>, save: CartSave) -> Pi {
        Pi {
            cart,
            dd_ipl,
            save,
            dram_addr: 0,
            cart_addr: 0,
            interrupt: false,
            transfer: None,
            bsd_regs: [0; 8],
        }
    }

    pub fn busy(&self) -> bool {
        self.transfer.is_some()
    }

    pub fn read_reg(&self, offset: u32) -> u32 {
        match offset {
            PI_DRAM_ADDR_REG => self.dram_addr,
            PI_CART_ADDR_REG => self.cart_addr,
            PI_STATUS_REG => {
                let mut status = 0;
                if self.busy() {
                    status |= PI_STATUS_DMA_BUSY | PI_STATUS_IO_BUSY;
                }
                if self.interrupt {
                    status |= PI_STATUS_INTERRUPT;
                }
                status
            }
            0x14..=0x30 => self.bsd_regs[((offset - 0x14) >> 2) as usize],
            _ => 0,
        }
    }

    // Returns true when the write kicked off a transfer.
    pub fn write_reg(&mut self, offset: u32, value: u32) -> bool {
        match offset {
            PI_DRAM_ADDR_REG => self.dram_addr = value & 0x00FF_FFFF,
            PI_CART_ADDR_REG => self.cart_addr = value,
            PI_RD_LEN_REG | PI_WR_LEN_REG => {
                // Length writes while the controller is draining are ignored.
                if self.busy() {
                    return false;
                }
                let direction = if offset == PI_RD_LEN_REG {
                    DmaDirection::ToCart
                } else {
                    DmaDirection::ToDram
                };
                self.transfer = Some(DmaTransfer {
                    direction,
                    cart_addr: self.cart_addr,
                    dram_addr: self.dram_addr,
                    remaining: (value as usize & 0x00FF_FFFF) + 1,
                });
                return true;
            }
            PI_STATUS_REG => {
                if value & 0x1 != 0 {
                    self.transfer = None;
                }
                if value & 0x2 != 0 {
                    self.interrupt = false;
                }
            }
            0x14..=0x30 => self.bsd_regs[((offset - 0x14) >> 2) as usize] = value & 0xFF,
            _ => {}
        }
        false
    }

    // Drains up to `budget` bytes. Returns true when the transfer completed
    // this tick; the caller raises the MI line.
    pub fn dma_step(&mut self, rdram: &mut Rdram, budget: usize) -> bool {
        let mut transfer = match self.transfer.take() {
            Some(transfer) => transfer,
            None => return false,
        };
        let chunk = transfer.remaining.min(budget);
        for _ in 0..chunk {
            match transfer.direction {
                DmaDirection::ToDram => {
                    let byte = self.read_cart_byte(transfer.cart_addr);
                    rdram.write(transfer.dram_addr as usize, OpResult::Byte(byte));
                }
                DmaDirection::ToCart => {
                    let byte = rdram.read(transfer.dram_addr as usize, Size::Byte).inner() as u8;
                    self.write_cart_byte(transfer.cart_addr, byte);
                }
            }
            transfer.cart_addr = transfer.cart_addr.wrapping_add(1);
            transfer.dram_addr = transfer.dram_addr.wrapping_add(1);
            transfer.remaining -= 1;
        }
        self.dram_addr = transfer.dram_addr;
        self.cart_addr = transfer.cart_addr;
        if transfer.remaining == 0 {
            if let CartSave::Flash(flash) = &mut self.save {
                flash.dma_finished(transfer.direction == DmaDirection::ToCart);
            }
            self.interrupt = true;
            true
        } else {
            self.transfer = Some(transfer);
            false
        }
    }

    pub fn read_cart(&self, paddr: u32, size: Size) -> OpResult {
        match size {
            Size::Dword => {
                let hi = self.read_cart_word(paddr) as u64;
                let lo = self.read_cart_word(paddr + 4) as u64;
                OpResult::Dword(hi << 32 | lo)
            }
            Size::Word => OpResult::Word(self.read_cart_word(paddr)),
            Size::Half => {
                let word = self.read_cart_word(paddr & !3);
                OpResult::Half((word >> (16 - 8 * (paddr as usize & 2))) as u16)
            }
            Size::Byte => OpResult::Byte(self.read_cart_byte(paddr)),
        }
    }

    pub fn write_cart(&mut self, paddr: u32, value: OpResult) {
        // Only the save domain accepts stores; ROM writes fall on the floor.
        if (CART_DOM2_BASE..CART_ROM_BASE).contains(&paddr) {
            match &mut self.save {
                CartSave::Sram(sram) => {
                    let offset = (paddr - CART_DOM2_BASE) as usize & 0x7FFF;
                    let len = value.size() as usize;
                    let bytes = value.inner().to_be_bytes();
                    sram.write(offset, &bytes[8 - len..]);
                }
                CartSave::Flash(flash) => {
                    flash.write_command(paddr - CART_DOM2_BASE, value.inner() as u32)
                }
                CartSave::None => {}
            }
        }
    }

    fn read_cart_word(&self, paddr: u32) -> u32 {
        let bytes = [
            self.read_cart_byte(paddr),
            self.read_cart_byte(paddr + 1),
            self.read_cart_byte(paddr + 2),
            self.read_cart_byte(paddr + 3),
        ];
        u32::from_be_bytes(bytes)
    }

    fn read_cart_byte(&self, paddr: u32) -> u8 {
        if paddr >= CART_ROM_BASE {
            let offset = (paddr - CART_ROM_BASE) as usize;
            return self.cart.data.get(offset).copied().unwrap_or(0);
        }
        if (CART_DOM2_BASE..CART_ROM_BASE).contains(&paddr) {
            let offset = (paddr - CART_DOM2_BASE) as usize;
            return match &self.save {
                CartSave::Sram(sram) => sram.data.get(offset & 0x7FFF).copied().unwrap_or(0),
                CartSave::Flash(flash) => flash.read_byte(offset),
                CartSave::None => 0,
            };
        }
        if paddr >= DD_IPL_BASE && paddr < CART_DOM2_BASE {
            if let Some(ipl) = &self.dd_ipl {
                let offset = (paddr - DD_IPL_BASE) as usize;
                return ipl.data.get(offset).copied().unwrap_or(0);
            }
        }
        0
    }

    fn write_cart_byte(&mut self, paddr: u32, byte: u8) {
        if (CART_DOM2_BASE..CART_ROM_BASE).contains(&paddr) {
            let offset = (paddr - CART_DOM2_BASE) as usize;
            match &mut self.save {
                CartSave::Sram(sram) => sram.write(offset & 0x7FFF, &[byte]),
                CartSave::Flash(flash) => flash.dma_byte_in(offset, byte),
                CartSave::None => {}
            }
        }
    }

    pub fn flush_saves(&mut self) {
        let result = match &mut self.save {
            CartSave::Sram(sram) => sram.flush(),
            CartSave::Flash(flash) => flash.backing.flush(),
            CartSave::None => Ok(()),
        };
        if let Err(err) = result {
            log::warn!("cart save flush failed: {}", err);
        }
    }
}

// FlashRAM command machine. Mode transitions mirror the chip's command set;
// page writes land in a staging buffer until the execute command commits.
#[derive(Debug, Clone, Copy, PartialEq)]
enum FlashMode {
    Status,
    ReadArray,
    Erase,
    Write,
}

pub struct FlashRam {
    pub backing: SaveFile,
    mode: FlashMode,
    status: u64,
    erase_offset: usize,
    write_offset: usize,
    write_buf: [u8; 128],
}

impl FlashRam {
    pub fn new(backing: SaveFile) -> FlashRam {
        FlashRam {
            backing,
            mode: FlashMode::Status,
            status: 0x1111_8001_00C2_001D,
            erase_offset: 0,
            write_offset: 0,
            write_buf: [0xFF; 128],
        }
    }

    pub fn write_command(&mut self, offset: u32, command: u32) {
        // Commands arrive on the upper register; data-area stores are DMA only.
        if offset < 0x10000 {
            return;
        }
        match command >> 24 {
            0x4B => {
                self.erase_offset = (command as usize & 0xFFFF) * 128;
            }
            0x78 => {
                self.mode = FlashMode::Erase;
                self.status = 0x1111_8008_00C2_001D;
            }
            0xA5 => {
                self.write_offset = (command as usize & 0xFFFF) * 128;
                self.status = 0x1111_8004_00C2_001D;
            }
            0xB4 => {
                self.mode = FlashMode::Write;
            }
            0xD2 => match self.mode {
                FlashMode::Erase => {
                    let end = (self.erase_offset + 128).min(self.backing.data.len());
                    let fill = vec![0xFFu8; end.saturating_sub(self.erase_offset)];
                    self.backing.write(self.erase_offset, &fill);
                }
                FlashMode::Write => {
                    let buf = self.write_buf;
                    self.backing.write(self.write_offset, &buf);
                }
                _ => {}
            },
            0xE1 => {
                self.mode = FlashMode::Status;
                self.status = 0x1111_8001_00C2_001D;
            }
            0xF0 => {
                self.mode = FlashMode::ReadArray;
                self.status = 0x1111_8004_F000_001D;
            }
            other => log::debug!("flashram: unhandled command {:#04x}", other),
        }
    }

    pub fn read_byte(&self, offset: usize) -> u8 {
        match self.mode {
            FlashMode::ReadArray => self.backing.data.get(offset).copied().unwrap_or(0xFF),
            _ => {
                let shift = 56 - 8 * (offset & 7);
                (self.status >> shift) as u8
            }
        }
    }

    fn dma_byte_in(&mut self, offset: usize, byte: u8) {
        if self.mode == FlashMode::Write {
            self.write_buf[offset & 0x7F] = byte;
        }
    }

    fn dma_finished(&mut self, _to_cart: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::save::FLASHRAM_SIZE;

    fn test_pi() -> Pi {
        let mut data = vec![0u8; 0x1000];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = i as u8;
        }
        Pi::new(RomFile { data }, None, CartSave::None)
    }

    #[test]
    fn cart_to_rdram_dma_copies_and_clears_busy() {
        let mut pi = test_pi();
        let mut rdram = Rdram::new();
        pi.write_reg(PI_DRAM_ADDR_REG, 0x2000);
        pi.write_reg(PI_CART_ADDR_REG, CART_ROM_BASE + 0x10);
        assert!(pi.write_reg(PI_WR_LEN_REG, 0x3F)); // 64 bytes
        assert!(pi.read_reg(PI_STATUS_REG) & PI_STATUS_DMA_BUSY != 0);
        let mut done = false;
        for _ in 0..8 {
            if pi.dma_step(&mut rdram, PI_DMA_BUDGET) {
                done = true;
                break;
            }
        }
        assert!(done);
        assert_eq!(pi.read_reg(PI_STATUS_REG) & PI_STATUS_DMA_BUSY, 0);
        assert!(pi.read_reg(PI_STATUS_REG) & PI_STATUS_INTERRUPT != 0);
        for i in 0..64usize {
            assert_eq!(rdram.read(0x2000 + i, Size::Byte).inner() as u8, (0x10 + i) as u8);
        }
    }

    #[test]
    fn length_writes_while_busy_are_ignored() {
        let mut pi = test_pi();
        pi.write_reg(PI_CART_ADDR_REG, CART_ROM_BASE);
        pi.write_reg(PI_WR_LEN_REG, 0xFFF);
        assert!(!pi.write_reg(PI_WR_LEN_REG, 0x3));
    }

    #[test]
    fn status_write_acknowledges_interrupt() {
        let mut pi = test_pi();
        let mut rdram = Rdram::new();
        pi.write_reg(PI_CART_ADDR_REG, CART_ROM_BASE);
        pi.write_reg(PI_WR_LEN_REG, 0x7);
        while !pi.dma_step(&mut rdram, PI_DMA_BUDGET) {}
        assert!(pi.read_reg(PI_STATUS_REG) & PI_STATUS_INTERRUPT != 0);
        pi.write_reg(PI_STATUS_REG, 0x2);
        assert_eq!(pi.read_reg(PI_STATUS_REG) & PI_STATUS_INTERRUPT, 0);
    }

    #[test]
    fn flashram_erase_then_status_reads() {
        let backing = SaveFile::volatile(FLASHRAM_SIZE, 0xFF);
        let mut flash = FlashRam::new(backing);
        flash.write_command(0x10000, 0x4B00_0002);
        flash.write_command(0x10000, 0x7800_0000);
        flash.write_command(0x10000, 0xD200_0000);
        assert!(flash.backing.data[2 * 128..3 * 128].iter().all(|&b| b == 0xFF));
        flash.write_command(0x10000, 0xE100_0000);
        assert_eq!(flash.read_byte(0), 0x11);
    }

    #[test]
    fn flashram_write_page_commits_on_execute() {
        let backing = SaveFile::volatile(FLASHRAM_SIZE, 0xFF);
        let mut flash = FlashRam::new(backing);
        flash.write_command(0x10000, 0xB400_0000);
        for i in 0..128usize {
            flash.dma_byte_in(i, i as u8);
        }
        flash.write_command(0x10000, 0xA500_0004);
        flash.write_command(0x10000, 0xD200_0000);
        assert_eq!(flash.backing.data[4 * 128], 0);
        assert_eq!(flash.backing.data[4 * 128 + 127], 127);
    }
}
