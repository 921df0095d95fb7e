// Serial interface: 64-byte DMA channel between RDRAM and PIF RAM. The
// interesting behavior lives on the far side of the channel in pif.rs; this
// file is the engine and its status word.

use crate::bus::Size;
use crate::bus::OpResult;
use crate::pif::Pif;
use crate::rdram::Rdram;

pub const SI_DRAM_ADDR_REG: u32 = 0x00;
pub const SI_PIF_ADDR_RD64B_REG: u32 = 0x04;
pub const SI_PIF_ADDR_WR64B_REG: u32 = 0x10;
pub const SI_STATUS_REG: u32 = 0x18;

pub const SI_STATUS_DMA_BUSY: u32 = 1 << 0;
pub const SI_STATUS_INTERRUPT: u32 = 1 << 12;

pub const SI_DMA_BUDGET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    PifToDram,
    DramToPif,
}

struct Transfer {
    direction: Direction,
    cursor: usize,
}

pub struct Si {
    dram_addr: u32,
    interrupt: bool,
    transfer: Option<Transfer>,
}

impl Si {
    pub fn new() -> Si {
        Si { dram_addr: 0, interrupt: false, transfer: None }
    }

    pub fn read_reg(&self, offset: u32) -> u32 {
        match offset {
            SI_DRAM_ADDR_REG => self.dram_addr,
            SI_STATUS_REG => {
                let mut status = 0;
                if self.transfer.is_some() {
                    status |= SI_STATUS_DMA_BUSY;
                }
                if self.interrupt {
                    status |= SI_STATUS_INTERRUPT;
                }
                status
            }
            _ => 0,
        }
    }

    // Joybus execution happens when the kick arrives, so the bytes the DMA
    // drains are already the response.
    pub fn write_reg(&mut self, offset: u32, value: u32, pif: &mut Pif) {
        match offset {
            SI_DRAM_ADDR_REG => self.dram_addr = value & 0x00FF_FFFF,
            SI_PIF_ADDR_RD64B_REG => {
                if self.transfer.is_none() {
                    pif.run_joybus();
                    self.transfer = Some(Transfer { direction: Direction::PifToDram, cursor: 0 });
                }
            }
            SI_PIF_ADDR_WR64B_REG => {
                if self.transfer.is_none() {
                    self.transfer = Some(Transfer { direction: Direction::DramToPif, cursor: 0 });
                }
            }
            SI_STATUS_REG => self.interrupt = false,
            _ => {}
        }
    }

    pub fn dma_step(&mut self, rdram: &mut Rdram, pif: &mut Pif, budget: usize) -> bool {
        let mut transfer = match self.transfer.take() {
            Some(transfer) => transfer,
            None => return false,
        };
        let end = (transfer.cursor + budget).min(64);
        for i in transfer.cursor..end {
            let dram = self.dram_addr as usize + i;
            match transfer.direction {
                Direction::PifToDram => {
                    let byte = pif.ram[i];
                    rdram.write(dram, OpResult::Byte(byte));
                }
                Direction::DramToPif => {
                    pif.ram[i] = rdram.read(dram, Size::Byte).inner() as u8;
                }
            }
        }
        transfer.cursor = end;
        if transfer.cursor == 64 {
            if transfer.direction == Direction::DramToPif {
                pif.command_setup();
            }
            self.interrupt = true;
            true
        } else {
            self.transfer = Some(transfer);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pif::Pif;

    #[test]
    fn write_dma_lands_in_pif_ram_and_raises_interrupt() {
        let mut si = Si::new();
        let mut rdram = Rdram::new();
        let mut pif = Pif::new(vec![0; 0x7C0]);
        for i in 0..64usize {
            rdram.write(0x400 + i, OpResult::Byte(i as u8));
        }
        si.write_reg(SI_DRAM_ADDR_REG, 0x400, &mut pif);
        si.write_reg(SI_PIF_ADDR_WR64B_REG, 0x1FC0_07C0, &mut pif);
        assert!(si.read_reg(SI_STATUS_REG) & SI_STATUS_DMA_BUSY != 0);
        let mut done = false;
        for _ in 0..16 {
            if si.dma_step(&mut rdram, &mut pif, SI_DMA_BUDGET) {
                done = true;
                break;
            }
        }
        assert!(done);
        assert_eq!(pif.ram[5], 5);
        assert!(si.read_reg(SI_STATUS_REG) & SI_STATUS_INTERRUPT != 0);
        si.write_reg(SI_STATUS_REG, 0, &mut pif);
        assert_eq!(si.read_reg(SI_STATUS_REG) & SI_STATUS_INTERRUPT, 0);
    }
}
