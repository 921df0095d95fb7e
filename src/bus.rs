// The system bus: a total routing of 32-bit physical addresses onto the
// device regions. RAM-like regions take any natural width; register regions
// speak words, so narrower accesses widen and 64-bit accesses split. Reads
// off the map are open-bus zeros, writes off the map are dropped.

use crate::ai::Ai;
use crate::mi::{IntSource, Mi};
use crate::pi::Pi;
use crate::pif::Pif;
use crate::rdp::Rdp;
use crate::rdram::{Rdram, RDRAM_SIZE};
use crate::rsp::Rsp;
use crate::si::Si;
use crate::vi::Vi;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Size {
    Byte = 1,
    Half = 2,
    Word = 4,
    Dword = 8,
}

impl Size {
    pub fn from_bytes(size: usize) -> Size {
        match size {
            1 => Size::Byte,
            2 => Size::Half,
            4 => Size::Word,
            _ => Size::Dword,
        }
    }

    pub fn zero(&self) -> OpResult {
        match self {
            Size::Byte => OpResult::Byte(0),
            Size::Half => OpResult::Half(0),
            Size::Word => OpResult::Word(0),
            Size::Dword => OpResult::Dword(0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum OpResult {
    Byte(u8),
    Half(u16),
    Word(u32),
    Dword(u64),
}

impl OpResult {
    pub fn inner(&self) -> u64 {
        match *self {
            OpResult::Byte(v) => v as u64,
            OpResult::Half(v) => v as u64,
            OpResult::Word(v) => v as u64,
            OpResult::Dword(v) => v,
        }
    }

    pub fn size(&self) -> Size {
        match self {
            OpResult::Byte(_) => Size::Byte,
            OpResult::Half(_) => Size::Half,
            OpResult::Word(_) => Size::Word,
            OpResult::Dword(_) => Size::Dword,
        }
    }

    pub fn from_bytes(value: u64, size: usize) -> OpResult {
        match size {
            1 => OpResult::Byte(value as u8),
            2 => OpResult::Half(value as u16),
            4 => OpResult::Word(value as u32),
            _ => OpResult::Dword(value),
        }
    }
}

pub fn read_be(mem: &[u8], offset: usize, size: Size) -> OpResult {
    let mut value = 0u64;
    for i in 0..size as usize {
        value = value << 8 | *mem.get(offset + i).unwrap_or(&0) as u64;
    }
    OpResult::from_bytes(value, size as usize)
}

pub fn write_be(mem: &mut [u8], offset: usize, value: OpResult) {
    let size = value.size() as usize;
    let raw = value.inner();
    for i in 0..size {
        if let Some(slot) = mem.get_mut(offset + i) {
            *slot = (raw >> (8 * (size - 1 - i))) as u8;
        }
    }
}

const RDRAM_REGS_BASE: u32 = 0x03F0_0000;
const SP_MEM_BASE: u32 = 0x0400_0000;
const SP_REGS_BASE: u32 = 0x0404_0000;
const SP_PC_BASE: u32 = 0x0408_0000;
const DP_REGS_BASE: u32 = 0x0410_0000;
const MI_REGS_BASE: u32 = 0x0430_0000;
const VI_REGS_BASE: u32 = 0x0440_0000;
const AI_REGS_BASE: u32 = 0x0450_0000;
const PI_REGS_BASE: u32 = 0x0460_0000;
const RI_REGS_BASE: u32 = 0x0470_0000;
const SI_REGS_BASE: u32 = 0x0480_0000;
const DD_REGS_BASE: u32 = 0x0500_0000;
const DD_IPL_BASE: u32 = 0x0600_0000;
const CART_DOM2_BASE: u32 = 0x0800_0000;
const CART_ROM_BASE: u32 = 0x1000_0000;
const PIF_ROM_BASE: u32 = 0x1FC0_0000;
const PIF_RAM_BASE: u32 = 0x1FC0_07C0;
const PIF_RAM_END: u32 = 0x1FC0_0800;

enum Region {
    Rdram,
    RdramRegs,
    SpMem,
    SpRegs,
    SpPc,
    DpRegs,
    MiRegs,
    ViRegs,
    AiRegs,
    PiRegs,
    RiRegs,
    SiRegs,
    DdRegs,
    Cart,
    PifRom,
    PifRam,
    OpenBus,
}

fn region(paddr: u32) -> Region {
    match paddr {
        _ if (paddr as usize) < RDRAM_SIZE => Region::Rdram,
        _ if (RDRAM_REGS_BASE..SP_MEM_BASE).contains(&paddr) => Region::RdramRegs,
        _ if (SP_MEM_BASE..SP_REGS_BASE).contains(&paddr) => Region::SpMem,
        _ if (SP_REGS_BASE..SP_PC_BASE).contains(&paddr) => Region::SpRegs,
        _ if (SP_PC_BASE..SP_PC_BASE + 0x10).contains(&paddr) => Region::SpPc,
        _ if (DP_REGS_BASE..DP_REGS_BASE + 0x20).contains(&paddr) => Region::DpRegs,
        _ if (MI_REGS_BASE..MI_REGS_BASE + 0x10).contains(&paddr) => Region::MiRegs,
        _ if (VI_REGS_BASE..VI_REGS_BASE + 0x38).contains(&paddr) => Region::ViRegs,
        _ if (AI_REGS_BASE..AI_REGS_BASE + 0x18).contains(&paddr) => Region::AiRegs,
        _ if (PI_REGS_BASE..PI_REGS_BASE + 0x34).contains(&paddr) => Region::PiRegs,
        _ if (RI_REGS_BASE..RI_REGS_BASE + 0x20).contains(&paddr) => Region::RiRegs,
        _ if (SI_REGS_BASE..SI_REGS_BASE + 0x1C).contains(&paddr) => Region::SiRegs,
        _ if (DD_REGS_BASE..DD_IPL_BASE).contains(&paddr) => Region::DdRegs,
        _ if (DD_IPL_BASE..PIF_ROM_BASE).contains(&paddr) => Region::Cart,
        _ if (PIF_ROM_BASE..PIF_RAM_BASE).contains(&paddr) => Region::PifRom,
        _ if (PIF_RAM_BASE..PIF_RAM_END).contains(&paddr) => Region::PifRam,
        _ => Region::OpenBus,
    }
}

// 64DD drive stub: present enough to report that no disk is inserted.
pub struct DdStub;

impl DdStub {
    fn read_reg(&self, offset: u32) -> u32 {
        match offset {
            // ASIC status: no disk, mecha idle.
            0x08 => 0x0100_0000,
            _ => 0,
        }
    }
}

pub struct Bus {
    pub rdram: Rdram,
    pub mi: Mi,
    pub vi: Vi,
    pub ai: Ai,
    pub pi: Pi,
    pub si: Si,
    pub pif: Pif,
    pub rsp: Rsp,
    pub rdp: Rdp,
    pub dd: DdStub,
}

impl Bus {
    pub fn new(pi: Pi, pif: Pif) -> Bus {
        Bus {
            rdram: Rdram::new(),
            mi: Mi::new(),
            vi: Vi::new(),
            ai: Ai::new(),
            pi,
            si: Si::new(),
            pif,
            rsp: Rsp::new(),
            rdp: Rdp::new(),
            dd: DdStub,
        }
    }

    pub fn read(&mut self, paddr: u32, size: Size) -> OpResult {
        match region(paddr) {
            Region::Rdram => self.rdram.read(paddr as usize, size),
            Region::SpMem => {
                let value = self.rsp.mem_read(paddr as usize & 0x1FFF, size as usize);
                OpResult::from_bytes(value, size as usize)
            }
            Region::Cart => self.pi.read_cart(paddr, size),
            Region::PifRom => {
                let offset = (paddr - PIF_ROM_BASE) as usize;
                let mut value = 0u64;
                for i in 0..size as usize {
                    value = value << 8 | self.pif.read_rom_byte(offset + i) as u64;
                }
                OpResult::from_bytes(value, size as usize)
            }
            Region::PifRam => {
                let offset = (paddr - PIF_RAM_BASE) as usize;
                read_be(&self.pif.ram, offset, size)
            }
            _ => self.read_reg_region(paddr, size),
        }
    }

    fn read_reg_region(&mut self, paddr: u32, size: Size) -> OpResult {
        let word = self.read_reg_word(paddr & !3);
        match size {
            Size::Word => OpResult::Word(word),
            Size::Dword => {
                let lo = self.read_reg_word((paddr & !3) + 4);
                OpResult::Dword((word as u64) << 32 | lo as u64)
            }
            Size::Half => OpResult::Half((word >> (16 - 8 * (paddr & 2))) as u16),
            Size::Byte => OpResult::Byte((word >> (24 - 8 * (paddr & 3))) as u8),
        }
    }

    fn read_reg_word(&mut self, paddr: u32) -> u32 {
        match region(paddr) {
            Region::RdramRegs => self.rdram.read_device_reg(paddr - RDRAM_REGS_BASE),
            Region::SpRegs => self.rsp.read_reg((paddr - SP_REGS_BASE) & 0x1F),
            Region::SpPc => self.rsp.read_pc(),
            Region::DpRegs => self.rdp.read_reg(paddr - DP_REGS_BASE),
            Region::MiRegs => self.mi.read_reg(paddr - MI_REGS_BASE),
            Region::ViRegs => self.vi.read_reg(paddr - VI_REGS_BASE),
            Region::AiRegs => self.ai.read_reg(paddr - AI_REGS_BASE),
            Region::PiRegs => self.pi.read_reg(paddr - PI_REGS_BASE),
            Region::RiRegs => self.rdram.read_ri_reg(paddr - RI_REGS_BASE),
            Region::SiRegs => self.si.read_reg(paddr - SI_REGS_BASE),
            Region::DdRegs => self.dd.read_reg(paddr - DD_REGS_BASE),
            _ => {
                log::debug!("open bus read at {:#010x}", paddr);
                0
            }
        }
    }

    pub fn write(&mut self, paddr: u32, value: OpResult) {
        match region(paddr) {
            Region::Rdram => self.rdram.write(paddr as usize, value),
            Region::SpMem => {
                self.rsp
                    .mem_write(paddr as usize & 0x1FFF, value.inner(), value.size() as usize)
            }
            Region::Cart => self.pi.write_cart(paddr, value),
            Region::PifRam => {
                let offset = (paddr - PIF_RAM_BASE) as usize;
                write_be(&mut self.pif.ram, offset, value);
            }
            Region::PifRom | Region::OpenBus => {
                log::debug!("dropped write at {:#010x}", paddr);
            }
            _ => {
                // Register regions take the value as a word; a 64-bit store
                // delivers its upper word first, as the bus would.
                match value {
                    OpResult::Dword(v) => {
                        self.write_reg_word(paddr & !3, (v >> 32) as u32);
                        self.write_reg_word((paddr & !3) + 4, v as u32);
                    }
                    _ => self.write_reg_word(paddr & !3, value.inner() as u32),
                }
            }
        }
    }

    fn write_reg_word(&mut self, paddr: u32, value: u32) {
        match region(paddr) {
            Region::RdramRegs => self.rdram.write_device_reg(paddr - RDRAM_REGS_BASE, value),
            Region::SpRegs => {
                let events = self.rsp.write_reg((paddr - SP_REGS_BASE) & 0x1F, value);
                if events.raise_interrupt {
                    self.mi.raise(IntSource::Sp);
                }
                if events.clear_interrupt {
                    self.mi.lower(IntSource::Sp);
                }
                self.drain_sp_dma();
            }
            Region::SpPc => self.rsp.write_pc(value),
            Region::DpRegs => self.rdp.write_reg(paddr - DP_REGS_BASE, value),
            Region::MiRegs => self.mi.write_reg(paddr - MI_REGS_BASE, value),
            Region::ViRegs => {
                let offset = paddr - VI_REGS_BASE;
                self.vi.write_reg(offset, value);
                if offset == crate::vi::VI_CURRENT_REG {
                    self.mi.lower(IntSource::Vi);
                }
            }
            Region::AiRegs => {
                let offset = paddr - AI_REGS_BASE;
                self.ai.write_reg(offset, value);
                if offset == crate::ai::AI_STATUS_REG {
                    self.mi.lower(IntSource::Ai);
                }
            }
            Region::PiRegs => {
                let offset = paddr - PI_REGS_BASE;
                self.pi.write_reg(offset, value);
                if offset == crate::pi::PI_STATUS_REG && value & 0x2 != 0 {
                    self.mi.lower(IntSource::Pi);
                }
            }
            Region::RiRegs => self.rdram.write_ri_reg(paddr - RI_REGS_BASE, value),
            Region::SiRegs => {
                let offset = paddr - SI_REGS_BASE;
                self.si.write_reg(offset, value, &mut self.pif);
                if offset == crate::si::SI_STATUS_REG {
                    self.mi.lower(IntSource::Si);
                }
            }
            _ => log::debug!("dropped register write at {:#010x}", paddr),
        }
    }

    pub fn read_block16(&mut self, paddr: u32) -> [u8; 16] {
        let mut block = [0u8; 16];
        if (paddr as usize) + 16 <= RDRAM_SIZE {
            block.copy_from_slice(&self.rdram.mem[paddr as usize..paddr as usize + 16]);
            return block;
        }
        for (i, chunk) in block.chunks_exact_mut(4).enumerate() {
            let word = self.read(paddr + 4 * i as u32, Size::Word).inner() as u32;
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        block
    }

    pub fn write_block16(&mut self, paddr: u32, block: &[u8; 16]) {
        if (paddr as usize) + 16 <= RDRAM_SIZE {
            self.rdram.mem[paddr as usize..paddr as usize + 16].copy_from_slice(block);
            return;
        }
        for (i, chunk) in block.chunks_exact(4).enumerate() {
            let word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.write(paddr + 4 * i as u32, OpResult::Word(word));
        }
    }

    // SP DMAs move whole row batches between stepper ticks.
    pub fn drain_sp_dma(&mut self) {
        let dma = match self.rsp.dma_pending.take() {
            Some(dma) => dma,
            None => return,
        };
        let length = (dma.len as usize & 0xFFF) + 1;
        let count = ((dma.len as usize >> 12) & 0xFF) + 1;
        let skip = (dma.len as usize >> 20) & 0xFFF;
        let mut mem_addr = dma.mem_addr as usize & 0x1FF8;
        let mut dram_addr = dma.dram_addr as usize & 0x00FF_FFF8;
        for _ in 0..count {
            for i in 0..length {
                if dma.to_sp {
                    let byte = *self.rdram.mem.get(dram_addr + i).unwrap_or(&0);
                    self.rsp.mem_write(mem_addr + i, byte as u64, 1);
                } else {
                    let byte = self.rsp.mem_read(mem_addr + i, 1) as u8;
                    if let Some(slot) = self.rdram.mem.get_mut(dram_addr + i) {
                        *slot = byte;
                    }
                }
            }
            mem_addr += length;
            dram_addr += length + skip;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pi::CartSave;
    use crate::rom::RomFile;

    fn test_bus() -> Bus {
        let mut cart = vec![0u8; 0x1000];
        for (i, byte) in cart.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let pi = Pi::new(RomFile { data: cart }, None, CartSave::None);
        let pif = Pif::new(vec![0xAA; 0x7C0]);
        Bus::new(pi, pif)
    }

    #[test]
    fn rdram_round_trip_all_widths() {
        let mut bus = test_bus();
        bus.write(0x1000, OpResult::Dword(0x0102_0304_0506_0708));
        assert_eq!(bus.read(0x1000, Size::Dword).inner(), 0x0102_0304_0506_0708);
        assert_eq!(bus.read(0x1004, Size::Word).inner(), 0x0506_0708);
        assert_eq!(bus.read(0x1002, Size::Half).inner(), 0x0304);
        assert_eq!(bus.read(0x1007, Size::Byte).inner(), 0x08);
    }

    #[test]
    fn open_bus_reads_zero_and_drops_writes() {
        let mut bus = test_bus();
        assert_eq!(bus.read(0x0790_0000, Size::Word).inner(), 0);
        bus.write(0x0790_0000, OpResult::Word(0xDEAD_BEEF));
        assert_eq!(bus.read(0x0790_0000, Size::Word).inner(), 0);
    }

    #[test]
    fn cart_rom_reads_route_through_pi() {
        let mut bus = test_bus();
        assert_eq!(bus.read(0x1000_0004, Size::Word).inner(), 0x0405_0607);
        // ROM writes are dropped.
        bus.write(0x1000_0004, OpResult::Word(0));
        assert_eq!(bus.read(0x1000_0004, Size::Word).inner(), 0x0405_0607);
    }

    #[test]
    fn pif_rom_and_ram_regions() {
        let mut bus = test_bus();
        assert_eq!(bus.read(0x1FC0_0000, Size::Word).inner(), 0xAAAA_AAAA);
        bus.write(0x1FC0_07C4, OpResult::Word(0x1234_5678));
        assert_eq!(bus.read(0x1FC0_07C4, Size::Word).inner(), 0x1234_5678);
        assert_eq!(bus.pif.ram[4], 0x12);
    }

    #[test]
    fn sp_mem_banks_select_on_bit_12() {
        let mut bus = test_bus();
        bus.write(0x0400_0000, OpResult::Word(0x1111_2222));
        bus.write(0x0400_1000, OpResult::Word(0x3333_4444));
        assert_eq!(bus.rsp.dmem[0], 0x11);
        assert_eq!(bus.rsp.imem[0], 0x33);
    }

    #[test]
    fn sp_dma_copies_rdram_into_dmem() {
        let mut bus = test_bus();
        for i in 0..64usize {
            bus.rdram.mem[0x2000 + i] = i as u8;
        }
        bus.write(0x0404_0000, OpResult::Word(0x100)); // SP_MEM_ADDR
        bus.write(0x0404_0004, OpResult::Word(0x2000)); // SP_DRAM_ADDR
        bus.write(0x0404_0008, OpResult::Word(63)); // SP_RD_LEN: 64 bytes
        assert_eq!(bus.rsp.dmem[0x100], 0);
        assert_eq!(bus.rsp.dmem[0x13F], 63);
    }

    #[test]
    fn mi_register_window() {
        let mut bus = test_bus();
        assert_eq!(bus.read(0x0430_0004, Size::Word).inner(), 0x0202_0102);
    }

    #[test]
    fn byte_read_of_register_extracts_lane() {
        let mut bus = test_bus();
        // MI version register, byte 0 is the high lane.
        assert_eq!(bus.read(0x0430_0004, Size::Byte).inner(), 0x02);
        assert_eq!(bus.read(0x0430_0007, Size::Byte).inner(), 0x02);
        assert_eq!(bus.read(0x0430_0006, Size::Half).inner(), 0x0102);
    }
}
