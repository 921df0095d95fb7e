// The Reality Signal Processor: a MIPS-subset scalar core over 4 KiB IMEM
// and DMEM, the SP control registers, and the vector unit. The scalar and
// vector datapaths are independent, so adjacent scalar/vector instructions
// dual-issue when neither waits on the other; a load's consumer stalls one
// cycle, driven by the decode info bits.

pub mod decode;
pub mod recip;
pub mod vector;

use decode::{decode, imm, rd, rs, rt, sa, target, Decoded, Op, BRANCH, LOAD, NEEDRS, NEEDRT,
    STORE, VECTOR};
use vector::VectorUnit;

use crate::rdp::Rdp;

pub const SP_MEM_ADDR_REG: u32 = 0x00;
pub const SP_DRAM_ADDR_REG: u32 = 0x04;
pub const SP_RD_LEN_REG: u32 = 0x08;
pub const SP_WR_LEN_REG: u32 = 0x0C;
pub const SP_STATUS_REG: u32 = 0x10;
pub const SP_DMA_FULL_REG: u32 = 0x14;
pub const SP_DMA_BUSY_REG: u32 = 0x18;
pub const SP_SEMAPHORE_REG: u32 = 0x1C;

pub const SP_STATUS_HALT: u32 = 1 << 0;
pub const SP_STATUS_BROKE: u32 = 1 << 1;
pub const SP_STATUS_SSTEP: u32 = 1 << 5;
pub const SP_STATUS_INTR_BREAK: u32 = 1 << 6;

#[derive(Debug, Clone, Copy)]
pub struct SpDma {
    pub to_sp: bool,
    pub mem_addr: u32,
    pub dram_addr: u32,
    pub len: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RspEvents {
    pub raise_interrupt: bool,
    pub clear_interrupt: bool,
}

pub struct Rsp {
    pub dmem: [u8; 0x1000],
    pub imem: [u8; 0x1000],
    pub regs: [u32; 32],
    pub pc: u32,
    next_pc: u32,
    pub vu: VectorUnit,
    status: u32,
    semaphore: bool,
    mem_addr: u32,
    dram_addr: u32,
    pub dma_pending: Option<SpDma>,
    load_dest: Option<usize>,
    events: RspEvents,
}

impl Rsp {
    pub fn new() -> Rsp {
        Rsp {
            dmem: [0; 0x1000],
            imem: [0; 0x1000],
            regs: [0; 32],
            pc: 0,
            next_pc: 4,
            vu: VectorUnit::new(),
            status: SP_STATUS_HALT,
            semaphore: false,
            mem_addr: 0,
            dram_addr: 0,
            dma_pending: None,
            load_dest: None,
            events: RspEvents::default(),
        }
    }

    pub fn halted(&self) -> bool {
        self.status & SP_STATUS_HALT != 0
    }

    fn fetch(&self, pc: u32) -> u32 {
        let at = (pc & 0xFFC) as usize;
        u32::from_be_bytes([
            self.imem[at],
            self.imem[at + 1],
            self.imem[at + 2],
            self.imem[at + 3],
        ])
    }

    // One RSP cycle: at most one scalar and one vector instruction.
    pub fn step(&mut self, dp: &mut Rdp) -> RspEvents {
        self.events = RspEvents::default();
        if self.halted() {
            return self.events;
        }
        let word = self.fetch(self.pc);
        let decoded = decode(word);

        // Load-use interlock: the consumer of last cycle's load waits a cycle.
        if let Some(dest) = self.load_dest.take() {
            if dest != 0 && waits_on(decoded, word, dest) {
                return self.events;
            }
        }

        let paired = self.try_pair(decoded, word);
        self.execute(decoded, word, dp);
        if let Some((pair_decoded, pair_word)) = paired {
            // The vector half of a dual-issue runs in the same cycle.
            self.execute(pair_decoded, pair_word, dp);
        }
        if self.status & SP_STATUS_SSTEP != 0 {
            self.status |= SP_STATUS_HALT;
        }
        self.events
    }

    // Scalar+vector pairs issue together when the second instruction is a
    // register-file vector op and the first neither branches nor touches it.
    fn try_pair(&mut self, first: Decoded, _word: u32) -> Option<(Decoded, u32)> {
        if first.info & (VECTOR | BRANCH | LOAD | STORE) != 0 {
            return None;
        }
        if matches!(first.op, Op::Mtc2 | Op::Mfc2 | Op::Cfc2 | Op::Ctc2 | Op::Break) {
            return None;
        }
        let next_word = self.fetch(self.next_pc);
        let next = decode(next_word);
        if next.info & VECTOR == 0 || next.info & (LOAD | STORE) != 0 {
            return None;
        }
        // The paired execute advances the slot itself.
        Some((next, next_word))
    }

    fn execute(&mut self, decoded: Decoded, word: u32, dp: &mut Rdp) {
        let current_pc = self.pc;
        self.pc = self.next_pc;
        self.next_pc = self.next_pc.wrapping_add(4) & 0xFFF;

        let rs_val = self.regs[rs(word)];
        let rt_val = self.regs[rt(word)];
        let immediate = imm(word);
        match decoded.op {
            Op::Invalid => {}
            Op::Sll => self.set_gpr(rd(word), rt_val << sa(word)),
            Op::Srl => self.set_gpr(rd(word), rt_val >> sa(word)),
            Op::Sra => self.set_gpr(rd(word), ((rt_val as i32) >> sa(word)) as u32),
            Op::Sllv => self.set_gpr(rd(word), rt_val << (rs_val & 0x1F)),
            Op::Srlv => self.set_gpr(rd(word), rt_val >> (rs_val & 0x1F)),
            Op::Srav => self.set_gpr(rd(word), ((rt_val as i32) >> (rs_val & 0x1F)) as u32),
            Op::Jr => self.next_pc = rs_val & 0xFFC,
            Op::Jalr => {
                self.set_gpr(rd(word), current_pc.wrapping_add(8) & 0xFFF);
                self.next_pc = rs_val & 0xFFC;
            }
            Op::Break => {
                self.status |= SP_STATUS_HALT | SP_STATUS_BROKE;
                if self.status & SP_STATUS_INTR_BREAK != 0 {
                    self.events.raise_interrupt = true;
                }
            }
            Op::Addu => self.set_gpr(rd(word), rs_val.wrapping_add(rt_val)),
            Op::Subu => self.set_gpr(rd(word), rs_val.wrapping_sub(rt_val)),
            Op::And => self.set_gpr(rd(word), rs_val & rt_val),
            Op::Or => self.set_gpr(rd(word), rs_val | rt_val),
            Op::Xor => self.set_gpr(rd(word), rs_val ^ rt_val),
            Op::Nor => self.set_gpr(rd(word), !(rs_val | rt_val)),
            Op::Slt => self.set_gpr(rd(word), ((rs_val as i32) < rt_val as i32) as u32),
            Op::Sltu => self.set_gpr(rd(word), (rs_val < rt_val) as u32),
            Op::Addiu => {
                self.set_gpr(rt(word), rs_val.wrapping_add(immediate as i16 as u32))
            }
            Op::Slti => {
                self.set_gpr(rt(word), ((rs_val as i32) < immediate as i16 as i32) as u32)
            }
            Op::Sltiu => {
                self.set_gpr(rt(word), (rs_val < immediate as i16 as u32) as u32)
            }
            Op::Andi => self.set_gpr(rt(word), rs_val & immediate as u32),
            Op::Ori => self.set_gpr(rt(word), rs_val | immediate as u32),
            Op::Xori => self.set_gpr(rt(word), rs_val ^ immediate as u32),
            Op::Lui => self.set_gpr(rt(word), (immediate as u32) << 16),
            Op::J => self.next_pc = (target(word) << 2) & 0xFFC,
            Op::Jal => {
                self.set_gpr(31, current_pc.wrapping_add(8) & 0xFFF);
                self.next_pc = (target(word) << 2) & 0xFFC;
            }
            Op::Beq => {
                if rs_val == rt_val {
                    self.branch(current_pc, immediate);
                }
            }
            Op::Bne => {
                if rs_val != rt_val {
                    self.branch(current_pc, immediate);
                }
            }
            Op::Blez => {
                if rs_val as i32 <= 0 {
                    self.branch(current_pc, immediate);
                }
            }
            Op::Bgtz => {
                if rs_val as i32 > 0 {
                    self.branch(current_pc, immediate);
                }
            }
            Op::Bltz => {
                if (rs_val as i32) < 0 {
                    self.branch(current_pc, immediate);
                }
            }
            Op::Bgez => {
                if rs_val as i32 >= 0 {
                    self.branch(current_pc, immediate);
                }
            }
            Op::Bltzal => {
                self.set_gpr(31, current_pc.wrapping_add(8) & 0xFFF);
                if (rs_val as i32) < 0 {
                    self.branch(current_pc, immediate);
                }
            }
            Op::Bgezal => {
                self.set_gpr(31, current_pc.wrapping_add(8) & 0xFFF);
                if rs_val as i32 >= 0 {
                    self.branch(current_pc, immediate);
                }
            }
            Op::Lb => {
                let addr = rs_val.wrapping_add(immediate as i16 as u32);
                let value = self.dmem[(addr & 0xFFF) as usize] as i8 as i32 as u32;
                self.set_gpr(rt(word), value);
                self.load_dest = Some(rt(word));
            }
            Op::Lbu => {
                let addr = rs_val.wrapping_add(immediate as i16 as u32);
                let value = self.dmem[(addr & 0xFFF) as usize] as u32;
                self.set_gpr(rt(word), value);
                self.load_dest = Some(rt(word));
            }
            Op::Lh => {
                let value = self.dmem_read(rs_val.wrapping_add(immediate as i16 as u32), 2);
                self.set_gpr(rt(word), value as u16 as i16 as i32 as u32);
                self.load_dest = Some(rt(word));
            }
            Op::Lhu => {
                let value = self.dmem_read(rs_val.wrapping_add(immediate as i16 as u32), 2);
                self.set_gpr(rt(word), value as u16 as u32);
                self.load_dest = Some(rt(word));
            }
            Op::Lw => {
                let value = self.dmem_read(rs_val.wrapping_add(immediate as i16 as u32), 4);
                self.set_gpr(rt(word), value);
                self.load_dest = Some(rt(word));
            }
            Op::Sb => {
                let addr = rs_val.wrapping_add(immediate as i16 as u32);
                self.dmem[(addr & 0xFFF) as usize] = rt_val as u8;
            }
            Op::Sh => self.dmem_write(rs_val.wrapping_add(immediate as i16 as u32), rt_val, 2),
            Op::Sw => self.dmem_write(rs_val.wrapping_add(immediate as i16 as u32), rt_val, 4),
            Op::Mfc0 => {
                let value = self.cop0_read(rd(word), Some(dp));
                self.set_gpr(rt(word), value);
            }
            Op::Mtc0 => self.cop0_write(rd(word), rt_val, Some(dp)),
            Op::Mfc2 => {
                let element = (word as usize >> 7) & 0xF;
                let value = self.vu.lane_read(rd(word), element) as i16 as i32 as u32;
                self.set_gpr(rt(word), value);
            }
            Op::Mtc2 => {
                let element = (word as usize >> 7) & 0xF;
                self.vu.lane_write(rd(word), element, rt_val as u16);
            }
            Op::Cfc2 => {
                let value = self.vu.cfc2(rd(word));
                self.set_gpr(rt(word), value);
            }
            Op::Ctc2 => self.vu.ctc2(rd(word), rt_val),
            Op::Vector(op) => self.vu.exec(op, word),
            Op::LoadVec(kind) => {
                let base = self.regs[rs(word)];
                self.vu.load(kind, word, base, &self.dmem);
            }
            Op::StoreVec(kind) => {
                let base = self.regs[rs(word)];
                self.vu.store(kind, word, base, &mut self.dmem);
            }
        }
    }

    fn branch(&mut self, pc: u32, offset: u16) {
        self.next_pc = pc.wrapping_add(4).wrapping_add((offset as i16 as u32) << 2) & 0xFFC;
    }

    fn set_gpr(&mut self, index: usize, value: u32) {
        if index != 0 {
            self.regs[index] = value;
        }
    }

    fn dmem_read(&self, addr: u32, size: u32) -> u32 {
        let mut value = 0u32;
        for i in 0..size {
            value = value << 8 | self.dmem[((addr + i) & 0xFFF) as usize] as u32;
        }
        value
    }

    fn dmem_write(&mut self, addr: u32, value: u32, size: u32) {
        for i in 0..size {
            self.dmem[((addr + i) & 0xFFF) as usize] = (value >> (8 * (size - 1 - i))) as u8;
        }
    }

    // COP0 registers 0..7 are the SP block, 8..15 the DP block.
    fn cop0_read(&mut self, reg: usize, dp: Option<&mut Rdp>) -> u32 {
        match reg {
            0 => self.mem_addr,
            1 => self.dram_addr,
            2 | 3 => 0,
            4 => self.status,
            5 => 0, // DMA full
            6 => self.dma_pending.is_some() as u32,
            7 => {
                if self.semaphore {
                    1
                } else {
                    self.semaphore = true;
                    0
                }
            }
            8..=15 => match dp {
                Some(dp) => dp.read_reg(((reg - 8) as u32) << 2),
                None => 0,
            },
            _ => 0,
        }
    }

    fn cop0_write(&mut self, reg: usize, value: u32, dp: Option<&mut Rdp>) {
        match reg {
            0 => self.mem_addr = value & 0x1FFF,
            1 => self.dram_addr = value & 0x00FF_FFFF,
            2 => self.queue_dma(true, value),
            3 => self.queue_dma(false, value),
            4 => self.status_write(value),
            7 => self.semaphore = false,
            8..=15 => {
                if let Some(dp) = dp {
                    dp.write_reg(((reg - 8) as u32) << 2, value);
                }
            }
            _ => {}
        }
    }

    fn queue_dma(&mut self, to_sp: bool, len: u32) {
        self.dma_pending = Some(SpDma {
            to_sp,
            mem_addr: self.mem_addr,
            dram_addr: self.dram_addr,
            len,
        });
    }

    fn status_write(&mut self, value: u32) {
        if value & (1 << 0) != 0 {
            self.status &= !SP_STATUS_HALT;
        }
        if value & (1 << 1) != 0 {
            self.status |= SP_STATUS_HALT;
        }
        if value & (1 << 2) != 0 {
            self.status &= !SP_STATUS_BROKE;
        }
        if value & (1 << 3) != 0 {
            self.events.clear_interrupt = true;
        }
        if value & (1 << 4) != 0 {
            self.events.raise_interrupt = true;
        }
        if value & (1 << 5) != 0 {
            self.status &= !SP_STATUS_SSTEP;
        }
        if value & (1 << 6) != 0 {
            self.status |= SP_STATUS_SSTEP;
        }
        if value & (1 << 7) != 0 {
            self.status &= !SP_STATUS_INTR_BREAK;
        }
        if value & (1 << 8) != 0 {
            self.status |= SP_STATUS_INTR_BREAK;
        }
        for signal in 0..8 {
            let bit = 1u32 << (7 + signal);
            if value & (1 << (9 + 2 * signal)) != 0 {
                self.status &= !bit;
            }
            if value & (1 << (10 + 2 * signal)) != 0 {
                self.status |= bit;
            }
        }
    }

    // The memory-mapped face of the SP registers, shared with the VR4300.
    pub fn read_reg(&mut self, offset: u32) -> u32 {
        match offset {
            SP_MEM_ADDR_REG => self.mem_addr,
            SP_DRAM_ADDR_REG => self.dram_addr,
            SP_RD_LEN_REG | SP_WR_LEN_REG => 0,
            SP_STATUS_REG => self.status,
            SP_DMA_FULL_REG => 0,
            SP_DMA_BUSY_REG => self.dma_pending.is_some() as u32,
            SP_SEMAPHORE_REG => {
                if self.semaphore {
                    1
                } else {
                    self.semaphore = true;
                    0
                }
            }
            _ => 0,
        }
    }

    pub fn write_reg(&mut self, offset: u32, value: u32) -> RspEvents {
        self.events = RspEvents::default();
        match offset {
            SP_MEM_ADDR_REG => self.mem_addr = value & 0x1FFF,
            SP_DRAM_ADDR_REG => self.dram_addr = value & 0x00FF_FFFF,
            SP_RD_LEN_REG => self.queue_dma(true, value),
            SP_WR_LEN_REG => self.queue_dma(false, value),
            SP_STATUS_REG => self.status_write(value),
            SP_SEMAPHORE_REG => self.semaphore = false,
            _ => {}
        }
        self.events
    }

    pub fn read_pc(&self) -> u32 {
        self.pc & 0xFFC
    }

    pub fn write_pc(&mut self, value: u32) {
        self.pc = value & 0xFFC;
        self.next_pc = self.pc.wrapping_add(4) & 0xFFF;
    }

    pub fn mem_read(&self, offset: usize, size: usize) -> u64 {
        let bank = if offset & 0x1000 != 0 { &self.imem } else { &self.dmem };
        let mut value = 0u64;
        for i in 0..size {
            value = value << 8 | bank[(offset + i) & 0xFFF] as u64;
        }
        value
    }

    pub fn mem_write(&mut self, offset: usize, value: u64, size: usize) {
        let bank = if offset & 0x1000 != 0 { &mut self.imem } else { &mut self.dmem };
        for i in 0..size {
            bank[(offset + i) & 0xFFF] = (value >> (8 * (size - 1 - i))) as u8;
        }
    }
}

fn waits_on(decoded: Decoded, word: u32, dest: usize) -> bool {
    (decoded.info & NEEDRS != 0 && rs(word) == dest)
        || (decoded.info & NEEDRT != 0 && rt(word) == dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdp::Rdp;

    fn assemble(words: &[u32]) -> Rsp {
        let mut rsp = Rsp::new();
        for (i, word) in words.iter().enumerate() {
            rsp.imem[4 * i..4 * i + 4].copy_from_slice(&word.to_be_bytes());
        }
        rsp.write_reg(SP_STATUS_REG, 1); // clear halt
        rsp
    }

    fn run(rsp: &mut Rsp, cycles: usize) {
        let mut dp = Rdp::new();
        for _ in 0..cycles {
            rsp.step(&mut dp);
        }
    }

    #[test]
    fn r0_stays_zero() {
        // addiu $0, $0, 0x123 ; addiu $1, $0, 5
        let mut rsp = assemble(&[0x2400_0123, 0x2401_0005]);
        run(&mut rsp, 2);
        assert_eq!(rsp.regs[0], 0);
        assert_eq!(rsp.regs[1], 5);
    }

    #[test]
    fn branch_has_delay_slot() {
        // beq $0, $0, +2 ; addiu $1, $0, 1 (delay) ; addiu $2, $0, 2 (skipped)
        // target: addiu $3, $0, 3
        let mut rsp = assemble(&[0x1000_0002, 0x2401_0001, 0x2402_0002, 0x2403_0003]);
        run(&mut rsp, 3);
        assert_eq!(rsp.regs[1], 1);
        assert_eq!(rsp.regs[2], 0);
        assert_eq!(rsp.regs[3], 3);
    }

    #[test]
    fn load_use_stalls_a_cycle() {
        let mut rsp = assemble(&[
            0x8C01_0100, // lw $1, 0x100($0)
            0x2422_0001, // addiu $2, $1, 1
        ]);
        rsp.dmem[0x100..0x104].copy_from_slice(&0x0000_0041u32.to_be_bytes());
        run(&mut rsp, 2);
        // Two cycles in, the dependent add has stalled and not retired.
        assert_eq!(rsp.regs[2], 0);
        run(&mut rsp, 1);
        assert_eq!(rsp.regs[2], 0x42);
    }

    #[test]
    fn dual_issue_scalar_with_vector() {
        // addiu $1, $0, 7 ; vadd $v3, $v1, $v2 -- one cycle for both
        let vadd = (0x12 << 26) | (1 << 25) | (2 << 16) | (1 << 11) | (3 << 6) | 0x10;
        let mut rsp = assemble(&[0x2401_0007, vadd, 0x2404_0009]);
        rsp.vu.vr[1] = [1; 8];
        rsp.vu.vr[2] = [2; 8];
        run(&mut rsp, 1);
        assert_eq!(rsp.regs[1], 7);
        assert_eq!(rsp.vu.vr[3][0], 3);
        run(&mut rsp, 1);
        assert_eq!(rsp.regs[4], 9);
    }

    #[test]
    fn break_halts_and_raises_when_enabled() {
        let mut rsp = assemble(&[0x0000_000D]); // break
        rsp.write_reg(SP_STATUS_REG, (1 << 8) | 1); // intr-on-break + clear halt
        let mut dp = Rdp::new();
        let events = rsp.step(&mut dp);
        assert!(rsp.halted());
        assert!(rsp.read_reg(SP_STATUS_REG) & SP_STATUS_BROKE != 0);
        assert!(events.raise_interrupt);
    }

    #[test]
    fn semaphore_read_acquires() {
        let mut rsp = Rsp::new();
        assert_eq!(rsp.read_reg(SP_SEMAPHORE_REG), 0);
        assert_eq!(rsp.read_reg(SP_SEMAPHORE_REG), 1);
        rsp.write_reg(SP_SEMAPHORE_REG, 0);
        assert_eq!(rsp.read_reg(SP_SEMAPHORE_REG), 0);
    }

    #[test]
    fn dma_write_queues_request() {
        let mut rsp = Rsp::new();
        rsp.write_reg(SP_MEM_ADDR_REG, 0x100);
        rsp.write_reg(SP_DRAM_ADDR_REG, 0x2000);
        rsp.write_reg(SP_RD_LEN_REG, 0x3F);
        let dma = rsp.dma_pending.expect("queued");
        assert!(dma.to_sp);
        assert_eq!(dma.mem_addr, 0x100);
        assert_eq!(dma.dram_addr, 0x2000);
    }

    #[test]
    fn single_step_rehalts() {
        let mut rsp = assemble(&[0x2401_0001, 0x2402_0002]);
        rsp.write_reg(SP_STATUS_REG, (1 << 6) | 1); // set sstep, clear halt
        run(&mut rsp, 4);
        assert_eq!(rsp.regs[1], 1);
        assert_eq!(rsp.regs[2], 0); // halted again after one instruction
    }
}
