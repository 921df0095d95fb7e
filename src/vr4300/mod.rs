// The VR4300 main processor: an in-order five-stage pipeline over the system
// bus, with split caches, a software-managed TLB, and precise exceptions.
// Instructions issue one per cycle; stall cycles accumulate from cache fills,
// the load-use interlock, and the multiplier, and are burned off before the
// next issue. Faults flush the younger stages by construction, because
// nothing younger has executed yet when a fault dispatches.

pub mod cp0;
pub mod cp1;
pub mod dcache;
pub mod decode;
pub mod icache;
pub mod tlb;

use crate::bus::{Bus, OpResult, Size};
use cp0::Cp0;
use cp1::Cp1;
use dcache::DCache;
use decode::{decode, imm, rd, rs, rt, sa, simm, target, Op, FPU, LIKELY, NEEDRS, NEEDRT};
use icache::ICache;
use tlb::Tlb;

const RESET_VECTOR: u64 = 0xFFFF_FFFF_BFC0_0000;

const ICACHE_FILL_CYCLES: u32 = 20;
const DCACHE_FILL_CYCLES: u32 = 14;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Exception {
    Interrupt,
    TlbMod(u64),
    TlbLoad { vaddr: u64, refill: bool },
    TlbStore { vaddr: u64, refill: bool },
    AddressErrorLoad(u64),
    AddressErrorStore(u64),
    BusErrorFetch,
    BusErrorData,
    Syscall,
    Breakpoint,
    Reserved,
    CopUnusable(u8),
    Overflow,
    Trap,
    FloatingPoint,
    Watch,
}

impl Exception {
    fn code(&self) -> u64 {
        match self {
            Exception::Interrupt => 0,
            Exception::TlbMod(_) => 1,
            Exception::TlbLoad { .. } => 2,
            Exception::TlbStore { .. } => 3,
            Exception::AddressErrorLoad(_) => 4,
            Exception::AddressErrorStore(_) => 5,
            Exception::BusErrorFetch => 6,
            Exception::BusErrorData => 7,
            Exception::Syscall => 8,
            Exception::Breakpoint => 9,
            Exception::Reserved => 10,
            Exception::CopUnusable(_) => 11,
            Exception::Overflow => 12,
            Exception::Trap => 13,
            Exception::FloatingPoint => 15,
            Exception::Watch => 23,
        }
    }
}

// Retired-instruction record kept per stage for interlocks and the debugger.
#[derive(Debug, Clone, Copy)]
pub struct StageLatch {
    pub pc: u64,
    pub word: u32,
    pub dest: usize,
    pub is_load: bool,
}

pub struct Pipeline {
    // WB-most first: [dc, ex, rf, ic] of previously issued instructions.
    pub latches: [Option<StageLatch>; 4],
    pub stall: u32,
}

impl Pipeline {
    fn new() -> Pipeline {
        Pipeline { latches: [None; 4], stall: 0 }
    }

    fn push(&mut self, latch: StageLatch) {
        self.latches.rotate_right(1);
        self.latches[0] = Some(latch);
    }

    fn flush(&mut self) {
        self.latches = [None; 4];
    }
}

pub struct Vr4300 {
    pub regs: [u64; 32],
    pub hi: u64,
    pub lo: u64,
    pub pc: u64,
    next_pc: u64,
    branch_delay: bool,
    ll_bit: bool,
    mult_ready_at: u64,
    pub cp0: Cp0,
    pub cp1: Cp1,
    pub tlb: Tlb,
    pub icache: ICache,
    pub dcache: DCache,
    pub pipe: Pipeline,
    pub cycles: u64,
}

enum MemSegment {
    Direct { paddr: u32, cached: bool },
    Mapped,
}

impl Vr4300 {
    pub fn new() -> Vr4300 {
        Vr4300 {
            regs: [0; 32],
            hi: 0,
            lo: 0,
            pc: RESET_VECTOR,
            next_pc: RESET_VECTOR + 4,
            branch_delay: false,
            ll_bit: false,
            mult_ready_at: 0,
            cp0: Cp0::new(),
            cp1: Cp1::new(),
            tlb: Tlb::new(),
            icache: ICache::new(),
            dcache: DCache::new(),
            pipe: Pipeline::new(),
            cycles: 0,
        }
    }

    fn set_gpr(&mut self, index: usize, value: u64) {
        if index != 0 {
            self.regs[index] = value;
        }
    }

    // One CPU cycle. Either burns a stall cycle or issues one instruction.
    pub fn step(&mut self, bus: &mut Bus) {
        self.cycles += 1;
        self.cp0.tick();
        self.cp0.set_int_line(2, bus.mi.cpu_int_asserted());

        if self.pipe.stall > 0 {
            self.pipe.stall -= 1;
            return;
        }

        if self.cp0.pending_interrupt() {
            self.dispatch(Exception::Interrupt, self.pc, self.branch_delay);
            return;
        }

        let pc = self.pc;
        let in_delay = self.branch_delay;
        let word = match self.fetch(bus, pc) {
            Ok(word) => word,
            Err(exception) => {
                self.dispatch(exception, pc, in_delay);
                return;
            }
        };
        let decoded = decode(word);

        // Load-use interlock against the instruction one stage ahead.
        if let Some(latch) = self.pipe.latches[0] {
            if latch.is_load && latch.dest != 0 {
                let uses = (decoded.info & NEEDRS != 0 && rs(word) == latch.dest)
                    || (decoded.info & NEEDRT != 0 && rt(word) == latch.dest);
                if uses {
                    self.pipe.stall += 1;
                }
            }
        }

        // COP1 unusable gates every FPU-flagged encoding.
        if decoded.info & FPU != 0 && self.cp0.status() & cp0::STATUS_CU1 == 0 {
            self.dispatch(Exception::CopUnusable(1), pc, in_delay);
            return;
        }

        self.pc = self.next_pc;
        self.next_pc = self.next_pc.wrapping_add(4);
        self.branch_delay = false;

        let dest = if decoded.info & decode::WRITES_RT != 0 {
            rt(word)
        } else if decoded.info & decode::WRITES_RD != 0 {
            rd(word)
        } else {
            0
        };
        self.pipe.push(StageLatch {
            pc,
            word,
            dest,
            is_load: decoded.info & decode::LOAD != 0,
        });

        if let Err(exception) = self.execute(bus, decoded.op, decoded.info, word, pc, in_delay) {
            self.dispatch(exception, pc, in_delay);
        }
    }

    fn fetch(&mut self, bus: &mut Bus, vaddr: u64) -> Result<u32, Exception> {
        if vaddr & 3 != 0 {
            return Err(Exception::AddressErrorLoad(vaddr));
        }
        let (paddr, cached) = self.translate(vaddr, false)?;
        if !cached {
            return Ok(bus.read(paddr, Size::Word).inner() as u32);
        }
        if let Some(word) = self.icache.fetch_word(vaddr, paddr) {
            return Ok(word);
        }
        let block = bus.read_block16(paddr & !0xF);
        self.icache.fill(vaddr, paddr & !0xF, &block);
        self.pipe.stall += ICACHE_FILL_CYCLES;
        Ok(self.icache.fetch_word(vaddr, paddr).unwrap_or(0))
    }

    fn segment(&self, vaddr: u64) -> Result<MemSegment, ()> {
        let va = vaddr as u32;
        // 32-bit compatibility segments; addresses arrive sign-extended.
        match va >> 29 {
            0b100 => Ok(MemSegment::Direct { paddr: va & 0x1FFF_FFFF, cached: true }),
            0b101 => Ok(MemSegment::Direct { paddr: va & 0x1FFF_FFFF, cached: false }),
            _ => Ok(MemSegment::Mapped),
        }
    }

    fn translate(&mut self, vaddr: u64, store: bool) -> Result<(u32, bool), Exception> {
        match self.segment(vaddr) {
            Ok(MemSegment::Direct { paddr, cached }) => Ok((paddr, cached)),
            Ok(MemSegment::Mapped) => {
                let asid = self.cp0.asid();
                match self.tlb.lookup(vaddr, asid) {
                    Some(hit) if hit.valid => {
                        if store && !hit.dirty {
                            self.cp0.set_tlb_fault_state(vaddr);
                            return Err(Exception::TlbMod(vaddr));
                        }
                        Ok((hit.pfn, hit.cached))
                    }
                    Some(_) => {
                        self.cp0.set_tlb_fault_state(vaddr);
                        Err(if store {
                            Exception::TlbStore { vaddr, refill: false }
                        } else {
                            Exception::TlbLoad { vaddr, refill: false }
                        })
                    }
                    None => {
                        self.cp0.set_tlb_fault_state(vaddr);
                        Err(if store {
                            Exception::TlbStore { vaddr, refill: true }
                        } else {
                            Exception::TlbLoad { vaddr, refill: true }
                        })
                    }
                }
            }
            Err(()) => Err(Exception::AddressErrorLoad(vaddr)),
        }
    }

    pub fn read_virt(&mut self, bus: &mut Bus, vaddr: u64, size: usize) -> Result<u64, Exception> {
        if vaddr & (size as u64 - 1) != 0 {
            self.cp0.regs[cp0::BAD_VADDR] = vaddr;
            return Err(Exception::AddressErrorLoad(vaddr));
        }
        let (paddr, cached) = self.translate(vaddr, false)?;
        if self.watch_hits(paddr, false) {
            return Err(Exception::Watch);
        }
        if !cached {
            return Ok(bus.read(paddr, Size::from_bytes(size)).inner());
        }
        if let Some(value) = self.dcache.read(vaddr, paddr, size) {
            return Ok(value);
        }
        self.refill_dcache(bus, vaddr, paddr);
        Ok(self.dcache.read(vaddr, paddr, size).unwrap_or(0))
    }

    pub fn write_virt(
        &mut self,
        bus: &mut Bus,
        vaddr: u64,
        value: u64,
        size: usize,
    ) -> Result<(), Exception> {
        if vaddr & (size as u64 - 1) != 0 {
            self.cp0.regs[cp0::BAD_VADDR] = vaddr;
            return Err(Exception::AddressErrorStore(vaddr));
        }
        let (paddr, cached) = self.translate(vaddr, true)?;
        if self.watch_hits(paddr, true) {
            return Err(Exception::Watch);
        }
        if !cached {
            bus.write(paddr, OpResult::from_bytes(value, size));
            return Ok(());
        }
        if !self.dcache.write(vaddr, paddr, value, size) {
            // Write-allocate: fill, then hit.
            self.refill_dcache(bus, vaddr, paddr);
            self.dcache.write(vaddr, paddr, value, size);
        }
        Ok(())
    }

    // Watchpoints compare the physical doubleword; masked while EXL is up.
    fn watch_hits(&self, paddr: u32, store: bool) -> bool {
        let watch = self.cp0.regs[cp0::WATCH_LO];
        let armed = if store { watch & 1 != 0 } else { watch & 2 != 0 };
        if !armed || self.cp0.regs[cp0::STATUS] & cp0::STATUS_EXL != 0 {
            return false;
        }
        (paddr as u64 & !7) == (watch & 0xFFFF_FFF8)
    }

    // A dirty victim writes back before the replacement fill.
    fn refill_dcache(&mut self, bus: &mut Bus, vaddr: u64, paddr: u32) {
        if self.dcache.should_flush_line(vaddr).is_some() {
            if let Some((victim_paddr, data)) = self.dcache.wb_invalidate(vaddr) {
                bus.write_block16(victim_paddr, &data);
            }
        }
        let block = bus.read_block16(paddr & !0xF);
        self.dcache.fill(vaddr, paddr & !0xF, &block);
        self.pipe.stall += DCACHE_FILL_CYCLES;
    }

    fn dispatch(&mut self, exception: Exception, pc: u64, in_delay: bool) {
        let status = self.cp0.regs[cp0::STATUS];
        let refill = matches!(
            exception,
            Exception::TlbLoad { refill: true, .. } | Exception::TlbStore { refill: true, .. }
        );
        match exception {
            Exception::AddressErrorLoad(vaddr) | Exception::AddressErrorStore(vaddr) => {
                self.cp0.regs[cp0::BAD_VADDR] = vaddr;
            }
            _ => {}
        }
        if status & cp0::STATUS_EXL == 0 {
            let epc = if in_delay { pc.wrapping_sub(4) } else { pc };
            self.cp0.regs[cp0::EPC] = epc;
            let mut cause = self.cp0.regs[cp0::CAUSE] & !(0x1F << 2) & !cp0::CAUSE_BD;
            cause |= exception.code() << 2;
            if in_delay {
                cause |= cp0::CAUSE_BD;
            }
            if let Exception::CopUnusable(unit) = exception {
                cause = (cause & !(3 << 28)) | ((unit as u64) << 28);
            }
            self.cp0.regs[cp0::CAUSE] = cause;
        } else {
            let mut cause = self.cp0.regs[cp0::CAUSE] & !(0x1F << 2);
            cause |= exception.code() << 2;
            self.cp0.regs[cp0::CAUSE] = cause;
        }
        let nested = status & cp0::STATUS_EXL != 0;
        self.cp0.regs[cp0::STATUS] = status | cp0::STATUS_EXL;

        let base: u64 = if status & cp0::STATUS_BEV != 0 {
            0xFFFF_FFFF_BFC0_0200
        } else {
            0xFFFF_FFFF_8000_0000
        };
        let offset: u64 = if refill && !nested { 0x000 } else { 0x180 };
        self.pc = base.wrapping_add(offset);
        self.next_pc = self.pc.wrapping_add(4);
        self.branch_delay = false;
        self.ll_bit = false;
        self.pipe.flush();
    }

    fn branch_to(&mut self, target: u64) {
        self.next_pc = target;
        self.branch_delay = true;
    }

    fn branch_cond(&mut self, pc: u64, word: u32, taken: bool, likely: bool) {
        if taken {
            let offset = (simm(word) as u64) << 2;
            self.branch_to(pc.wrapping_add(4).wrapping_add(offset));
        } else if likely {
            // A mispredicted likely form annuls its delay slot.
            self.pc = self.next_pc;
            self.next_pc = self.next_pc.wrapping_add(4);
        }
    }

    fn execute(
        &mut self,
        bus: &mut Bus,
        op: Op,
        info: u16,
        word: u32,
        pc: u64,
        _in_delay: bool,
    ) -> Result<(), Exception> {
        let rs_val = self.regs[rs(word)];
        let rt_val = self.regs[rt(word)];
        let likely = info & LIKELY != 0;
        match op {
            Op::Reserved => return Err(Exception::Reserved),
            Op::Sll => self.set_gpr(rd(word), (rt_val as u32) .wrapping_shl(sa(word)) as i32 as u64),
            Op::Srl => self.set_gpr(rd(word), ((rt_val as u32) >> sa(word)) as i32 as u64),
            Op::Sra => self.set_gpr(rd(word), ((rt_val as i32) >> sa(word)) as u64),
            Op::Sllv => {
                self.set_gpr(rd(word), (rt_val as u32).wrapping_shl(rs_val as u32 & 31) as i32 as u64)
            }
            Op::Srlv => {
                self.set_gpr(rd(word), ((rt_val as u32) >> (rs_val as u32 & 31)) as i32 as u64)
            }
            Op::Srav => {
                self.set_gpr(rd(word), ((rt_val as i32) >> (rs_val as u32 & 31)) as u64)
            }
            Op::Jr => self.branch_to(rs_val),
            Op::Jalr => {
                self.set_gpr(rd(word), pc.wrapping_add(8));
                self.branch_to(rs_val);
            }
            Op::Syscall => return Err(Exception::Syscall),
            Op::Break => return Err(Exception::Breakpoint),
            Op::Sync => {}
            Op::Mfhi => {
                self.wait_mult();
                self.set_gpr(rd(word), self.hi);
            }
            Op::Mthi => self.hi = rs_val,
            Op::Mflo => {
                self.wait_mult();
                self.set_gpr(rd(word), self.lo);
            }
            Op::Mtlo => self.lo = rs_val,
            Op::Dsllv => self.set_gpr(rd(word), rt_val.wrapping_shl(rs_val as u32 & 63)),
            Op::Dsrlv => self.set_gpr(rd(word), rt_val.wrapping_shr(rs_val as u32 & 63)),
            Op::Dsrav => self.set_gpr(rd(word), ((rt_val as i64) >> (rs_val as u32 & 63)) as u64),
            Op::Mult => {
                let product = (rs_val as i32 as i64) * (rt_val as i32 as i64);
                self.lo = product as i32 as u64;
                self.hi = (product >> 32) as i32 as u64;
                self.mult_ready_at = self.cycles + 5;
            }
            Op::Multu => {
                let product = (rs_val as u32 as u64) * (rt_val as u32 as u64);
                self.lo = product as i32 as u64;
                self.hi = (product >> 32) as i32 as u64;
                self.mult_ready_at = self.cycles + 5;
            }
            Op::Div => {
                let dividend = rs_val as i32;
                let divisor = rt_val as i32;
                if divisor == 0 {
                    self.lo = if dividend < 0 { 1 } else { -1i64 as u64 };
                    self.hi = dividend as i64 as u64;
                } else if dividend == i32::min_value() && divisor == -1 {
                    self.lo = dividend as i64 as u64;
                    self.hi = 0;
                } else {
                    self.lo = (dividend / divisor) as i64 as u64;
                    self.hi = (dividend % divisor) as i64 as u64;
                }
                self.mult_ready_at = self.cycles + 37;
            }
            Op::Divu => {
                let dividend = rs_val as u32;
                let divisor = rt_val as u32;
                if divisor == 0 {
                    self.lo = -1i64 as u64;
                    self.hi = dividend as i32 as u64;
                } else {
                    self.lo = (dividend / divisor) as i32 as u64;
                    self.hi = (dividend % divisor) as i32 as u64;
                }
                self.mult_ready_at = self.cycles + 37;
            }
            Op::Dmult => {
                let product = (rs_val as i64 as i128) * (rt_val as i64 as i128);
                self.lo = product as u64;
                self.hi = (product >> 64) as u64;
                self.mult_ready_at = self.cycles + 8;
            }
            Op::Dmultu => {
                let product = (rs_val as u128) * (rt_val as u128);
                self.lo = product as u64;
                self.hi = (product >> 64) as u64;
                self.mult_ready_at = self.cycles + 8;
            }
            Op::Ddiv => {
                let dividend = rs_val as i64;
                let divisor = rt_val as i64;
                if divisor == 0 {
                    self.lo = if dividend < 0 { 1 } else { -1i64 as u64 };
                    self.hi = dividend as u64;
                } else if dividend == i64::min_value() && divisor == -1 {
                    self.lo = dividend as u64;
                    self.hi = 0;
                } else {
                    self.lo = (dividend / divisor) as u64;
                    self.hi = (dividend % divisor) as u64;
                }
                self.mult_ready_at = self.cycles + 69;
            }
            Op::Ddivu => {
                let dividend = rs_val;
                let divisor = rt_val;
                if divisor == 0 {
                    self.lo = -1i64 as u64;
                    self.hi = dividend;
                } else {
                    self.lo = dividend / divisor;
                    self.hi = dividend % divisor;
                }
                self.mult_ready_at = self.cycles + 69;
            }
            Op::Add => {
                let (sum, overflow) = (rs_val as i32).overflowing_add(rt_val as i32);
                if overflow {
                    return Err(Exception::Overflow);
                }
                self.set_gpr(rd(word), sum as u64);
            }
            Op::Addu => {
                self.set_gpr(rd(word), (rs_val as i32).wrapping_add(rt_val as i32) as u64)
            }
            Op::Sub => {
                let (diff, overflow) = (rs_val as i32).overflowing_sub(rt_val as i32);
                if overflow {
                    return Err(Exception::Overflow);
                }
                self.set_gpr(rd(word), diff as u64);
            }
            Op::Subu => {
                self.set_gpr(rd(word), (rs_val as i32).wrapping_sub(rt_val as i32) as u64)
            }
            Op::And => self.set_gpr(rd(word), rs_val & rt_val),
            Op::Or => self.set_gpr(rd(word), rs_val | rt_val),
            Op::Xor => self.set_gpr(rd(word), rs_val ^ rt_val),
            Op::Nor => self.set_gpr(rd(word), !(rs_val | rt_val)),
            Op::Slt => self.set_gpr(rd(word), ((rs_val as i64) < rt_val as i64) as u64),
            Op::Sltu => self.set_gpr(rd(word), (rs_val < rt_val) as u64),
            Op::Dadd => {
                let (sum, overflow) = (rs_val as i64).overflowing_add(rt_val as i64);
                if overflow {
                    return Err(Exception::Overflow);
                }
                self.set_gpr(rd(word), sum as u64);
            }
            Op::Daddu => self.set_gpr(rd(word), rs_val.wrapping_add(rt_val)),
            Op::Dsub => {
                let (diff, overflow) = (rs_val as i64).overflowing_sub(rt_val as i64);
                if overflow {
                    return Err(Exception::Overflow);
                }
                self.set_gpr(rd(word), diff as u64);
            }
            Op::Dsubu => self.set_gpr(rd(word), rs_val.wrapping_sub(rt_val)),
            Op::Tge => {
                if rs_val as i64 >= rt_val as i64 {
                    return Err(Exception::Trap);
                }
            }
            Op::Tgeu => {
                if rs_val >= rt_val {
                    return Err(Exception::Trap);
                }
            }
            Op::Tlt => {
                if (rs_val as i64) < rt_val as i64 {
                    return Err(Exception::Trap);
                }
            }
            Op::Tltu => {
                if rs_val < rt_val {
                    return Err(Exception::Trap);
                }
            }
            Op::Teq => {
                if rs_val == rt_val {
                    return Err(Exception::Trap);
                }
            }
            Op::Tne => {
                if rs_val != rt_val {
                    return Err(Exception::Trap);
                }
            }
            Op::Dsll => self.set_gpr(rd(word), rt_val << sa(word)),
            Op::Dsrl => self.set_gpr(rd(word), rt_val >> sa(word)),
            Op::Dsra => self.set_gpr(rd(word), ((rt_val as i64) >> sa(word)) as u64),
            Op::Dsll32 => self.set_gpr(rd(word), rt_val << (sa(word) + 32)),
            Op::Dsrl32 => self.set_gpr(rd(word), rt_val >> (sa(word) + 32)),
            Op::Dsra32 => self.set_gpr(rd(word), ((rt_val as i64) >> (sa(word) + 32)) as u64),
            Op::Bltz | Op::Bltzl => {
                self.branch_cond(pc, word, (rs_val as i64) < 0, likely)
            }
            Op::Bgez | Op::Bgezl => {
                self.branch_cond(pc, word, rs_val as i64 >= 0, likely)
            }
            Op::Bltzal | Op::Bltzall => {
                self.set_gpr(31, pc.wrapping_add(8));
                self.branch_cond(pc, word, (rs_val as i64) < 0, likely);
            }
            Op::Bgezal | Op::Bgezall => {
                self.set_gpr(31, pc.wrapping_add(8));
                self.branch_cond(pc, word, rs_val as i64 >= 0, likely);
            }
            Op::Tgei => {
                if rs_val as i64 >= simm(word) {
                    return Err(Exception::Trap);
                }
            }
            Op::Tgeiu => {
                if rs_val >= simm(word) as u64 {
                    return Err(Exception::Trap);
                }
            }
            Op::Tlti => {
                if (rs_val as i64) < simm(word) {
                    return Err(Exception::Trap);
                }
            }
            Op::Tltiu => {
                if rs_val < simm(word) as u64 {
                    return Err(Exception::Trap);
                }
            }
            Op::Teqi => {
                if rs_val as i64 == simm(word) {
                    return Err(Exception::Trap);
                }
            }
            Op::Tnei => {
                if rs_val as i64 != simm(word) {
                    return Err(Exception::Trap);
                }
            }
            Op::J => {
                let dest = (pc.wrapping_add(4) & 0xFFFF_FFFF_F000_0000) | target(word);
                self.branch_to(dest);
            }
            Op::Jal => {
                self.set_gpr(31, pc.wrapping_add(8));
                let dest = (pc.wrapping_add(4) & 0xFFFF_FFFF_F000_0000) | target(word);
                self.branch_to(dest);
            }
            Op::Beq | Op::Beql => self.branch_cond(pc, word, rs_val == rt_val, likely),
            Op::Bne | Op::Bnel => self.branch_cond(pc, word, rs_val != rt_val, likely),
            Op::Blez | Op::Blezl => self.branch_cond(pc, word, rs_val as i64 <= 0, likely),
            Op::Bgtz | Op::Bgtzl => self.branch_cond(pc, word, rs_val as i64 > 0, likely),
            Op::Addi => {
                let (sum, overflow) = (rs_val as i32).overflowing_add(simm(word) as i32);
                if overflow {
                    return Err(Exception::Overflow);
                }
                self.set_gpr(rt(word), sum as u64);
            }
            Op::Addiu => {
                self.set_gpr(rt(word), (rs_val as i32).wrapping_add(simm(word) as i32) as u64)
            }
            Op::Slti => self.set_gpr(rt(word), ((rs_val as i64) < simm(word)) as u64),
            Op::Sltiu => self.set_gpr(rt(word), (rs_val < simm(word) as u64) as u64),
            Op::Andi => self.set_gpr(rt(word), rs_val & imm(word) as u64),
            Op::Ori => self.set_gpr(rt(word), rs_val | imm(word) as u64),
            Op::Xori => self.set_gpr(rt(word), rs_val ^ imm(word) as u64),
            Op::Lui => self.set_gpr(rt(word), ((imm(word) as u32) << 16) as i32 as u64),
            Op::Daddi => {
                let (sum, overflow) = (rs_val as i64).overflowing_add(simm(word));
                if overflow {
                    return Err(Exception::Overflow);
                }
                self.set_gpr(rt(word), sum as u64);
            }
            Op::Daddiu => self.set_gpr(rt(word), rs_val.wrapping_add(simm(word) as u64)),
            Op::Lb => {
                let value = self.read_virt(bus, rs_val.wrapping_add(simm(word) as u64), 1)?;
                self.set_gpr(rt(word), value as u8 as i8 as i64 as u64);
            }
            Op::Lbu => {
                let value = self.read_virt(bus, rs_val.wrapping_add(simm(word) as u64), 1)?;
                self.set_gpr(rt(word), value as u8 as u64);
            }
            Op::Lh => {
                let value = self.read_virt(bus, rs_val.wrapping_add(simm(word) as u64), 2)?;
                self.set_gpr(rt(word), value as u16 as i16 as i64 as u64);
            }
            Op::Lhu => {
                let value = self.read_virt(bus, rs_val.wrapping_add(simm(word) as u64), 2)?;
                self.set_gpr(rt(word), value as u16 as u64);
            }
            Op::Lw => {
                let value = self.read_virt(bus, rs_val.wrapping_add(simm(word) as u64), 4)?;
                self.set_gpr(rt(word), value as u32 as i32 as i64 as u64);
            }
            Op::Lwu => {
                let value = self.read_virt(bus, rs_val.wrapping_add(simm(word) as u64), 4)?;
                self.set_gpr(rt(word), value as u32 as u64);
            }
            Op::Ld => {
                let value = self.read_virt(bus, rs_val.wrapping_add(simm(word) as u64), 8)?;
                self.set_gpr(rt(word), value);
            }
            Op::Ll => {
                let vaddr = rs_val.wrapping_add(simm(word) as u64);
                let value = self.read_virt(bus, vaddr, 4)?;
                self.set_gpr(rt(word), value as u32 as i32 as i64 as u64);
                self.ll_bit = true;
                self.cp0.regs[cp0::LL_ADDR] = vaddr >> 4;
            }
            Op::Lld => {
                let vaddr = rs_val.wrapping_add(simm(word) as u64);
                let value = self.read_virt(bus, vaddr, 8)?;
                self.set_gpr(rt(word), value);
                self.ll_bit = true;
                self.cp0.regs[cp0::LL_ADDR] = vaddr >> 4;
            }
            Op::Sc => {
                if self.ll_bit {
                    let vaddr = rs_val.wrapping_add(simm(word) as u64);
                    self.write_virt(bus, vaddr, rt_val, 4)?;
                }
                let success = self.ll_bit as u64;
                self.set_gpr(rt(word), success);
                self.ll_bit = false;
            }
            Op::Scd => {
                if self.ll_bit {
                    let vaddr = rs_val.wrapping_add(simm(word) as u64);
                    self.write_virt(bus, vaddr, rt_val, 8)?;
                }
                let success = self.ll_bit as u64;
                self.set_gpr(rt(word), success);
                self.ll_bit = false;
            }
            Op::Lwl | Op::Lwr => {
                let vaddr = rs_val.wrapping_add(simm(word) as u64);
                let shift = 8 * (vaddr & 3) as u32;
                let word_val = self.read_virt(bus, vaddr & !3, 4)? as u32;
                let old = rt_val as u32;
                let merged = if op == Op::Lwl {
                    (word_val.wrapping_shl(shift)) | (old & mask_low(shift))
                } else {
                    let keep = 24 - shift;
                    (word_val >> keep) | (old & !mask_shifted(keep))
                };
                self.set_gpr(rt(word), merged as i32 as u64);
            }
            Op::Swl | Op::Swr => {
                let vaddr = rs_val.wrapping_add(simm(word) as u64);
                let shift = 8 * (vaddr & 3) as u32;
                let aligned = vaddr & !3;
                let mem = self.read_virt(bus, aligned, 4)? as u32;
                let value = rt_val as u32;
                let merged = if op == Op::Swl {
                    (mem & !mask_shifted(shift)) | (value >> shift)
                } else {
                    let left = 24 - shift;
                    (mem & mask_low(left)) | value.wrapping_shl(left)
                };
                self.write_virt(bus, aligned, merged as u64, 4)?;
            }
            Op::Ldl | Op::Ldr => {
                let vaddr = rs_val.wrapping_add(simm(word) as u64);
                let shift = 8 * (vaddr & 7) as u32;
                let mem = self.read_virt(bus, vaddr & !7, 8)?;
                let old = rt_val;
                let merged = if op == Op::Ldl {
                    mem.wrapping_shl(shift) | (old & mask_low64(shift))
                } else {
                    let keep = 56 - shift;
                    (mem >> keep) | (old & !mask_shifted64(keep))
                };
                self.set_gpr(rt(word), merged);
            }
            Op::Sdl | Op::Sdr => {
                let vaddr = rs_val.wrapping_add(simm(word) as u64);
                let shift = 8 * (vaddr & 7) as u32;
                let aligned = vaddr & !7;
                let mem = self.read_virt(bus, aligned, 8)?;
                let value = rt_val;
                let merged = if op == Op::Sdl {
                    (mem & !mask_shifted64(shift)) | (value >> shift)
                } else {
                    let left = 56 - shift;
                    (mem & mask_low64(left)) | value.wrapping_shl(left)
                };
                self.write_virt(bus, aligned, merged, 8)?;
            }
            Op::Sb => {
                self.write_virt(bus, rs_val.wrapping_add(simm(word) as u64), rt_val, 1)?
            }
            Op::Sh => {
                self.write_virt(bus, rs_val.wrapping_add(simm(word) as u64), rt_val, 2)?
            }
            Op::Sw => {
                self.write_virt(bus, rs_val.wrapping_add(simm(word) as u64), rt_val, 4)?
            }
            Op::Sd => {
                self.write_virt(bus, rs_val.wrapping_add(simm(word) as u64), rt_val, 8)?
            }
            Op::Cache => self.cache_op(bus, word, rs_val)?,
            Op::Mfc0 => {
                let value = self.cp0.read(rd(word)) as u32;
                self.set_gpr(rt(word), value as i32 as u64);
            }
            Op::Dmfc0 => {
                let value = self.cp0.read(rd(word));
                self.set_gpr(rt(word), value);
            }
            Op::Mtc0 => self.cp0.write(rd(word), rt_val as u32 as i32 as u64),
            Op::Dmtc0 => self.cp0.write(rd(word), rt_val),
            Op::Tlbr => {
                let entry = self.tlb.read(self.cp0.regs[cp0::INDEX] as usize & 31);
                self.cp0.regs[cp0::PAGE_MASK] = entry.page_mask;
                self.cp0.regs[cp0::ENTRY_HI] = entry.entry_hi;
                self.cp0.regs[cp0::ENTRY_LO0] = entry.entry_lo0;
                self.cp0.regs[cp0::ENTRY_LO1] = entry.entry_lo1;
            }
            Op::Tlbwi => self.tlb_write(self.cp0.regs[cp0::INDEX] as usize & 31),
            Op::Tlbwr => {
                let index = self.cp0.read(cp0::RANDOM) as usize & 31;
                self.tlb_write(index);
            }
            Op::Tlbp => {
                let probe = self.tlb.probe(self.cp0.regs[cp0::ENTRY_HI]);
                self.cp0.regs[cp0::INDEX] = match probe {
                    Some(index) => index as u64,
                    None => 1 << 31,
                };
            }
            Op::Eret => {
                let status = self.cp0.regs[cp0::STATUS];
                if status & cp0::STATUS_ERL != 0 {
                    self.pc = self.cp0.regs[cp0::ERROR_EPC];
                    self.cp0.regs[cp0::STATUS] = status & !cp0::STATUS_ERL;
                } else {
                    self.pc = self.cp0.regs[cp0::EPC];
                    self.cp0.regs[cp0::STATUS] = status & !cp0::STATUS_EXL;
                }
                self.next_pc = self.pc.wrapping_add(4);
                self.branch_delay = false;
                self.ll_bit = false;
            }
            Op::Mfc1 => {
                let fr = self.cp0.status() & cp0::STATUS_FR != 0;
                let value = self.cp1.read32(rd(word), fr);
                self.set_gpr(rt(word), value as i32 as u64);
            }
            Op::Dmfc1 => {
                let fr = self.cp0.status() & cp0::STATUS_FR != 0;
                self.set_gpr(rt(word), self.cp1.read64(rd(word), fr));
            }
            Op::Cfc1 => {
                let value = match rd(word) {
                    0 => 0x0000_0B00,
                    31 => self.cp1.fcr31,
                    _ => 0,
                };
                self.set_gpr(rt(word), value as i32 as u64);
            }
            Op::Mtc1 => {
                let fr = self.cp0.status() & cp0::STATUS_FR != 0;
                self.cp1.write32(rd(word), rt_val as u32, fr);
            }
            Op::Dmtc1 => {
                let fr = self.cp0.status() & cp0::STATUS_FR != 0;
                self.cp1.write64(rd(word), rt_val, fr);
            }
            Op::Ctc1 => {
                if rd(word) == 31 {
                    self.cp1.fcr31 = rt_val as u32 & 0x0183_FFFF;
                }
            }
            Op::Bc1f | Op::Bc1fl => {
                self.branch_cond(pc, word, !self.cp1.condition(), likely)
            }
            Op::Bc1t | Op::Bc1tl => {
                self.branch_cond(pc, word, self.cp1.condition(), likely)
            }
            Op::FpOp => {
                let fr = self.cp0.status() & cp0::STATUS_FR != 0;
                if self.cp1.execute(word, fr).is_err() {
                    return Err(Exception::FloatingPoint);
                }
            }
            Op::Lwc1 => {
                let fr = self.cp0.status() & cp0::STATUS_FR != 0;
                let value = self.read_virt(bus, rs_val.wrapping_add(simm(word) as u64), 4)?;
                self.cp1.write32(rt(word), value as u32, fr);
            }
            Op::Ldc1 => {
                let fr = self.cp0.status() & cp0::STATUS_FR != 0;
                let value = self.read_virt(bus, rs_val.wrapping_add(simm(word) as u64), 8)?;
                self.cp1.write64(rt(word), value, fr);
            }
            Op::Swc1 => {
                let fr = self.cp0.status() & cp0::STATUS_FR != 0;
                let value = self.cp1.read32(rt(word), fr);
                self.write_virt(bus, rs_val.wrapping_add(simm(word) as u64), value as u64, 4)?;
            }
            Op::Sdc1 => {
                let fr = self.cp0.status() & cp0::STATUS_FR != 0;
                let value = self.cp1.read64(rt(word), fr);
                self.write_virt(bus, rs_val.wrapping_add(simm(word) as u64), value, 8)?;
            }
            Op::Cop2 => return Err(Exception::CopUnusable(2)),
        }
        Ok(())
    }

    fn tlb_write(&mut self, index: usize) {
        self.tlb.write(
            index,
            self.cp0.regs[cp0::PAGE_MASK],
            self.cp0.regs[cp0::ENTRY_HI],
            self.cp0.regs[cp0::ENTRY_LO0],
            self.cp0.regs[cp0::ENTRY_LO1],
        );
    }

    fn wait_mult(&mut self) {
        if self.cycles < self.mult_ready_at {
            self.pipe.stall += (self.mult_ready_at - self.cycles) as u32;
        }
    }

    fn cache_op(&mut self, bus: &mut Bus, word: u32, base: u64) -> Result<(), Exception> {
        let vaddr = base.wrapping_add(simm(word) as u64);
        let op = rt(word) as u32;
        let taglo = (self.cp0.regs[cp0::TAG_LO] >> 8) as u32 & 0x0FFF_FFFF;
        match op {
            // Index operations never take TLB faults.
            0x00 => self.icache.invalidate(vaddr),
            0x01 => {
                if let Some((paddr, data)) = self.dcache.wb_invalidate(vaddr) {
                    bus.write_block16(paddr, &data);
                }
            }
            0x08 => self.icache.set_tag(vaddr, taglo),
            0x09 => self.dcache.set_tag(vaddr, taglo),
            _ => {
                let (paddr, _) = self.translate(vaddr, false)?;
                match op {
                    0x10 => self.icache.invalidate_hit(vaddr, paddr),
                    0x11 => self.dcache.invalidate_hit(vaddr, paddr),
                    0x14 => {
                        let block = bus.read_block16(paddr & !0xF);
                        self.icache.fill(vaddr, paddr & !0xF, &block);
                    }
                    0x15 => {
                        if self.dcache.probe(vaddr, paddr).is_some() {
                            if let Some((victim, data)) = self.dcache.wb_invalidate(vaddr) {
                                bus.write_block16(victim, &data);
                            }
                        }
                    }
                    0x19 => {
                        if let Some(line) = self.dcache.should_flush_line(vaddr) {
                            let (victim, data) = (line.paddr(), line.data);
                            bus.write_block16(victim, &data);
                            self.dcache.mark_clean(vaddr);
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

fn mask_low(bits: u32) -> u32 {
    if bits == 0 {
        0
    } else {
        (1u32 << bits) - 1
    }
}

fn mask_shifted(shift: u32) -> u32 {
    0xFFFF_FFFFu32 >> shift
}

fn mask_low64(bits: u32) -> u64 {
    if bits == 0 {
        0
    } else {
        (1u64 << bits) - 1
    }
}

fn mask_shifted64(shift: u32) -> u64 {
    0xFFFF_FFFF_FFFF_FFFFu64 >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pi::{CartSave, Pi};
    use crate::pif::Pif;
    use crate::rom::RomFile;
    use super::decode::asm;

    // Machines in here run straight out of uncached RDRAM via kseg1.
    fn machine(words: &[u32]) -> (Vr4300, Bus) {
        let pi = Pi::new(RomFile { data: vec![0; 0x1000] }, None, CartSave::None);
        let mut bus = Bus::new(pi, Pif::new(vec![0; 0x7C0]));
        for (i, word) in words.iter().enumerate() {
            let offset = 0x1000 + 4 * i;
            bus.rdram.mem[offset..offset + 4].copy_from_slice(&word.to_be_bytes());
        }
        let mut cpu = Vr4300::new();
        cpu.cp0.regs[cp0::STATUS] = cp0::STATUS_BEV; // out of reset, kernel
        cpu.pc = 0xFFFF_FFFF_A000_1000;
        cpu.next_pc = cpu.pc + 4;
        (cpu, bus)
    }

    fn run(cpu: &mut Vr4300, bus: &mut Bus, cycles: u64) {
        for _ in 0..cycles {
            cpu.step(bus);
        }
    }

    #[test]
    fn gpr0_reads_zero_after_writes() {
        let (mut cpu, mut bus) = machine(&[
            asm::addiu(0, 0, 0x123),
            asm::itype(0x0D, 0, 0, 0xFFFF), // ori r0
            asm::addiu(1, 0, 7),
        ]);
        run(&mut cpu, &mut bus, 8);
        assert_eq!(cpu.regs[0], 0);
        assert_eq!(cpu.regs[1], 7);
    }

    #[test]
    fn delay_slot_executes_before_branch_target() {
        let (mut cpu, mut bus) = machine(&[
            asm::beq(0, 0, 2),      // to +3 words from slot
            asm::addiu(1, 0, 1),    // delay slot runs
            asm::addiu(2, 0, 2),    // skipped
            asm::addiu(3, 0, 3),    // target
        ]);
        run(&mut cpu, &mut bus, 8);
        assert_eq!(cpu.regs[1], 1);
        assert_eq!(cpu.regs[2], 0);
        assert_eq!(cpu.regs[3], 3);
    }

    #[test]
    fn likely_branch_annuls_slot_when_not_taken() {
        let (mut cpu, mut bus) = machine(&[
            asm::itype(0x15, 0, 0, 2), // bnel r0, r0 (never taken)
            asm::addiu(1, 0, 1),       // annulled
            asm::addiu(2, 0, 2),
        ]);
        run(&mut cpu, &mut bus, 8);
        assert_eq!(cpu.regs[1], 0);
        assert_eq!(cpu.regs[2], 2);
    }

    #[test]
    fn likely_branch_keeps_slot_when_taken() {
        let (mut cpu, mut bus) = machine(&[
            asm::itype(0x14, 0, 0, 2), // beql r0, r0: taken
            asm::addiu(1, 0, 1),       // slot runs
            asm::addiu(2, 0, 2),       // skipped
            asm::addiu(3, 0, 3),
        ]);
        run(&mut cpu, &mut bus, 8);
        assert_eq!(cpu.regs[1], 1);
        assert_eq!(cpu.regs[2], 0);
        assert_eq!(cpu.regs[3], 3);
    }

    #[test]
    fn add_overflow_raises_with_epc_at_faulter() {
        let (mut cpu, mut bus) = machine(&[
            asm::lui(1, 0x7FFF),
            asm::ori(1, 1, 0xFFFF),
            asm::addiu(2, 0, 1),
            asm::rtype(0x20, 1, 2, 3, 0), // add r3, r1, r2: overflow
        ]);
        run(&mut cpu, &mut bus, 4);
        assert_eq!((cpu.cp0.read(cp0::CAUSE) >> 2) & 0x1F, 12);
        assert_eq!(cpu.cp0.read(cp0::EPC) as u32, 0xA000_100C);
        assert_eq!(cpu.regs[3], 0); // result suppressed
        assert_eq!(cpu.pc, 0xFFFF_FFFF_BFC0_0380); // BEV general vector
    }

    #[test]
    fn overflow_in_delay_slot_reports_branch_pc() {
        let (mut cpu, mut bus) = machine(&[
            asm::lui(1, 0x7FFF),
            asm::ori(1, 1, 0xFFFF),
            asm::beq(0, 0, -1),
            asm::itype(0x08, 1, 3, 0x7FFF), // addi overflows in the slot
        ]);
        run(&mut cpu, &mut bus, 8);
        assert_eq!(cpu.cp0.read(cp0::EPC) as u32, 0xA000_1008);
        assert!(cpu.cp0.read(cp0::CAUSE) & cp0::CAUSE_BD != 0);
    }

    #[test]
    fn eret_returns_and_clears_exl() {
        let (mut cpu, mut bus) = machine(&[asm::addiu(1, 0, 5)]);
        cpu.cp0.regs[cp0::STATUS] |= cp0::STATUS_EXL;
        cpu.cp0.regs[cp0::EPC] = 0xFFFF_FFFF_A000_1000;
        // Place an eret somewhere and point the pc at it.
        bus.rdram.mem[0x2000..0x2004].copy_from_slice(&asm::eret().to_be_bytes());
        cpu.pc = 0xFFFF_FFFF_A000_2000;
        cpu.next_pc = cpu.pc + 4;
        run(&mut cpu, &mut bus, 4);
        assert_eq!(cpu.cp0.regs[cp0::STATUS] & cp0::STATUS_EXL, 0);
        assert_eq!(cpu.regs[1], 5); // resumed at EPC and ran the add
    }

    #[test]
    fn mult_consumer_stalls_until_ready() {
        let (mut cpu, mut bus) = machine(&[
            asm::addiu(1, 0, 3),
            asm::addiu(2, 0, 4),
            asm::rtype(0x18, 1, 2, 0, 0), // mult r1, r2
            asm::rtype(0x12, 0, 0, 3, 0), // mflo r3
        ]);
        run(&mut cpu, &mut bus, 4);
        let busy_cycles = cpu.pipe.stall;
        assert!(busy_cycles > 0, "mflo should stall on the multiplier");
        run(&mut cpu, &mut bus, busy_cycles as u64 + 1);
        assert_eq!(cpu.regs[3], 12);
    }

    #[test]
    fn sc_fails_after_eret_clears_ll_bit() {
        let (mut cpu, mut bus) = machine(&[
            asm::lui(4, 0xA000),
            asm::ori(4, 4, 0x3000),
            asm::itype(0x30, 4, 5, 0), // ll r5, 0(r4)
            asm::itype(0x38, 4, 5, 0), // sc r5, 0(r4)
        ]);
        run(&mut cpu, &mut bus, 8);
        assert_eq!(cpu.regs[5], 1); // paired ll/sc succeeds
        // Now break the link before the store.
        let (mut cpu, mut bus) = machine(&[
            asm::lui(4, 0xA000),
            asm::ori(4, 4, 0x3000),
            asm::itype(0x30, 4, 5, 0), // ll
            asm::eret(),
            asm::itype(0x38, 4, 5, 0), // sc after eret
        ]);
        cpu.cp0.regs[cp0::STATUS] |= cp0::STATUS_EXL;
        cpu.cp0.regs[cp0::EPC] = 0xFFFF_FFFF_A000_1010;
        run(&mut cpu, &mut bus, 10);
        assert_eq!(cpu.regs[5], 0);
    }

    #[test]
    fn uncached_store_reaches_memory_directly() {
        let (mut cpu, mut bus) = machine(&[
            asm::lui(1, 0x00AB),
            asm::lui(2, 0xA000),
            asm::ori(2, 2, 0x4000),
            asm::sw(1, 2, 0),
        ]);
        run(&mut cpu, &mut bus, 8);
        assert_eq!(bus.rdram.read(0x4000, Size::Word).inner(), 0x00AB_0000);
        assert!(cpu.dcache.probe(0xFFFF_FFFF_A000_4000, 0x4000).is_none());
    }

    #[test]
    fn cop1_unusable_without_cu1() {
        let (mut cpu, mut bus) = machine(&[
            (0x11 << 26) | (16 << 21), // some COP1 op
        ]);
        run(&mut cpu, &mut bus, 4);
        assert_eq!((cpu.cp0.read(cp0::CAUSE) >> 2) & 0x1F, 11);
        assert_eq!((cpu.cp0.read(cp0::CAUSE) >> 28) & 3, 1);
    }

    #[test]
    fn interrupt_dispatch_prefers_lower_vector_state() {
        // With an interrupt pending and EXL clear, EPC lands on the
        // unexecuted instruction and ExcCode reads Interrupt.
        let (mut cpu, mut bus) = machine(&[asm::addiu(1, 0, 1), asm::addiu(2, 0, 2)]);
        cpu.cp0.regs[cp0::STATUS] |= cp0::STATUS_IE | (1 << 10);
        cpu.cp0.set_int_line(2, true);
        bus.mi.write_reg(crate::mi::MI_INTR_MASK_REG, 1 << 1); // set SP mask
        bus.mi.raise(crate::mi::IntSource::Sp);
        cpu.step(&mut bus);
        assert_eq!((cpu.cp0.read(cp0::CAUSE) >> 2) & 0x1F, 0);
        assert_eq!(cpu.cp0.read(cp0::EPC) as u32, 0xA000_1000);
        assert_eq!(cpu.regs[1], 0); // nothing younger executed
    }
}
