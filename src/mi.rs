// MIPS interface. Aggregates the six RCP interrupt sources under a mask and
// presents the result to the VR4300 as the IP2 line. Mode and mask writes use
// set/clear bit pairs, decoded the way the hardware documents them.

use proc_bitfield::bitfield;

pub const MI_INIT_MODE_REG: u32 = 0x00;
pub const MI_VERSION_REG: u32 = 0x04;
pub const MI_INTR_REG: u32 = 0x08;
pub const MI_INTR_MASK_REG: u32 = 0x0C;

const MI_VERSION: u32 = 0x0202_0102;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntSource {
    Sp = 0,
    Si = 1,
    Ai = 2,
    Vi = 3,
    Pi = 4,
    Dp = 5,
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ModeWrite(pub u32): Debug {
        pub init_length: u8 @ 0..=6,
        pub clear_init_mode: bool @ 7,
        pub set_init_mode: bool @ 8,
        pub clear_ebus_test_mode: bool @ 9,
        pub set_ebus_test_mode: bool @ 10,
        pub clear_dp_interrupt: bool @ 11,
        pub clear_rdram_reg_mode: bool @ 12,
        pub set_rdram_reg_mode: bool @ 13,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct MaskWrite(pub u32): Debug {
        pub clear_sp: bool @ 0,
        pub set_sp: bool @ 1,
        pub clear_si: bool @ 2,
        pub set_si: bool @ 3,
        pub clear_ai: bool @ 4,
        pub set_ai: bool @ 5,
        pub clear_vi: bool @ 6,
        pub set_vi: bool @ 7,
        pub clear_pi: bool @ 8,
        pub set_pi: bool @ 9,
        pub clear_dp: bool @ 10,
        pub set_dp: bool @ 11,
    }
}

pub struct Mi {
    init_length: u32,
    init_mode: bool,
    ebus_test_mode: bool,
    rdram_reg_mode: bool,
    pending: u32,
    mask: u32,
}

impl Mi {
    pub fn new() -> Mi {
        Mi {
            init_length: 0,
            init_mode: false,
            ebus_test_mode: false,
            rdram_reg_mode: false,
            pending: 0,
            mask: 0,
        }
    }

    pub fn raise(&mut self, source: IntSource) {
        self.pending |= 1 << source as u32;
    }

    pub fn lower(&mut self, source: IntSource) {
        self.pending &= !(1 << source as u32);
    }

    // The aggregated line feeding VR4300 Cause.IP2.
    pub fn cpu_int_asserted(&self) -> bool {
        self.pending & self.mask != 0
    }

    pub fn read_reg(&self, offset: u32) -> u32 {
        match offset {
            MI_INIT_MODE_REG => {
                self.init_length
                    | (self.init_mode as u32) << 7
                    | (self.ebus_test_mode as u32) << 8
                    | (self.rdram_reg_mode as u32) << 9
            }
            MI_VERSION_REG => MI_VERSION,
            MI_INTR_REG => self.pending,
            MI_INTR_MASK_REG => self.mask,
            _ => 0,
        }
    }

    pub fn write_reg(&mut self, offset: u32, value: u32) {
        match offset {
            MI_INIT_MODE_REG => {
                let mode = ModeWrite(value);
                self.init_length = mode.init_length() as u32;
                if mode.clear_init_mode() {
                    self.init_mode = false;
                }
                if mode.set_init_mode() {
                    self.init_mode = true;
                }
                if mode.clear_ebus_test_mode() {
                    self.ebus_test_mode = false;
                }
                if mode.set_ebus_test_mode() {
                    self.ebus_test_mode = true;
                }
                if mode.clear_dp_interrupt() {
                    self.lower(IntSource::Dp);
                }
                if mode.clear_rdram_reg_mode() {
                    self.rdram_reg_mode = false;
                }
                if mode.set_rdram_reg_mode() {
                    self.rdram_reg_mode = true;
                }
            }
            MI_INTR_MASK_REG => {
                let mask = MaskWrite(value);
                let pairs = [
                    (mask.clear_sp(), mask.set_sp(), IntSource::Sp),
                    (mask.clear_si(), mask.set_si(), IntSource::Si),
                    (mask.clear_ai(), mask.set_ai(), IntSource::Ai),
                    (mask.clear_vi(), mask.set_vi(), IntSource::Vi),
                    (mask.clear_pi(), mask.set_pi(), IntSource::Pi),
                    (mask.clear_dp(), mask.set_dp(), IntSource::Dp),
                ];
                for (clear, set, source) in pairs.iter() {
                    let bit = 1u32 << *source as u32;
                    if *clear {
                        self.mask &= !bit;
                    }
                    if *set {
                        self.mask |= bit;
                    }
                }
            }
            _ => {}
        }
    }
}
