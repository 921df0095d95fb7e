// End-to-end scenarios: each builds a machine around a stub PIF ROM whose
// boot code jumps straight at the cart, runs the stepper, and asserts on
// architectural state afterwards.

use en64::device::Device;
use en64::log::EventLog;
use en64::mi::{IntSource, MI_INTR_MASK_REG, MI_INTR_REG};
use en64::pi::{CartSave, Pi};
use en64::pif::{pak_addr_crc, pak_data_crc, Controller, Pak, Pif};
use en64::rom::RomFile;
use en64::save::{controller_pak_format, id_block_checksum, SaveFile, MEMPAK_SIZE};
use en64::vr4300::cp0;
use en64::vr4300::decode::asm;

const KSEG1_CART: u32 = 0xB000_0000;
const CART_ENTRY_OFFSET: usize = 0x1000;

fn boot_rom(extra: &[(usize, Vec<u32>)]) -> Vec<u8> {
    // Boot: drop the reset-time ERL, keep BEV, jump at the cart through
    // kseg1 with a nop in the delay slot.
    let mut rom = vec![0u8; 0x7C0];
    let entry = KSEG1_CART + CART_ENTRY_OFFSET as u32;
    let boot = vec![
        asm::lui(9, 0x3440),
        asm::mtc0(9, 12),
        asm::lui(8, (entry >> 16) as u16),
        asm::ori(8, 8, entry as u16),
        asm::jr(8),
        asm::nop(),
    ];
    lay_words(&mut rom, 0, &boot);
    for (offset, words) in extra {
        lay_words(&mut rom, *offset, words);
    }
    rom
}

fn lay_words(mem: &mut [u8], offset: usize, words: &[u32]) {
    for (i, word) in words.iter().enumerate() {
        mem[offset + 4 * i..offset + 4 * i + 4].copy_from_slice(&word.to_be_bytes());
    }
}

fn cart_with(words: &[u32]) -> RomFile {
    let mut data = vec![0u8; 0x4000];
    lay_words(&mut data, CART_ENTRY_OFFSET, words);
    RomFile { data }
}

fn device_with(pifrom: Vec<u8>, cart: RomFile) -> Device {
    let pi = Pi::new(cart, None, CartSave::None);
    let pif = Pif::new(pifrom);
    Device::new(pi, pif, EventLog::disabled())
}

#[test]
fn s1_nop_loop_parks_on_the_branch() {
    let cart = cart_with(&[
        asm::beq(0, 0, -1),
        asm::nop(),
    ]);
    let mut device = device_with(boot_rom(&[]), cart);
    device.run_cycles(10_000);

    let branch = 0xFFFF_FFFF_0000_0000u64 | (KSEG1_CART as u64 + CART_ENTRY_OFFSET as u64);
    let pc = device.cpu.pc;
    assert!(
        pc == branch || pc == branch + 4,
        "pc parked at {:#x}, expected the loop at {:#x}",
        pc,
        branch
    );

    // The loop body touches nothing; registers stay put from here on.
    let snapshot = device.cpu.regs;
    device.run_cycles(1_000);
    assert_eq!(snapshot, device.cpu.regs);
    assert_eq!(device.cpu.regs[0], 0);
}

#[test]
fn s2_cached_store_read_back_and_writeback() {
    let cart = cart_with(&[
        asm::lui(2, 0x1122),
        asm::ori(2, 2, 0x3344),
        asm::lui(3, 0x8000),
        asm::ori(3, 3, 0x1000),
        asm::sw(2, 3, 0),
        asm::itype(0x09, 0, 2, 0), // addiu r2, r0, 0: clobber before reload
        asm::lw(2, 3, 0),
        asm::cache(0x19, 3, 0), // hit write-back
        asm::beq(0, 0, -1),
        asm::nop(),
    ]);
    let mut device = device_with(boot_rom(&[]), cart);
    device.run_cycles(10_000);

    assert_eq!(device.cpu.regs[2], 0x1122_3344);
    // Line index 0x100 is valid and clean after the write-back; the probe
    // matches the physical tag, and memory below has the data.
    let line = device.cpu.dcache.probe(0xFFFF_FFFF_8000_1000, 0x0000_1000).expect("probe hit");
    assert!(line.is_valid());
    assert!(!line.is_dirty());
    assert_eq!(line.tag(), 0x1000 >> 4);
    assert_eq!(
        device.bus.rdram.read(0x1000, en64::bus::Size::Word).inner(),
        0x1122_3344
    );
}

#[test]
fn s3_tlb_refill_then_mapped_load() {
    // Refill handler at the boot-vector base: stage the pair, write slot 0,
    // return to the faulting load.
    let handler = vec![
        asm::lui(1, 0x1000),
        asm::mtc0(1, 10),                        // EntryHi = 0x1000_0000
        asm::itype(0x09, 0, 2, 0x0417),          // addiu r2: pfn 0x10, D|V|G
        asm::mtc0(2, 2),                         // EntryLo0
        asm::itype(0x09, 0, 2, 0x0001),
        asm::mtc0(2, 3),                         // EntryLo1 = G
        asm::mtc0(0, 5),                         // PageMask = 0
        asm::mtc0(0, 0),                         // Index = 0
        asm::tlbwi(),
        asm::eret(),
    ];
    let cart = cart_with(&[
        asm::lui(6, 0x1000),
        asm::ori(6, 6, 0x0004),
        asm::lw(5, 6, 0), // vaddr 0x1000_0004: misses the TLB first time
        asm::beq(0, 0, -1),
        asm::nop(),
    ]);
    let mut device = device_with(boot_rom(&[(0x200, handler)]), cart);
    device.bus.rdram.write(0x1_0004, en64::bus::OpResult::Word(0xCAFE_F00D));

    // Run until the refill vector is reached, then check the fault state.
    let refill_vector = 0xFFFF_FFFF_BFC0_0200u64;
    let mut reached = false;
    for _ in 0..10_000 {
        device.step();
        if device.cpu.pc == refill_vector {
            reached = true;
            break;
        }
    }
    assert!(reached, "refill vector never reached");
    let load_pc = 0xFFFF_FFFF_0000_0000u64 | (KSEG1_CART as u64 + CART_ENTRY_OFFSET as u64 + 8);
    assert_eq!(device.cpu.cp0.read(cp0::EPC), load_pc);
    assert_eq!((device.cpu.cp0.read(cp0::CAUSE) >> 2) & 0x1F, 2); // TLBL
    assert_eq!(device.cpu.cp0.read(cp0::BAD_VADDR), 0x1000_0004);

    // After the handler installs the mapping, the load retires from RDRAM.
    device.run_cycles(10_000);
    assert_eq!(device.cpu.regs[5] as u32, 0xCAFE_F00D);
    assert_eq!(device.cpu.tlb.probe(0x1000_0000), Some(0));
}

#[test]
fn s4_vi_interrupt_reaches_cause_ip2() {
    let cart = cart_with(&[asm::beq(0, 0, -1), asm::nop()]);
    let mut device = device_with(boot_rom(&[]), cart);

    device.bus.vi.write_reg(en64::vi::VI_V_SYNC_REG, 525);
    device.bus.vi.write_reg(en64::vi::VI_INTR_REG, 0x200);
    device.bus.mi.write_reg(MI_INTR_MASK_REG, 1 << 7); // unmask VI

    let mut pending = false;
    for _ in 0..4_000_000u64 {
        device.step();
        if device.bus.mi.read_reg(MI_INTR_REG) & (1 << IntSource::Vi as u32) != 0 {
            pending = true;
            break;
        }
    }
    assert!(pending, "VI never raised its MI bit");
    assert!(device.bus.mi.cpu_int_asserted());

    // With IE and IM2 set the exception dispatches on the next step.
    device.cpu.cp0.regs[cp0::STATUS] =
        (device.cpu.cp0.regs[cp0::STATUS] & !cp0::STATUS_ERL & !cp0::STATUS_EXL)
            | cp0::STATUS_IE
            | (1 << 10);
    device.step();
    assert!(device.cpu.cp0.read(cp0::CAUSE) & (1 << 10) != 0); // IP2
    assert_eq!((device.cpu.cp0.read(cp0::CAUSE) >> 2) & 0x1F, 0); // Interrupt
    assert_eq!(device.cpu.pc, 0xFFFF_FFFF_BFC0_0380); // BEV general vector

    // Acknowledge at the VI, and the line drops cleanly.
    device.bus.write(0x0440_0010, en64::bus::OpResult::Word(0));
    device.step();
    assert!(!device.bus.mi.cpu_int_asserted());
    assert!(device.cpu.cp0.read(cp0::CAUSE) & (1 << 10) == 0);
}

#[test]
fn s5_rsp_vmulf_matches_hardware_formula() {
    let cart = cart_with(&[asm::beq(0, 0, -1), asm::nop()]);
    let mut device = device_with(boot_rom(&[]), cart);

    let vs: [i16; 8] = [0x4000, -0x4000, 0x7FFF, -0x8000, 1, -1, 0, 0x2000];
    let vt: [i16; 8] = [0x4000, 0x4000, 0x7FFF, -0x8000, 1, 2, 0x1234, -0x2000];
    for lane in 0..8 {
        let s = (vs[lane] as u16).to_be_bytes();
        let t = (vt[lane] as u16).to_be_bytes();
        device.bus.rsp.dmem[2 * lane..2 * lane + 2].copy_from_slice(&s);
        device.bus.rsp.dmem[0x10 + 2 * lane..0x10 + 2 * lane + 2].copy_from_slice(&t);
    }

    let lqv_v1 = (0x32u32 << 26) | (0 << 21) | (1 << 16) | (0x04 << 11);
    let lqv_v2 = (0x32u32 << 26) | (0 << 21) | (2 << 16) | (0x04 << 11) | 1; // +0x10
    let vmulf = (0x12u32 << 26) | (1 << 25) | (2 << 16) | (1 << 11) | (3 << 6);
    let brk = 0x0000_000Du32;
    let program = [lqv_v1, lqv_v2, vmulf, brk, 0];
    for (i, word) in program.iter().enumerate() {
        device.bus.rsp.imem[4 * i..4 * i + 4].copy_from_slice(&word.to_be_bytes());
    }
    device.bus.rsp.write_reg(0x10, 1); // clear halt
    for _ in 0..64 {
        device.step();
        if device.bus.rsp.halted() {
            break;
        }
    }
    assert!(device.bus.rsp.halted());

    for lane in 0..8 {
        let acc = (vs[lane] as i64) * (vt[lane] as i64) * 2 + 0x8000;
        let clamped = {
            let upper = (acc >> 16) as i64;
            if upper < -0x8000 {
                0x8000u16
            } else if upper > 0x7FFF {
                0x7FFFu16
            } else {
                (acc >> 16) as u16
            }
        };
        let acc48 = acc & 0xFFFF_FFFF_FFFF;
        let got_acc = ((device.bus.rsp.vu.acc_hi[lane] as u64) << 32
            | (device.bus.rsp.vu.acc_md[lane] as u64) << 16
            | device.bus.rsp.vu.acc_lo[lane] as u64)
            & 0xFFFF_FFFF_FFFF;
        assert_eq!(got_acc, acc48 as u64, "acc lane {}", lane);
        assert_eq!(device.bus.rsp.vu.vr[3][lane], clamped, "vd lane {}", lane);
    }
}

#[test]
fn s6_absent_mempak_is_created_formatted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("player1.mpk");

    let (mut backing, created) = SaveFile::open(&path, MEMPAK_SIZE, 0).unwrap();
    assert!(created);
    controller_pak_format(&mut backing.data);

    let cart = cart_with(&[asm::beq(0, 0, -1), asm::nop()]);
    let pi = Pi::new(cart, None, CartSave::None);
    let mut pif = Pif::new(boot_rom(&[]));
    pif.controllers[0] = Controller::standard(Pak::Mem(backing));
    let mut device = Device::new(pi, pif, EventLog::disabled());

    // Probe the id block over the joybus and verify the data CRC and the
    // filesystem checksum that came back.
    let addr = pak_addr_crc(0x0020);
    let command = [0x03, 0x21, 0x02, (addr >> 8) as u8, addr as u8, 0xFE];
    device.bus.pif.ram = [0u8; 64];
    device.bus.pif.ram[..command.len()].copy_from_slice(&command);
    device.bus.pif.run_joybus();
    let mut data = [0u8; 32];
    data.copy_from_slice(&device.bus.pif.ram[5..37]);
    assert_eq!(device.bus.pif.ram[37], pak_data_crc(&data));
    let sum = id_block_checksum(&data);
    assert_eq!(u16::from_be_bytes([data[28], data[29]]), sum);
    assert_eq!(u16::from_be_bytes([data[30], data[31]]), 0xFFF2u16.wrapping_sub(sum));

    // Teardown flushes the formatted pak to the new file.
    if let Pak::Mem(save) = &mut device.bus.pif.controllers[0].pak {
        save.flush().unwrap();
    }
    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(on_disk.len(), MEMPAK_SIZE);
    assert_eq!(on_disk[0x20], data[0]);
}

#[test]
fn pi_dma_scenario_copies_cart_into_rdram() {
    let mut cart = vec![0u8; 0x4000];
    for (i, byte) in cart[0x2000..0x2100].iter_mut().enumerate() {
        *byte = (i ^ 0x5A) as u8;
    }
    let cart_data = cart.clone();
    let mut device = device_with(boot_rom(&[]), RomFile { data: cart });

    device.bus.write(0x0460_0000, en64::bus::OpResult::Word(0x0000_3000)); // DRAM
    device.bus.write(0x0460_0004, en64::bus::OpResult::Word(0x1000_2000)); // cart
    device.bus.write(0x0460_000C, en64::bus::OpResult::Word(0xFF)); // 256 bytes
    device.run_cycles(64);

    assert_eq!(
        device.bus.pi.read_reg(en64::pi::PI_STATUS_REG) & en64::pi::PI_STATUS_DMA_BUSY,
        0
    );
    for i in 0..256usize {
        assert_eq!(
            device.bus.rdram.read(0x3000 + i, en64::bus::Size::Byte).inner() as u8,
            cart_data[0x2000 + i],
            "byte {}",
            i
        );
    }
    // Completion raised the PI line.
    assert!(device.bus.mi.read_reg(MI_INTR_REG) & (1 << IntSource::Pi as u32) != 0);
}

#[test]
fn register_write_read_round_trip() {
    let cart = cart_with(&[asm::beq(0, 0, -1), asm::nop()]);
    let mut device = device_with(boot_rom(&[]), cart);

    // VI origin/width are plain read/write words.
    device.bus.write(0x0440_0004, en64::bus::OpResult::Word(0x0010_0000));
    assert_eq!(device.bus.read(0x0440_0004, en64::bus::Size::Word).inner(), 0x0010_0000);
    device.bus.write(0x0440_0008, en64::bus::OpResult::Word(320));
    assert_eq!(device.bus.read(0x0440_0008, en64::bus::Size::Word).inner(), 320);
    // PI addresses likewise.
    device.bus.write(0x0460_0000, en64::bus::OpResult::Word(0x0012_3458));
    assert_eq!(device.bus.read(0x0460_0000, en64::bus::Size::Word).inner(), 0x0012_3458);
    // SP PC masks to IMEM range.
    device.bus.write(0x0408_0000, en64::bus::OpResult::Word(0x0000_0FFC));
    assert_eq!(device.bus.read(0x0408_0000, en64::bus::Size::Word).inner(), 0x0FFC);
}
