// Interactive machine-state debugger: single step, breakpoints, a register
// panel and a short disassembly window, drawn with termion cursor control.
// Attach with --debug; the stepper runs underneath it one cycle at a time.

use std::collections::HashSet;
use std::io;
use std::io::prelude::*;

use termion::{clear, color, cursor};

use crate::device::Device;
use crate::vr4300::decode::{decode, imm, rd, rs, rt, sa, Op};

pub enum Signal {
    Ok,
    Quit,
    NoOp,
}

#[derive(PartialEq, Clone)]
enum DebugCommand {
    Quit,
    SetBreakpoint(Option<String>),
    DeleteBreakpoint(Option<String>),
    Continue,
    Step,
}

pub struct Debugger {
    breakpoints: HashSet<u64>,
    code_running: bool,
    last_cmd: DebugCommand,
}

impl Debugger {
    pub fn new() -> Debugger {
        Debugger {
            breakpoints: HashSet::new(),
            code_running: false,
            last_cmd: DebugCommand::Step,
        }
    }

    pub fn run(&mut self, device: &mut Device) {
        loop {
            if !device.running_flag().load(std::sync::atomic::Ordering::Acquire) {
                break;
            }
            device.step();
            match self.update(device) {
                Signal::Quit => {
                    device.stop();
                    break;
                }
                _ => {}
            }
        }
    }

    pub fn update(&mut self, device: &mut Device) -> Signal {
        if self.code_running && !self.breakpoints.contains(&device.cpu.pc) {
            return Signal::Ok;
        }
        self.code_running = false;
        self.draw_user_interface(device);
        let cmd = self.get_command();
        match &cmd {
            DebugCommand::Quit => Signal::Quit,
            DebugCommand::SetBreakpoint(address) => {
                if let Some(address) = parse_address(address) {
                    self.breakpoints.insert(address);
                    println!("Breakpoint created.");
                } else {
                    println!("Invalid address!");
                }
                Signal::NoOp
            }
            DebugCommand::DeleteBreakpoint(address) => {
                if let Some(address) = parse_address(address) {
                    self.breakpoints.remove(&address);
                    println!("Breakpoint deleted.");
                } else {
                    println!("Invalid address!");
                }
                Signal::NoOp
            }
            DebugCommand::Continue => {
                self.code_running = true;
                Signal::Ok
            }
            DebugCommand::Step => {
                self.last_cmd = cmd;
                Signal::Ok
            }
        }
    }

    fn get_command(&mut self) -> DebugCommand {
        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            return DebugCommand::Quit;
        }
        let mut cmd = input.split_whitespace();
        match cmd.next() {
            Some("q") => DebugCommand::Quit,
            Some("s") | Some("n") => DebugCommand::Step,
            Some("b") => DebugCommand::SetBreakpoint(cmd.next().map(String::from)),
            Some("d") => DebugCommand::DeleteBreakpoint(cmd.next().map(String::from)),
            Some("c") => DebugCommand::Continue,
            _ => self.last_cmd.clone(),
        }
    }

    fn draw_user_interface(&mut self, device: &mut Device) {
        print!("{}{}", clear::All, cursor::Goto(1, 1));
        println!("╔═ CPU state ═══════════════════════════════════════╗");
        for row in 0..16 {
            println!(
                "║ r{:<2} {:016x}  r{:<2} {:016x} ║",
                row,
                device.cpu.regs[row],
                row + 16,
                device.cpu.regs[row + 16],
            );
        }
        println!(
            "║ pc  {:016x}  hi  {:016x} ║",
            device.cpu.pc, device.cpu.hi
        );
        println!(
            "║ cyc {:016x}  lo  {:016x} ║",
            device.cpu.cycles, device.cpu.lo
        );
        println!("╟─ Next instructions ───────────────────────────────╢");
        let pc = device.cpu.pc;
        for line in 0..8u64 {
            let vaddr = pc.wrapping_add(4 * line);
            let word = peek_word(device, vaddr);
            let marker = if self.breakpoints.contains(&vaddr) {
                format!("{}*{}", color::Fg(color::Red), color::Fg(color::Reset))
            } else if line == 0 {
                format!("{}>{}", color::Fg(color::Green), color::Fg(color::Reset))
            } else {
                String::from(" ")
            };
            println!(
                "║{} {:08x}  {:08x}  {:<28}║",
                marker,
                vaddr as u32,
                word,
                disassemble(word),
            );
        }
        println!("╚═══════════════════════════════════════════════════╝");
        println!("n: step, c: continue, b/d <addr>: breakpoints, q: quit");
        print!("> ");
        let _ = io::stdout().flush();
    }
}

// Side-effect-free fetch for display: only the unmapped segments resolve.
fn peek_word(device: &mut Device, vaddr: u64) -> u32 {
    let va = vaddr as u32;
    match va >> 29 {
        0b100 | 0b101 => {
            device.bus.read(va & 0x1FFF_FFFF, crate::bus::Size::Word).inner() as u32
        }
        _ => 0,
    }
}

fn disassemble(word: u32) -> String {
    let decoded = decode(word);
    match decoded.op {
        Op::Reserved => String::from("dc"),
        Op::Sll if word == 0 => String::from("nop"),
        Op::Sll | Op::Srl | Op::Sra | Op::Dsll | Op::Dsrl | Op::Dsra | Op::Dsll32
        | Op::Dsrl32 | Op::Dsra32 => format!(
            "{:?} r{},r{},{}",
            decoded.op,
            rd(word),
            rt(word),
            sa(word)
        ),
        Op::Lui => format!("Lui r{},{:#x}", rt(word), imm(word)),
        Op::J | Op::Jal => format!("{:?} {:#x}", decoded.op, (word & 0x03FF_FFFF) << 2),
        Op::Jr | Op::Jalr => format!("{:?} r{}", decoded.op, rs(word)),
        Op::Addi | Op::Addiu | Op::Slti | Op::Sltiu | Op::Andi | Op::Ori | Op::Xori
        | Op::Daddi | Op::Daddiu => format!(
            "{:?} r{},r{},{:#x}",
            decoded.op,
            rt(word),
            rs(word),
            imm(word)
        ),
        Op::Lb | Op::Lbu | Op::Lh | Op::Lhu | Op::Lw | Op::Lwu | Op::Ld | Op::Ll
        | Op::Sb | Op::Sh | Op::Sw | Op::Sd | Op::Sc => format!(
            "{:?} r{},{:#x}(r{})",
            decoded.op,
            rt(word),
            imm(word),
            rs(word)
        ),
        Op::Beq | Op::Bne | Op::Beql | Op::Bnel => format!(
            "{:?} r{},r{},{}",
            decoded.op,
            rs(word),
            rt(word),
            imm(word) as i16
        ),
        _ => format!("{:?}", decoded.op),
    }
}

fn parse_address(address: &Option<String>) -> Option<u64> {
    match address {
        Some(addr) => {
            let trimmed = addr.trim_start_matches("0x");
            u64::from_str_radix(trimmed, 16).ok().map(|a| a as u32 as i32 as i64 as u64)
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disassembles_common_forms() {
        assert_eq!(disassemble(0), "nop");
        assert_eq!(disassemble(0x2443_0010), "Addiu r3,r2,0x10");
        assert!(disassemble(0x8C62_0004).starts_with("Lw r2,0x4(r3)"));
    }

    #[test]
    fn address_parse_sign_extends_kseg() {
        assert_eq!(parse_address(&Some(String::from("80001000"))), Some(0xFFFF_FFFF_8000_1000));
        assert_eq!(parse_address(&Some(String::from("zz"))), None);
    }
}
