use std::path::PathBuf;
use std::process;

use clap::Parser;

use en64::log::EventLog;
use en64::pi::{CartSave, FlashRam};
use en64::pif::{Controller, Eeprom, EepromKind, Pak, TransferPak};
use en64::rom::{RomFile, RomValidation, DD_IPL_SIZE, PIFROM_SIZE};
use en64::save::{
    controller_pak_format, SaveFile, EEPROM_16K_SIZE, EEPROM_4K_SIZE, FLASHRAM_SIZE, MEMPAK_SIZE,
    SRAM_SIZE,
};
use en64::Configuration;

#[derive(Parser)]
#[command(name = "en64", about = "Cycle-stepped Nintendo 64 simulator")]
struct Args {
    /// PIF boot ROM image (2 KiB)
    pifrom: PathBuf,
    /// Cart ROM image (z64/v64/n64 byte orders accepted)
    cart: PathBuf,
    /// 64DD IPL ROM (4 MiB)
    #[arg(long)]
    ddipl: Option<PathBuf>,
    /// 64DD disk image (accepted; the drive reports no disk)
    #[arg(long)]
    ddrom: Option<PathBuf>,
    /// EEPROM save path (512 B, or 2 KiB with --eeprom-16k)
    #[arg(long)]
    eeprom: Option<PathBuf>,
    #[arg(long)]
    eeprom_16k: bool,
    /// SRAM save path (32 KiB)
    #[arg(long)]
    sram: Option<PathBuf>,
    /// FlashRAM save path (128 KiB)
    #[arg(long)]
    flashram: Option<PathBuf>,
    /// Controller setup: N=pad | N=mempak:<path> | N=rumble |
    /// N=transfer:<gb_rom>[,<gb_save>]
    #[arg(long = "controller")]
    controllers: Vec<String>,
    #[arg(long)]
    no_audio: bool,
    #[arg(long)]
    no_video: bool,
    /// Accepted for compatibility; the core is single emulation thread.
    #[arg(long)]
    multithread: bool,
    /// CSV event log path
    #[arg(long)]
    log: Option<PathBuf>,
    /// Refuse to boot on a PIF ROM mismatch instead of warning
    #[arg(long)]
    strict_boot: bool,
    /// Attach the interactive debugger
    #[arg(long)]
    debug: bool,
}

// Exit codes by phase: 2 options, 3 ROM loading, 4 save loading, 5 device.
fn main() {
    env_logger::init();
    let args = Args::parse();
    process::exit(run(args));
}

fn run(args: Args) -> i32 {
    let pifrom = match RomFile::open_exact(&args.pifrom, PIFROM_SIZE) {
        Ok(rom) => rom,
        Err(err) => {
            eprintln!("Failed to load PIF ROM: {}", err);
            return 3;
        }
    };
    let cart = match RomFile::open_cart(&args.cart) {
        Ok(rom) => rom,
        Err(err) => {
            eprintln!("Failed to load cart: {}", err);
            return 3;
        }
    };
    let dd_ipl = match &args.ddipl {
        Some(path) => match RomFile::open_exact(path, DD_IPL_SIZE) {
            Ok(rom) => Some(rom),
            Err(err) => {
                eprintln!("Failed to load DD IPL ROM: {}", err);
                return 3;
            }
        },
        None => None,
    };
    if args.ddrom.is_some() {
        log::warn!("--ddrom given, but the drive stub always reports no disk");
    }

    let log_sink = match &args.log {
        Some(path) => match EventLog::open(path) {
            Ok(sink) => sink,
            Err(err) => {
                eprintln!("Failed to open log file: {}", err);
                return 3;
            }
        },
        None => EventLog::disabled(),
    };

    let eeprom = match open_eeprom(&args) {
        Ok(eeprom) => eeprom,
        Err(code) => return code,
    };
    let cart_save = match open_cart_save(&args) {
        Ok(save) => save,
        Err(code) => return code,
    };
    let controllers = match open_controllers(&args.controllers) {
        Ok(controllers) => controllers,
        Err(code) => return code,
    };

    let config = Configuration {
        pifrom,
        cart,
        dd_ipl,
        cart_save,
        eeprom,
        controllers,
        log: log_sink,
        // SHA-1 classification is the launcher's job; unchecked here.
        pifrom_validation: RomValidation::Unchecked,
        strict_boot: args.strict_boot,
        no_audio: args.no_audio,
        no_video: args.no_video,
        debug: args.debug,
    };

    match en64::run(config) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Failed to run the device: {}", err);
            5
        }
    }
}

fn open_eeprom(args: &Args) -> Result<Option<Eeprom>, i32> {
    let path = match &args.eeprom {
        Some(path) => path,
        None => return Ok(None),
    };
    let (kind, size) = if args.eeprom_16k {
        (EepromKind::Eep16k, EEPROM_16K_SIZE)
    } else {
        (EepromKind::Eep4k, EEPROM_4K_SIZE)
    };
    match SaveFile::open(path, size, 0) {
        Ok((backing, _)) => Ok(Some(Eeprom { kind, backing })),
        Err(err) => {
            eprintln!("Failed to open EEPROM: {}", err);
            Err(4)
        }
    }
}

fn open_cart_save(args: &Args) -> Result<CartSave, i32> {
    if let Some(path) = &args.flashram {
        return match SaveFile::open(path, FLASHRAM_SIZE, 0xFF) {
            Ok((backing, _)) => Ok(CartSave::Flash(FlashRam::new(backing))),
            Err(err) => {
                eprintln!("Failed to open FlashRAM: {}", err);
                Err(4)
            }
        };
    }
    if let Some(path) = &args.sram {
        return match SaveFile::open(path, SRAM_SIZE, 0) {
            Ok((backing, _)) => Ok(CartSave::Sram(backing)),
            Err(err) => {
                eprintln!("Failed to open SRAM: {}", err);
                Err(4)
            }
        };
    }
    Ok(CartSave::None)
}

fn open_controllers(specs: &[String]) -> Result<[Controller; 4], i32> {
    let mut controllers = [
        Controller::standard(Pak::None),
        Controller::absent(),
        Controller::absent(),
        Controller::absent(),
    ];
    for spec in specs {
        let (port, rest) = match spec.split_once('=') {
            Some((port, rest)) => (port, rest),
            None => {
                eprintln!("Bad --controller spec: {}", spec);
                return Err(2);
            }
        };
        let port: usize = match port.parse::<usize>() {
            Ok(port @ 1..=4) => port - 1,
            _ => {
                eprintln!("Controller port must be 1-4: {}", spec);
                return Err(2);
            }
        };
        let mut parts = rest.splitn(2, ':');
        let kind = parts.next().unwrap_or("");
        let detail = parts.next();
        controllers[port] = match (kind, detail) {
            ("pad", _) => Controller::standard(Pak::None),
            ("rumble", _) => Controller::standard(Pak::Rumble { motor_on: false }),
            ("mempak", Some(path)) => {
                let (mut backing, created) = match SaveFile::open(path, MEMPAK_SIZE, 0) {
                    Ok(pair) => pair,
                    Err(err) => {
                        eprintln!("Can't open mempak file {}: {}", path, err);
                        return Err(4);
                    }
                };
                if created {
                    controller_pak_format(&mut backing.data);
                }
                Controller::standard(Pak::Mem(backing))
            }
            ("transfer", detail) => {
                let mut rom = None;
                let mut save = None;
                if let Some(detail) = detail {
                    let mut pieces = detail.splitn(2, ',');
                    if let Some(rom_path) = pieces.next().filter(|p| !p.is_empty()) {
                        rom = match RomFile::open(rom_path) {
                            Ok(rom) => Some(rom),
                            Err(err) => {
                                eprintln!("Can't open transfer pak ROM: {}", err);
                                return Err(4);
                            }
                        };
                    } else {
                        println!("No ROM supplied for transfer pak.");
                    }
                    if let Some(save_path) = pieces.next() {
                        save = match SaveFile::open(save_path, 0x8000, 0) {
                            Ok((backing, _)) => Some(backing),
                            Err(err) => {
                                eprintln!("Can't open transfer pak save: {}", err);
                                return Err(4);
                            }
                        };
                    }
                }
                Controller::standard(Pak::Transfer(TransferPak::new(rom, save)))
            }
            _ => {
                eprintln!("Unknown controller type in: {}", spec);
                return Err(2);
            }
        };
    }
    Ok(controllers)
}
