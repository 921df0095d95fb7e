use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use thiserror::Error;

pub mod ai;
pub mod audio;
pub mod bus;
pub mod debugger;
pub mod device;
pub mod log;
pub mod mi;
pub mod pi;
pub mod pif;
pub mod rdp;
pub mod rdram;
pub mod rom;
pub mod rsp;
pub mod save;
pub mod si;
pub mod vi;
pub mod video;
pub mod vr4300;

use device::Device;
use log::EventLog;
use pi::{CartSave, Pi};
use pif::{Controller, Eeprom, Pif};
use rom::{CartId, RomFile, RomValidation};

pub struct Configuration {
    pub pifrom: RomFile,
    pub cart: RomFile,
    pub dd_ipl: Option<RomFile>,
    pub cart_save: CartSave,
    pub eeprom: Option<Eeprom>,
    pub controllers: [Controller; 4],
    pub log: EventLog,
    pub pifrom_validation: RomValidation,
    pub strict_boot: bool,
    pub no_audio: bool,
    pub no_video: bool,
    pub debug: bool,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("unknown or corrupted PIF ROM refused in strict mode")]
    StrictBoot,
    #[error("failed to spawn the emulation thread: {0}")]
    Thread(std::io::Error),
    #[error("emulation thread panicked")]
    Join,
}

pub fn build_device(mut config: Configuration) -> Result<Device, LaunchError> {
    match config.pifrom_validation {
        RomValidation::Mismatch => {
            ::log::warn!("PIF ROM did not match any known image");
            config.log.emit("PIFROM,mismatch");
            if config.strict_boot {
                return Err(LaunchError::StrictBoot);
            }
        }
        other => ::log::info!("using {} PIF ROM", other.describe()),
    }

    if let Some(id) = CartId::from_header(&config.cart) {
        println!(
            "Detected cart: {}[{}] - {}",
            id.rom_id, id.region, id.description
        );
        config.log.rom_record(
            &id.rom_id,
            &id.region.to_string(),
            &id.description,
            id.hdr_hi,
            id.hdr_lo,
        );
    }

    let pi = Pi::new(config.cart, config.dd_ipl, config.cart_save);
    let mut pif = Pif::new(config.pifrom.data);
    pif.controllers = config.controllers;
    pif.eeprom = config.eeprom;
    Ok(Device::new(pi, pif, config.log))
}

// Builds the device, spins the emulation thread, and keeps the presentation
// surface on the calling thread. The running flag is the only teardown
// signal either side needs.
pub fn run(config: Configuration) -> Result<(), LaunchError> {
    let no_audio = config.no_audio;
    let no_video = config.no_video;
    let debug = config.debug;
    let mut device = build_device(config)?;

    if !no_audio {
        device.set_audio_sink(Box::new(audio::AudioOut::spawn()));
    }

    let running = device.running_flag();
    let (frame, frame_count) = device.shared_frame();
    let input = Arc::clone(&device.bus.pif.input);

    running.store(true, Ordering::Release);
    let handle = thread::Builder::new()
        .name(String::from("emulation"))
        .spawn(move || {
            if debug {
                let mut debugger = debugger::Debugger::new();
                debugger.run(&mut device);
            } else {
                device.run();
            }
        })
        .map_err(LaunchError::Thread)?;

    if !no_video {
        video::present(Arc::clone(&running), frame, frame_count, input);
        running.store(false, Ordering::Release);
    }

    handle.join().map_err(|_| LaunchError::Join)?;
    Ok(())
}
