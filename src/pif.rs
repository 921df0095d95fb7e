// PIF boot ROM, PIF RAM, and the joybus behind them: controllers with their
// accessory paks plus the cart-channel EEPROM and RTC. Commands are laid into
// PIF RAM by an SI write DMA and answered in place before the read DMA drains
// them back out.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::save::SaveFile;
use crate::rom::RomFile;

pub const PIF_RAM_SIZE: usize = 64;

// Published by the presentation thread, read by the controller-poll path.
// One word per port: buttons in the low half, stick axes above.
pub struct InputState {
    ports: [AtomicU32; 4],
}

impl InputState {
    pub fn new() -> Arc<InputState> {
        Arc::new(InputState {
            ports: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
        })
    }

    pub fn publish(&self, port: usize, buttons: u16, stick_x: i8, stick_y: i8) {
        let word =
            buttons as u32 | (stick_x as u8 as u32) << 16 | (stick_y as u8 as u32) << 24;
        self.ports[port & 3].store(word, Ordering::Release);
    }

    pub fn snapshot(&self, port: usize) -> (u16, i8, i8) {
        let word = self.ports[port & 3].load(Ordering::Acquire);
        (word as u16, (word >> 16) as u8 as i8, (word >> 24) as u8 as i8)
    }
}

pub enum Pak {
    None,
    Rumble { motor_on: bool },
    Mem(SaveFile),
    Transfer(TransferPak),
}

pub struct Controller {
    pub present: bool,
    pub pak: Pak,
}

impl Controller {
    pub fn absent() -> Controller {
        Controller { present: false, pak: Pak::None }
    }

    pub fn standard(pak: Pak) -> Controller {
        Controller { present: true, pak }
    }
}

pub enum EepromKind {
    Eep4k,
    Eep16k,
}

pub struct Eeprom {
    pub kind: EepromKind,
    pub backing: SaveFile,
}

pub struct Pif {
    pub rom: Vec<u8>,
    pub ram: [u8; PIF_RAM_SIZE],
    pub controllers: [Controller; 4],
    pub eeprom: Option<Eeprom>,
    pub input: Arc<InputState>,
}

const CMD_INFO: u8 = 0x00;
const CMD_CONTROLLER_READ: u8 = 0x01;
const CMD_PAK_READ: u8 = 0x02;
const CMD_PAK_WRITE: u8 = 0x03;
const CMD_EEPROM_READ: u8 = 0x04;
const CMD_EEPROM_WRITE: u8 = 0x05;
const CMD_RTC_INFO: u8 = 0x06;
const CMD_RESET: u8 = 0xFF;

impl Pif {
    pub fn new(rom: Vec<u8>) -> Pif {
        let mut ram = [0u8; PIF_RAM_SIZE];
        // CIC seed words the boot ROM expects to find.
        ram[0x26] = 0x3F;
        ram[0x27] = 0x3F;
        Pif {
            rom,
            ram,
            controllers: [
                Controller::standard(Pak::None),
                Controller::absent(),
                Controller::absent(),
                Controller::absent(),
            ],
            eeprom: None,
            input: InputState::new(),
        }
    }

    pub fn read_rom_byte(&self, offset: usize) -> u8 {
        self.rom.get(offset).copied().unwrap_or(0)
    }

    // Called when a write DMA finishes. The control byte gets acknowledged;
    // command execution itself waits for the read-back kick.
    pub fn command_setup(&mut self) {
        let control = self.ram[0x3F];
        if control & 0x08 != 0 {
            // Boot terminator; the PIF would lock the boot ROM here.
            self.ram[0x3F] &= !0x08;
        }
    }

    // Walks the channel assignments in PIF RAM and answers each command.
    pub fn run_joybus(&mut self) {
        let mut channel = 0usize;
        let mut i = 0usize;
        while i < PIF_RAM_SIZE - 1 && channel < 6 {
            let t = self.ram[i];
            match t {
                0x00 => {
                    channel += 1;
                    i += 1;
                }
                0xFD => {
                    // Channel reset; treated as skip.
                    channel += 1;
                    i += 1;
                }
                0xFE => break,
                0xFF => i += 1,
                _ => {
                    let tx = (t & 0x3F) as usize;
                    let rx = (self.ram[i + 1] & 0x3F) as usize;
                    if i + 2 + tx + rx > PIF_RAM_SIZE {
                        break;
                    }
                    let handled = self.run_command(channel, i, tx, rx);
                    if !handled {
                        // Device absent: flag bit 7 of the rx count byte.
                        self.ram[i + 1] |= 0x80;
                    }
                    channel += 1;
                    i += 2 + tx + rx;
                }
            }
        }
    }

    fn run_command(&mut self, channel: usize, base: usize, tx: usize, rx: usize) -> bool {
        if tx == 0 {
            return true;
        }
        let cmd = self.ram[base + 2];
        let rx_base = base + 2 + tx;
        if channel < 4 {
            if !self.controllers[channel].present {
                return false;
            }
            match cmd {
                CMD_INFO | CMD_RESET => {
                    let has_pak = !matches!(self.controllers[channel].pak, Pak::None);
                    let reply = [0x05, 0x00, if has_pak { 0x01 } else { 0x02 }];
                    self.fill_rx(rx_base, rx, &reply);
                }
                CMD_CONTROLLER_READ => {
                    let (buttons, x, y) = self.input.snapshot(channel);
                    let reply = [(buttons >> 8) as u8, buttons as u8, x as u8, y as u8];
                    self.fill_rx(rx_base, rx, &reply);
                }
                CMD_PAK_READ => {
                    let addr = (self.ram[base + 3] as u16) << 8 | self.ram[base + 4] as u16;
                    let mut data = [0u8; 32];
                    self.pak_read(channel, addr & !0x1F, &mut data);
                    let crc = pak_data_crc(&data);
                    for (k, &byte) in data.iter().enumerate().take(rx.saturating_sub(1)) {
                        self.ram[rx_base + k] = byte;
                    }
                    if rx > 0 {
                        self.ram[rx_base + rx - 1] = crc;
                    }
                }
                CMD_PAK_WRITE => {
                    let addr = (self.ram[base + 3] as u16) << 8 | self.ram[base + 4] as u16;
                    let mut data = [0u8; 32];
                    for (k, byte) in data.iter_mut().enumerate() {
                        *byte = self.ram[base + 5 + k];
                    }
                    self.pak_write(channel, addr & !0x1F, &data);
                    let crc = pak_data_crc(&data);
                    self.fill_rx(rx_base, rx, &[crc]);
                }
                _ => return false,
            }
            return true;
        }
        // Channel 4: the cart slot.
        match cmd {
            CMD_INFO | CMD_RESET => match &self.eeprom {
                Some(eeprom) => {
                    let id = match eeprom.kind {
                        EepromKind::Eep4k => 0x80,
                        EepromKind::Eep16k => 0xC0,
                    };
                    self.fill_rx(rx_base, rx, &[0x00, id, 0x00]);
                    true
                }
                None => false,
            },
            CMD_EEPROM_READ => match &self.eeprom {
                Some(eeprom) => {
                    let block = self.ram[base + 3] as usize;
                    let mut data = [0u8; 8];
                    eeprom.backing.read(block * 8, &mut data);
                    self.fill_rx(rx_base, rx, &data);
                    true
                }
                None => false,
            },
            CMD_EEPROM_WRITE => match &mut self.eeprom {
                Some(eeprom) => {
                    let block = self.ram[base + 3] as usize;
                    let mut data = [0u8; 8];
                    for (k, byte) in data.iter_mut().enumerate() {
                        *byte = self.ram[base + 4 + k];
                    }
                    eeprom.backing.write(block * 8, &data);
                    self.fill_rx(rx_base, rx, &[0x00]);
                    true
                }
                None => false,
            },
            CMD_RTC_INFO => {
                self.fill_rx(rx_base, rx, &[0x00, 0x10, 0x00]);
                true
            }
            _ => false,
        }
    }

    fn fill_rx(&mut self, rx_base: usize, rx: usize, reply: &[u8]) {
        for k in 0..rx.min(reply.len()) {
            self.ram[rx_base + k] = reply[k];
        }
    }

    fn pak_read(&mut self, channel: usize, addr: u16, out: &mut [u8; 32]) {
        match &mut self.controllers[channel].pak {
            Pak::Mem(save) => save.read(addr as usize, out),
            Pak::Rumble { .. } => {
                // Probe region identifies the rumble pak.
                let fill = if (0x8000..0x9000).contains(&addr) { 0x80 } else { 0 };
                out.iter_mut().for_each(|b| *b = fill);
            }
            Pak::Transfer(tpak) => tpak.read(addr, out),
            Pak::None => out.iter_mut().for_each(|b| *b = 0),
        }
    }

    fn pak_write(&mut self, channel: usize, addr: u16, data: &[u8; 32]) {
        match &mut self.controllers[channel].pak {
            Pak::Mem(save) => save.write(addr as usize, data),
            Pak::Rumble { motor_on } => {
                if addr == 0xC000 {
                    *motor_on = data[31] & 1 != 0;
                }
            }
            Pak::Transfer(tpak) => tpak.write(addr, data),
            Pak::None => {}
        }
    }

    pub fn flush_saves(&mut self) {
        for controller in self.controllers.iter_mut() {
            let result = match &mut controller.pak {
                Pak::Mem(save) => save.flush(),
                Pak::Transfer(tpak) => tpak.flush(),
                _ => Ok(()),
            };
            if let Err(err) = result {
                log::warn!("controller pak flush failed: {}", err);
            }
        }
        if let Some(eeprom) = &mut self.eeprom {
            if let Err(err) = eeprom.backing.flush() {
                log::warn!("eeprom flush failed: {}", err);
            }
        }
    }
}

// Transfer pak: a register window over a Game Boy cart. Bank 0xC000..0xFFFF
// exposes 16 KiB of GB address space selected by the bank register.
pub struct TransferPak {
    pub rom: Option<RomFile>,
    pub save: Option<SaveFile>,
    enabled: bool,
    powered: bool,
    bank: u8,
}

impl TransferPak {
    pub fn new(rom: Option<RomFile>, save: Option<SaveFile>) -> TransferPak {
        TransferPak { rom, save, enabled: false, powered: false, bank: 0 }
    }

    fn read(&mut self, addr: u16, out: &mut [u8; 32]) {
        match addr {
            0x8000..=0x8FFF => {
                let fill = if self.enabled { 0x84 } else { 0x00 };
                out.iter_mut().for_each(|b| *b = fill);
            }
            0xB000..=0xBFFF => {
                let status = if !self.enabled {
                    0x00
                } else {
                    let mut status = 0x80; // access mode ready
                    if self.powered {
                        status |= 0x01;
                    }
                    if self.rom.is_none() {
                        status |= 0x40; // no cart
                    }
                    status
                };
                out.iter_mut().for_each(|b| *b = status);
            }
            0xC000..=0xFFFF => {
                let base = self.bank as usize * 0x4000 + (addr as usize - 0xC000);
                for (k, byte) in out.iter_mut().enumerate() {
                    *byte = self.gb_read(base + k);
                }
            }
            _ => out.iter_mut().for_each(|b| *b = 0),
        }
    }

    fn write(&mut self, addr: u16, data: &[u8; 32]) {
        match addr {
            0x8000..=0x8FFF => match data[0] {
                0x84 => self.enabled = true,
                0xFE => self.enabled = false,
                _ => {}
            },
            0xA000..=0xAFFF => self.bank = data[0] & 0x3,
            0xB000..=0xBFFF => self.powered = data[0] & 1 != 0,
            0xC000..=0xFFFF => {
                // GB-side stores only matter for cart RAM banks.
                let base = self.bank as usize * 0x4000 + (addr as usize - 0xC000);
                if let Some(save) = &mut self.save {
                    if (0xA000..0xC000).contains(&(base & 0xFFFF)) {
                        let offset = base & 0x1FFF;
                        save.write(offset, data);
                    }
                }
            }
            _ => {}
        }
    }

    fn gb_read(&self, gb_addr: usize) -> u8 {
        if gb_addr < 0x8000 {
            if let Some(rom) = &self.rom {
                return rom.data.get(gb_addr).copied().unwrap_or(0xFF);
            }
            return 0xFF;
        }
        if (0xA000..0xC000).contains(&(gb_addr & 0xFFFF)) {
            if let Some(save) = &self.save {
                return save.data.get(gb_addr & 0x1FFF).copied().unwrap_or(0xFF);
            }
        }
        0xFF
    }

    fn flush(&mut self) -> Result<(), crate::save::SaveError> {
        match &mut self.save {
            Some(save) => save.flush(),
            None => Ok(()),
        }
    }
}

// The standard joybus data CRC over a 32-byte pak payload.
pub fn pak_data_crc(data: &[u8; 32]) -> u8 {
    let mut crc = 0u8;
    for i in 0..=32 {
        for bit in (0..8).rev() {
            let xor_tap = if crc & 0x80 != 0 { 0x85 } else { 0 };
            crc <<= 1;
            if i < 32 && data[i] & (1 << bit) != 0 {
                crc |= 1;
            }
            crc ^= xor_tap;
        }
    }
    crc
}

// The 5-bit address CRC folded into the low bits of a pak address.
pub fn pak_addr_crc(addr: u16) -> u16 {
    const MASKS: [u16; 11] = [0x01, 0x1A, 0x0D, 0x1C, 0x0E, 0x07, 0x19, 0x16, 0x0B, 0x1F, 0x15];
    let mut crc = 0u16;
    for (i, mask) in MASKS.iter().enumerate() {
        if addr & (1 << (i + 5)) != 0 {
            crc ^= mask;
        }
    }
    (addr & !0x1F) | crc
}
