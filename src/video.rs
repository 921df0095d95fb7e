// Presentation surface: a minifb window on the invoking thread. It pulls the
// frame the VI published whenever the frame counter moves, and publishes the
// input snapshot the PIF reads. Closing the window clears the running flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use minifb::{Key, Window, WindowOptions};

use crate::pif::InputState;
use crate::vi::Frame;

const BUTTON_A: u16 = 0x8000;
const BUTTON_B: u16 = 0x4000;
const BUTTON_Z: u16 = 0x2000;
const BUTTON_START: u16 = 0x1000;
const BUTTON_D_UP: u16 = 0x0800;
const BUTTON_D_DOWN: u16 = 0x0400;
const BUTTON_D_LEFT: u16 = 0x0200;
const BUTTON_D_RIGHT: u16 = 0x0100;
const BUTTON_L: u16 = 0x0020;
const BUTTON_R: u16 = 0x0010;
const BUTTON_C_UP: u16 = 0x0008;
const BUTTON_C_DOWN: u16 = 0x0004;
const BUTTON_C_LEFT: u16 = 0x0002;
const BUTTON_C_RIGHT: u16 = 0x0001;

pub fn present(
    running: Arc<AtomicBool>,
    frame: Arc<Mutex<Frame>>,
    frame_count: Arc<AtomicU64>,
    input: Arc<InputState>,
) {
    let mut window = match Window::new("en64 - ESC to exit", 640, 480, WindowOptions::default()) {
        Ok(window) => window,
        Err(err) => {
            log::error!("could not open the video window: {}", err);
            running.store(false, Ordering::Release);
            return;
        }
    };
    window.limit_update_rate(Some(Duration::from_micros(16_667)));

    let mut seen = 0u64;
    while window.is_open()
        && !window.is_key_down(Key::Escape)
        && running.load(Ordering::Acquire)
    {
        input.publish(0, poll_buttons(&window), poll_stick_x(&window), poll_stick_y(&window));

        let published = frame_count.load(Ordering::Acquire);
        if published != seen {
            seen = published;
            if let Ok(frame) = frame.lock() {
                if frame.pixels.len() >= frame.width * frame.height && frame.width > 1 {
                    let _ = window.update_with_buffer(&frame.pixels, frame.width, frame.height);
                    continue;
                }
            }
        }
        window.update();
    }
    running.store(false, Ordering::Release);
}

fn poll_buttons(window: &Window) -> u16 {
    let mut buttons = 0;
    let map = [
        (Key::X, BUTTON_A),
        (Key::C, BUTTON_B),
        (Key::Z, BUTTON_Z),
        (Key::Enter, BUTTON_START),
        (Key::T, BUTTON_D_UP),
        (Key::G, BUTTON_D_DOWN),
        (Key::F, BUTTON_D_LEFT),
        (Key::H, BUTTON_D_RIGHT),
        (Key::A, BUTTON_L),
        (Key::S, BUTTON_R),
        (Key::I, BUTTON_C_UP),
        (Key::K, BUTTON_C_DOWN),
        (Key::J, BUTTON_C_LEFT),
        (Key::L, BUTTON_C_RIGHT),
    ];
    for (key, bit) in map.iter() {
        if window.is_key_down(*key) {
            buttons |= bit;
        }
    }
    buttons
}

fn poll_stick_x(window: &Window) -> i8 {
    if window.is_key_down(Key::Left) {
        -80
    } else if window.is_key_down(Key::Right) {
        80
    } else {
        0
    }
}

fn poll_stick_y(window: &Window) -> i8 {
    if window.is_key_down(Key::Down) {
        -80
    } else if window.is_key_down(Key::Up) {
        80
    } else {
        0
    }
}
