// The device: one of everything, advanced in a fixed round by the stepper.
// Each outer iteration is one VR4300 cycle; the RSP runs unless halted, the
// RDP consumes a command word every third cycle, and the AI/VI/PI/SI engines
// tick behind them. Interrupt lines all meet in the MI block.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::bus::Bus;
use crate::log::EventLog;
use crate::mi::IntSource;
use crate::pi::{Pi, PI_DMA_BUDGET};
use crate::pif::Pif;
use crate::si::SI_DMA_BUDGET;
use crate::vi::{Frame, ViEvent};
use crate::vr4300::Vr4300;

pub trait AudioSink: Send {
    fn push_samples(&mut self, samples: &[i16]);
}

pub type FrameHook = Box<dyn FnMut(&Frame) + Send>;

pub struct Device {
    pub cpu: Vr4300,
    pub bus: Bus,
    pub log: EventLog,
    running: Arc<AtomicBool>,
    frame: Arc<Mutex<Frame>>,
    frame_count: Arc<AtomicU64>,
    frame_hook: Option<FrameHook>,
    audio: Option<Box<dyn AudioSink>>,
    cycle: u64,
}

impl Device {
    pub fn new(pi: Pi, pif: Pif, log: EventLog) -> Device {
        Device {
            cpu: Vr4300::new(),
            bus: Bus::new(pi, pif),
            log,
            running: Arc::new(AtomicBool::new(false)),
            frame: Arc::new(Mutex::new(Frame { width: 1, height: 1, pixels: vec![0] })),
            frame_count: Arc::new(AtomicU64::new(0)),
            frame_hook: None,
            audio: None,
            cycle: 0,
        }
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn shared_frame(&self) -> (Arc<Mutex<Frame>>, Arc<AtomicU64>) {
        (Arc::clone(&self.frame), Arc::clone(&self.frame_count))
    }

    pub fn set_frame_hook(&mut self, hook: FrameHook) {
        self.frame_hook = Some(hook);
    }

    pub fn set_audio_sink(&mut self, sink: Box<dyn AudioSink>) {
        self.audio = Some(sink);
    }

    // One outer iteration of the stepper round.
    pub fn step(&mut self) {
        self.cpu.step(&mut self.bus);

        if !self.bus.rsp.halted() {
            let events = self.bus.rsp.step(&mut self.bus.rdp);
            if events.raise_interrupt {
                self.bus.mi.raise(IntSource::Sp);
            }
            if events.clear_interrupt {
                self.bus.mi.lower(IntSource::Sp);
            }
            self.bus.drain_sp_dma();
        }

        if self.cycle % 3 == 0 {
            let sync_full = {
                let bus = &mut self.bus;
                bus.rdp.step(&mut bus.rdram.mem, &bus.rsp.dmem)
            };
            if sync_full {
                self.bus.mi.raise(IntSource::Dp);
            }
        }

        if self.bus.ai.step(&self.bus.rdram) {
            self.bus.mi.raise(IntSource::Ai);
        }
        if let Some(sink) = &mut self.audio {
            if self.bus.ai.out.len() >= 2048 {
                sink.push_samples(&self.bus.ai.out);
                self.bus.ai.out.clear();
            }
        }

        match self.bus.vi.step() {
            ViEvent::None => {}
            ViEvent::Interrupt => self.bus.mi.raise(IntSource::Vi),
            ViEvent::FrameDone => self.publish_frame(),
            ViEvent::InterruptAndFrame => {
                self.bus.mi.raise(IntSource::Vi);
                self.publish_frame();
            }
        }

        if self.bus.pi.dma_step(&mut self.bus.rdram, PI_DMA_BUDGET) {
            self.bus.mi.raise(IntSource::Pi);
        }
        let si_done = {
            let bus = &mut self.bus;
            bus.si.dma_step(&mut bus.rdram, &mut bus.pif, SI_DMA_BUDGET)
        };
        if si_done {
            self.bus.mi.raise(IntSource::Si);
        }

        self.cycle += 1;
    }

    // The framebuffer is published under the lock, then the hook runs; the
    // counter store is the release fence presentation acquires on.
    fn publish_frame(&mut self) {
        let composed = self.bus.vi.compose_frame(&self.bus.rdram);
        if let Ok(mut shared) = self.frame.lock() {
            *shared = composed;
            if let Some(hook) = &mut self.frame_hook {
                hook(&shared);
            }
        }
        self.frame_count.fetch_add(1, Ordering::Release);
    }

    // Spins until the running flag clears, then flushes persistent state.
    pub fn run(&mut self) {
        self.running.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) {
            self.step();
        }
        self.teardown();
    }

    pub fn run_cycles(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.step();
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn teardown(&mut self) {
        if let Some(sink) = &mut self.audio {
            if !self.bus.ai.out.is_empty() {
                sink.push_samples(&self.bus.ai.out);
                self.bus.ai.out.clear();
            }
        }
        self.bus.pi.flush_saves();
        self.bus.pif.flush_saves();
        self.log.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pi::CartSave;
    use crate::rom::RomFile;

    fn test_device() -> Device {
        let pi = Pi::new(RomFile { data: vec![0; 0x1000] }, None, CartSave::None);
        let pif = Pif::new(vec![0; 0x7C0]);
        Device::new(pi, pif, EventLog::disabled())
    }

    #[test]
    fn stepper_advances_cycle_counter() {
        let mut device = test_device();
        device.run_cycles(10);
        assert_eq!(device.cycle, 10);
        assert_eq!(device.cpu.cycles, 10);
    }

    #[test]
    fn stop_clears_running_within_one_iteration() {
        let mut device = test_device();
        let flag = device.running_flag();
        flag.store(true, Ordering::Release);
        device.stop();
        // run() would exit immediately now.
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn vi_interrupt_reaches_mi_pending() {
        let mut device = test_device();
        device.bus.vi.write_reg(crate::vi::VI_INTR_REG, 2);
        device.bus.vi.write_reg(crate::vi::VI_V_SYNC_REG, 10);
        // Enough cycles for a few lines.
        device.run_cycles(400_000);
        assert!(device.bus.mi.read_reg(crate::mi::MI_INTR_REG) & (1 << 3) != 0);
    }

    #[test]
    fn frame_publication_bumps_counter() {
        let mut device = test_device();
        device.bus.vi.write_reg(crate::vi::VI_V_SYNC_REG, 2);
        device.bus.vi.write_reg(crate::vi::VI_WIDTH_REG, 4);
        let (_, frames) = device.shared_frame();
        device.run_cycles(3_200_000);
        assert!(frames.load(Ordering::Acquire) > 0);
    }
}
