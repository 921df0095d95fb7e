// Audio output: the rodio stream lives on its own thread (the stream handle
// is not Send), fed over a channel by the emulation thread's AI drain.

use std::sync::mpsc::{channel, Sender};
use std::thread;

use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};

use crate::device::AudioSink;

const OUTPUT_RATE: u32 = 44_100;

pub struct AudioOut {
    sender: Sender<Vec<i16>>,
}

impl AudioOut {
    pub fn spawn() -> AudioOut {
        let (sender, receiver) = channel::<Vec<i16>>();
        thread::Builder::new()
            .name(String::from("audio"))
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("no audio output available: {}", err);
                        // Drain silently so the emulation side never blocks.
                        while receiver.recv().is_ok() {}
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(sink) => sink,
                    Err(err) => {
                        log::warn!("could not create audio sink: {}", err);
                        while receiver.recv().is_ok() {}
                        return;
                    }
                };
                while let Ok(samples) = receiver.recv() {
                    sink.append(SamplesBuffer::new(2, OUTPUT_RATE, samples));
                }
                sink.sleep_until_end();
            })
            .expect("audio thread");
        AudioOut { sender }
    }
}

impl AudioSink for AudioOut {
    fn push_samples(&mut self, samples: &[i16]) {
        // A closed receiver just means audio went away; drop the samples.
        let _ = self.sender.send(samples.to_vec());
    }
}
