// Comma-separated event log. The sink is injected into the device at
// construction and travels with it; no component reaches for process-wide
// state. Diagnostics go through the `log` facade instead.

use std::fs::File;
use std::io;
use std::io::{BufWriter, Write};
use std::path::Path;

pub struct EventLog {
    writer: Option<BufWriter<File>>,
}

impl EventLog {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<EventLog> {
        let file = File::create(path)?;
        Ok(EventLog { writer: Some(BufWriter::new(file)) })
    }

    pub fn disabled() -> EventLog {
        EventLog { writer: None }
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn emit(&mut self, record: &str) {
        if let Some(writer) = &mut self.writer {
            if writeln!(writer, "{}", record).is_err() {
                log::warn!("event log write failed, disabling sink");
                self.writer = None;
            }
        }
    }

    pub fn rom_record(&mut self, id: &str, regions: &str, desc: &str, hdr_hi: u32, hdr_lo: u32) {
        let record = format!("ROM,{},{},{},{:08X},{:08X}", id, regions, desc, hdr_hi, hdr_lo);
        self.emit(&record);
    }

    // Closes only when a writer is actually open.
    pub fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        self.close();
    }
}
