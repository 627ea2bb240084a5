// SPDX-License-Identifier: Apache-2.0
#![allow(missing_docs, dead_code)]

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// In-memory sink whose bytes stay reachable after the recorder consumes it.
#[derive(Clone, Default)]
pub struct SharedSink(pub Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().expect("sink lock").clone()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("sink lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that accepts `healthy_writes` calls, then fails forever.
pub struct FailingSink {
    pub healthy_writes: usize,
    seen: usize,
}

impl FailingSink {
    pub fn new(healthy_writes: usize) -> Self {
        Self {
            healthy_writes,
            seen: 0,
        }
    }
}

impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.seen += 1;
        if self.seen > self.healthy_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "sink exploded"));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Best-effort tracing subscriber for test diagnostics.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
