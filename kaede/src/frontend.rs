//! The headless frontend: no window, no renderer, just frame accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kaede_core::{Frontend, OutputSink};

pub struct HeadlessOutput {
    allowed: bool,
    frames: Arc<AtomicU64>,
}

impl OutputSink for HeadlessOutput {
    fn is_output_allowed(&self) -> bool {
        self.allowed
    }

    fn swap_buffers(&mut self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct HeadlessFrontend {
    allowed: bool,
    frames: Arc<AtomicU64>,
}

impl HeadlessFrontend {
    pub fn new(output_allowed: bool) -> Self {
        Self {
            allowed: output_allowed,
            frames: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl Frontend for HeadlessFrontend {
    fn create_output(&mut self) -> Result<Box<dyn OutputSink>, String> {
        Ok(Box::new(HeadlessOutput {
            allowed: self.allowed,
            frames: self.frames.clone(),
        }))
    }
}
