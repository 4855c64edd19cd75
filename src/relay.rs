//! Single-slot hand-off of the newest captured frame to inference.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use crate::worker::lock;

/// An opaque image buffer as produced by the capture device.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: Instant,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Latest-frame-wins relay. A pending frame that was never taken is replaced
/// by the next submission, so a slow consumer never backs up the producer.
#[derive(Debug, Default)]
pub struct FrameRelay {
    slot: Mutex<Option<Frame>>,
    submitted: AtomicU64,
    dropped: AtomicU64,
}

impl FrameRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, frame: Frame) {
        let stale = lock(&self.slot).replace(frame);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        if stale.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn take(&self) -> Option<Frame> {
        lock(&self.slot).take()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Frames replaced before inference got to them.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
