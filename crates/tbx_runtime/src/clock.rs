use std::time::{Duration, Instant};
use tbx_core::FrameContext;

/// Measures the time between frames.
#[derive(Debug, Clone)]
pub struct DeltaClock {
    started: Instant,
    last: Instant,
    frames: u64,
}

impl Default for DeltaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
            frames: 0,
        }
    }

    /// Starts a new frame and returns its timing.
    pub fn tick(&mut self) -> FrameContext {
        let now = Instant::now();
        let context = FrameContext {
            frame: self.frames,
            delta: now.duration_since(self.last),
            elapsed: now.duration_since(self.started),
        };
        self.last = now;
        self.frames += 1;
        context
    }

    /// Number of frames started so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Time since the current frame started.
    pub fn since_tick(&self) -> Duration {
        self.last.elapsed()
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
