//! Reference app plugin.
//!
//! The sandbox is the app (it supplies the window settings and closes itself
//! after a fixed number of frames) and also an overlay layer that reports
//! the frame rate every [`REPORT_EVERY`] frames.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tbx_core::{
    register_plugin, AppClosedEvent, AppLaunchedEvent, AppPlugin, AppSettings, CloseAppRequest,
    FrameContext, Layer, LogLevel, Plugin, PluginContext, PluginError,
};

/// Frames the sandbox runs before asking to close.
pub const DEFAULT_FRAMES: u64 = 600;
pub const REPORT_EVERY: u64 = 120;

#[derive(Debug, Default)]
struct FrameStats {
    frames: u64,
    busy: Duration,
}

pub struct Sandbox {
    frames_to_run: u64,
    context: Mutex<Option<Arc<PluginContext>>>,
    stats: Mutex<FrameStats>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::with_frames(DEFAULT_FRAMES)
    }

    pub fn with_frames(frames_to_run: u64) -> Self {
        Self {
            frames_to_run,
            context: Mutex::new(None),
            stats: Mutex::new(FrameStats::default()),
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if let Some(context) = self.context.lock().as_ref() {
            context.log(level, message);
        }
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for Sandbox {
    fn on_load(&self, context: &Arc<PluginContext>) -> Result<(), PluginError> {
        let weak: Weak<PluginContext> = Arc::downgrade(context);
        context.subscribe(move |_: &mut AppLaunchedEvent| {
            if let Some(context) = weak.upgrade() {
                context.log(LogLevel::Info, "Sandbox launched");
            }
        });

        let weak = Arc::downgrade(context);
        context.subscribe(move |closed: &mut AppClosedEvent| {
            if let Some(context) = weak.upgrade() {
                let verb = if closed.restarting { "restarting" } else { "closed" };
                context.log(LogLevel::Info, format!("Sandbox {}", verb));
            }
        });

        *self.context.lock() = Some(context.clone());
        Ok(())
    }

    fn on_unload(&self, _context: &Arc<PluginContext>) -> Result<(), PluginError> {
        self.context.lock().take();
        Ok(())
    }

    fn as_layer(&self) -> Option<&(dyn Layer + 'static)> {
        Some(self)
    }

    fn as_app(&self) -> Option<&(dyn AppPlugin + 'static)> {
        Some(self)
    }
}

impl AppPlugin for Sandbox {
    fn settings(&self) -> AppSettings {
        AppSettings::new("Sandbox")
            .with_window("Tbx Sandbox", 1280, 720)
            .with_frame_interval(Duration::from_millis(16))
    }

    fn on_launch(&self) -> Result<(), PluginError> {
        *self.stats.lock() = FrameStats::default();
        self.log(
            LogLevel::Debug,
            format!("Running for {} frames", self.frames_to_run),
        );
        Ok(())
    }

    fn on_update(&self, frame: &FrameContext) -> Result<(), PluginError> {
        if frame.frame + 1 == self.frames_to_run {
            let context = self.context.lock().clone();
            if let Some(context) = context {
                context.bus().send(&mut CloseAppRequest::new());
            }
        }
        Ok(())
    }

    fn on_shutdown(&self) {
        let stats = self.stats.lock();
        self.log(
            LogLevel::Info,
            format!("Sandbox ran {} frames", stats.frames),
        );
    }
}

impl Layer for Sandbox {
    fn name(&self) -> &str {
        "Frame Stats"
    }

    fn is_overlay(&self) -> bool {
        true
    }

    fn on_update(&self, frame: &FrameContext) -> Result<(), PluginError> {
        let report = {
            let mut stats = self.stats.lock();
            stats.frames += 1;
            stats.busy += frame.delta;
            if stats.frames % REPORT_EVERY != 0 {
                return Ok(());
            }
            let window = std::mem::take(&mut stats.busy);
            let fps = REPORT_EVERY as f64 / window.as_secs_f64().max(f64::EPSILON);
            format!("Frame {}: {:.1} fps", frame.frame, fps)
        };
        self.log(LogLevel::Info, report);
        Ok(())
    }
}

register_plugin!(Sandbox);
