//! The plugin interface and the capability traits plugins can advertise.
//!
//! A plugin module exports three C symbols (see [`register_plugin!`]): a
//! factory, a matching destructor, and the API version it was built
//! against. The host never frees a plugin object itself; it always hands it
//! back to the module's `destroy_plugin`.
//!
//! Capabilities replace downcasting. A plugin that is, say, a layer returns
//! `Some(self)` from [`Plugin::as_layer`], and the host finds every such
//! plugin with a capability query on the registry.
//!
//! [`register_plugin!`]: crate::register_plugin

use crate::context::PluginContext;
use crate::error::PluginError;
use crate::events::LogMessageEvent;
use crate::log::LogLevel;
use std::sync::Arc;
use std::time::Duration;

/// Bumped whenever the plugin-facing ABI changes.
pub const PLUGIN_API_VERSION: u32 = 1;

pub const CREATE_PLUGIN_SYMBOL: &str = "create_plugin";
pub const DESTROY_PLUGIN_SYMBOL: &str = "destroy_plugin";
pub const API_VERSION_SYMBOL: &str = "tbx_plugin_api_version";

pub type CreatePluginFn = unsafe extern "C" fn() -> *mut dyn Plugin;
pub type DestroyPluginFn = unsafe extern "C" fn(*mut dyn Plugin);
pub type ApiVersionFn = extern "C" fn() -> u32;

/// The three entry points a plugin module exports.
#[derive(Clone, Copy)]
pub struct PluginExports {
    pub create: CreatePluginFn,
    pub destroy: DestroyPluginFn,
    pub api_version: ApiVersionFn,
}

impl std::fmt::Debug for PluginExports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginExports")
            .field("create", &(self.create as *const ()))
            .field("destroy", &(self.destroy as *const ()))
            .field("api_version", &(self.api_version as *const ()))
            .finish()
    }
}

/// Base interface of every plugin.
///
/// Plugin objects are shared between the registry and any capability
/// handles the host gives out, so every method takes `&self`. Keep mutable
/// state behind a lock.
pub trait Plugin: Send + Sync {
    /// Called once, right after construction and before any event reaches
    /// the plugin. Returning an error unloads the plugin again.
    fn on_load(&self, context: &Arc<PluginContext>) -> Result<(), PluginError>;

    /// Called once before the plugin object is destroyed.
    fn on_unload(&self, _context: &Arc<PluginContext>) -> Result<(), PluginError> {
        Ok(())
    }

    fn as_logger(&self) -> Option<&(dyn LoggerPlugin + 'static)> {
        None
    }

    fn as_layer(&self) -> Option<&(dyn Layer + 'static)> {
        None
    }

    fn as_app(&self) -> Option<&(dyn AppPlugin + 'static)> {
        None
    }
}

/// A capability a plugin may advertise, queried by the registry.
pub trait Capability: Send + Sync + 'static {
    /// Name used in log output.
    const NAME: &'static str;

    fn query(plugin: &dyn Plugin) -> Option<&Self>;
}

// ============================================================================
// Capabilities
// ============================================================================

/// A sink for host log records.
///
/// Loggers are loaded before every other plugin and unloaded after them.
pub trait LoggerPlugin: Send + Sync {
    fn write(&self, record: &LogMessageEvent);

    /// Records below this level are not forwarded.
    fn max_level(&self) -> LogLevel {
        LogLevel::Trace
    }

    fn flush(&self) {}
}

/// Timing information handed to layers and the app each frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameContext {
    /// Zero-based index of the frame
    pub frame: u64,
    /// Time since the previous frame
    pub delta: Duration,
    /// Time since the app launched
    pub elapsed: Duration,
}

/// A named unit of per-frame work.
pub trait Layer: Send + Sync {
    fn name(&self) -> &str;

    /// Overlays are updated after every normal layer.
    fn is_overlay(&self) -> bool {
        false
    }

    fn on_attach(&self) {}

    fn on_detach(&self) {}

    fn on_update(&self, frame: &FrameContext) -> Result<(), PluginError>;
}

/// Launch parameters supplied by the app plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSettings {
    pub name: String,
    pub window_title: String,
    pub window_width: u32,
    pub window_height: u32,
    /// Minimum frame duration; `None` uses the host's setting
    pub frame_interval: Option<Duration>,
}

impl AppSettings {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            window_title: name.clone(),
            name,
            window_width: 1280,
            window_height: 720,
            frame_interval: None,
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    pub fn with_window(mut self, title: impl Into<String>, width: u32, height: u32) -> Self {
        self.window_title = title.into();
        self.window_width = width;
        self.window_height = height;
        self
    }
}

/// The application plugin. Exactly one must be loaded for the host to run.
pub trait AppPlugin: Send + Sync {
    fn settings(&self) -> AppSettings;

    fn on_launch(&self) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_update(&self, _frame: &FrameContext) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_shutdown(&self) {}
}

impl Capability for dyn LoggerPlugin {
    const NAME: &'static str = "logger";

    fn query(plugin: &dyn Plugin) -> Option<&Self> {
        plugin.as_logger()
    }
}

impl Capability for dyn Layer {
    const NAME: &'static str = "layer";

    fn query(plugin: &dyn Plugin) -> Option<&Self> {
        plugin.as_layer()
    }
}

impl Capability for dyn AppPlugin {
    const NAME: &'static str = "app";

    fn query(plugin: &dyn Plugin) -> Option<&Self> {
        plugin.as_app()
    }
}
