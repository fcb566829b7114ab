//! Events the host itself sends or listens for.
//!
//! The host only transports these. Windowing, input and rendering plugins
//! give the payloads their meaning.

use crate::ids::Uid;
use crate::log::LogLevel;
use crate::{define_event, define_request};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// App lifecycle
// ============================================================================

define_event! {
    /// Sent by the app once launch has completed.
    pub struct AppLaunchedEvent {
        pub app: String,
    }
}

define_event! {
    /// Sent by the app after its layers were detached.
    pub struct AppClosedEvent {
        pub app: String,
        /// `true` when the app is closing to be relaunched
        pub restarting: bool,
    }
}

define_event! {
    /// Asks the running app to close at the end of the current frame.
    pub struct CloseAppRequest {}
}

define_event! {
    /// Asks the running app to restart; the host reloads every plugin.
    pub struct RestartAppRequest {}
}

define_event! {
    /// Sent at the end of every frame.
    pub struct FrameCompleted {
        pub frame: u64,
        pub delta: Duration,
    }
}

// ============================================================================
// Windowing
// ============================================================================

define_request! {
    /// Asks a windowing plugin to open a window. The answer is the new
    /// window's id.
    pub struct OpenNewWindowRequest -> Uid {
        pub title: String,
        pub width: u32,
        pub height: u32,
    }
}

define_event! {
    /// Sent by a windowing plugin when a window was closed by the user.
    pub struct WindowClosedEvent {
        pub window: Uid,
    }
}

// ============================================================================
// Input
// ============================================================================

/// Cursor position in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MousePosition {
    pub x: f32,
    pub y: f32,
}

define_request! {
    /// Asks the input plugin where the cursor is.
    pub struct GetMousePositionRequest -> MousePosition {}
}

define_request! {
    /// Asks the input plugin whether `key` is held down.
    pub struct IsKeyDownRequest -> bool {
        pub key: u32,
    }
}

// ============================================================================
// Plugins and logging
// ============================================================================

define_event! {
    /// Sent after a plugin's `on_load` succeeded.
    pub struct PluginLoadedEvent {
        pub name: String,
        pub version: String,
    }
}

define_event! {
    /// Sent right before a plugin's `on_unload`.
    pub struct PluginUnloadedEvent {
        pub name: String,
    }
}

define_event! {
    /// A host log record, forwarded to logger plugins.
    pub struct LogMessageEvent {
        pub level: LogLevel,
        pub target: String,
        pub message: String,
    }
}
