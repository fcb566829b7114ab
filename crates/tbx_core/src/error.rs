//! Error types shared by the host and plugins.

use std::any::Any;

/// Errors raised while dispatching events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// A subscriber panicked while handling an event
    #[error("Handler for {event} panicked: {message}")]
    HandlerPanicked { event: &'static str, message: String },
    /// A posted event was dropped before the bus processed it
    #[error("Posted event was discarded before dispatch")]
    Discarded,
}

/// Errors that can occur during plugin operations.
///
/// Plugins return these from their lifecycle hooks; the host converts them
/// into log records and status transitions.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Plugin initialization failed during `on_load`
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),
    /// Error occurred during plugin execution
    #[error("Plugin execution error: {0}")]
    ExecutionError(String),
    /// Requested plugin or resource was not found
    #[error("Plugin not found: {0}")]
    NotFound(String),
    /// Panic or other unexpected runtime condition
    #[error("Plugin runtime error: {0}")]
    Runtime(String),
}

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl PluginError {
    /// Converts a caught panic into a `PluginError::Runtime`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        PluginError::Runtime(format!("panicked: {}", panic_message(payload.as_ref())))
    }
}
