//! Errors of the app runtime and the host driver.

use tbx_core::PluginError;
use tbx_plugin_system::ServerError;

/// Fatal app errors. Any of these moves the app to `AppStatus::Error`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("App was already launched")]
    AlreadyLaunched,
    #[error("App failed to launch: {0}")]
    Launch(#[source] PluginError),
    #[error("Layer {layer} failed in frame {frame}: {source}")]
    Layer {
        layer: String,
        frame: u64,
        #[source]
        source: PluginError,
    },
    #[error("App update failed in frame {frame}: {source}")]
    Update {
        frame: u64,
        #[source]
        source: PluginError,
    },
}

/// Errors that stop the host driver.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("No app plugin was loaded")]
    NoApp,
    #[error("Expected exactly one app plugin, found {}: {}", .0.len(), .0.join(", "))]
    MultipleApps(Vec<String>),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("App restarted more than {0} times")]
    TooManyRestarts(u32),
}
