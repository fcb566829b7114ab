//! Error types for loading and managing plugins.
//!
//! The variants of [`ServerError`] follow the lifecycle stage they come
//! from. None of them abort initialization; the server logs them and moves
//! on to the next plugin.

use std::path::PathBuf;
use tbx_core::PluginError;

/// Errors from the shared library loader.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The operating system refused to load the library
    #[error("Failed to open library {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },
}

/// Errors reading or validating a plugin manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Failed to read manifest {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid manifest {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Manifest {} has an empty '{field}' field", path.display())]
    MissingField { path: PathBuf, field: &'static str },
}

/// Errors raised by the plugin server, one variant per lifecycle stage.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A manifest was missing or invalid, or its dependencies cannot be met
    #[error("Plugin discovery error: {0}")]
    Discovery(String),
    /// Opening the library or resolving its entry points failed
    #[error("Plugin load error for {plugin}: {reason}")]
    Load { plugin: String, reason: String },
    /// The plugin's `on_load` failed
    #[error("Plugin initialization error for {plugin}: {source}")]
    Initialization {
        plugin: String,
        #[source]
        source: PluginError,
    },
    /// The plugin's `on_unload` failed
    #[error("Plugin teardown error for {plugin}: {source}")]
    Teardown {
        plugin: String,
        #[source]
        source: PluginError,
    },
    #[error("Plugin server already holds plugins from {}", .0.display())]
    AlreadyInitialized(PathBuf),
    #[error("Failed to read plugin directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<ManifestError> for ServerError {
    fn from(error: ManifestError) -> Self {
        ServerError::Discovery(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_plugin() {
        let error = ServerError::Initialization {
            plugin: "Renderer".to_string(),
            source: PluginError::InitializationFailed("no GPU".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "Plugin initialization error for Renderer: Plugin initialization failed: no GPU"
        );

        let error: ServerError = ManifestError::MissingField {
            path: PathBuf::from("plugins/Input/Input.manifest"),
            field: "lib",
        }
        .into();
        assert!(matches!(error, ServerError::Discovery(_)));
        assert!(error.to_string().contains("'lib'"));
    }
}
