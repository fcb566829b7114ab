//! Launcher configuration, read from a TOML file.
//!
//! A missing file is not an error: the defaults are written to the given
//! path and used.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tbx_runtime::HostConfig;
use thiserror::Error;
use tracing::info;

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize default config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Launcher configuration loaded from `tbx.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub plugins: PluginSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// How the host runs the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSettings {
    /// Directory holding one subdirectory per plugin
    #[serde(default = "default_plugin_directory")]
    pub plugin_directory: String,
    /// Minimum frame duration in milliseconds (0 runs unpaced)
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,
    /// Restarts allowed before the host gives up (0 is unlimited)
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

fn default_plugin_directory() -> String {
    "plugins".to_string()
}

fn default_frame_interval() -> u64 {
    16 // about 60 frames per second
}

fn default_max_restarts() -> u32 {
    8
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            plugin_directory: default_plugin_directory(),
            frame_interval_ms: default_frame_interval(),
            max_restarts: default_max_restarts(),
        }
    }
}

/// Which plugins get loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PluginSettings {
    /// Plugin whitelist; empty loads every discovered plugin
    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
    /// Whether host log records are also sent to logger plugins
    #[serde(default = "default_forward")]
    pub forward_to_plugins: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_forward() -> bool {
    true
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            json_format: false,
            forward_to_plugins: default_forward(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration to `path`
    /// and returns it.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    pub async fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if tokio::fs::try_exists(path).await.map_err(io_error)? {
            let content = tokio::fs::read_to_string(path).await.map_err(io_error)?;
            Self::parse(path, &content)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await.map_err(io_error)?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Parses configuration text; `path` is only used in error messages.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks the values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.plugin_directory.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "Plugin directory cannot be empty".to_string(),
            ));
        }

        if !VALID_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, VALID_LEVELS
            )));
        }

        if self.plugins.whitelist.iter().any(|name| name.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "Plugin whitelist contains an empty name".to_string(),
            ));
        }

        Ok(())
    }

    /// Converts the file settings into what the host driver takes.
    pub fn to_host_config(&self) -> HostConfig {
        let mut config = HostConfig::new(PathBuf::from(&self.host.plugin_directory));
        config.whitelist = self.plugins.whitelist.clone();
        config.frame_interval = match self.host.frame_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        config.max_restarts = self.host.max_restarts;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();

        assert_eq!(config.host.plugin_directory, "plugins");
        assert_eq!(config.host.frame_interval_ms, 16);
        assert_eq!(config.host.max_restarts, 8);
        assert!(config.plugins.whitelist.is_empty());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
        assert!(config.logging.forward_to_plugins);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tbx.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        // The written file reads back to the same values
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let toml_content = r#"
[host]
plugin_directory = "build/plugins"
frame_interval_ms = 0
max_restarts = 2

[plugins]
whitelist = ["Sandbox"]

[logging]
level = "debug"
json_format = true
forward_to_plugins = false
"#;

        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), toml_content).await.unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(config.host.plugin_directory, "build/plugins");
        assert_eq!(config.host.frame_interval_ms, 0);
        assert_eq!(config.host.max_restarts, 2);
        assert_eq!(config.plugins.whitelist, vec!["Sandbox".to_string()]);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert!(!config.logging.forward_to_plugins);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = AppConfig::parse(Path::new("partial.toml"), "[logging]\nlevel = \"warn\"\n").unwrap();
        assert_eq!(config.logging.level, "warn");
        assert!(config.logging.forward_to_plugins);
        assert_eq!(config.host, HostSettings::default());
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = AppConfig::parse(Path::new("broken.toml"), "[host\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_validate() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.logging.level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.host.plugin_directory = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.plugins.whitelist = vec!["Sandbox".to_string(), String::new()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_host_config() {
        let mut config = AppConfig::default();
        config.plugins.whitelist = vec!["Logger".to_string()];

        let host = config.to_host_config();
        assert_eq!(host.plugin_directory, PathBuf::from("plugins"));
        assert_eq!(host.whitelist, vec!["Logger".to_string()]);
        assert_eq!(host.frame_interval, Some(Duration::from_millis(16)));
        assert_eq!(host.max_restarts, 8);

        config.host.frame_interval_ms = 0;
        assert_eq!(config.to_host_config().frame_interval, None);
    }
}
