//! Plugin manifests.
//!
//! Every plugin directory carries a JSON manifest named after the directory:
//!
//! ```text
//! plugins/
//!     Renderer/
//!         Renderer.manifest
//!         libRenderer.so
//! ```
//!
//! ```json
//! {
//!     "name": "Renderer",
//!     "author": "Tbx",
//!     "version": "0.3.0",
//!     "description": "OpenGL renderer",
//!     "lib": "Renderer",
//!     "type": "renderer",
//!     "dependencies": ["Windowing"],
//!     "priority": 50
//! }
//! ```
//!
//! A dependency names either a plugin or a type tag. Depending on a tag
//! means depending on every plugin carrying it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::discovery::same_name;
use crate::error::ManifestError;
use crate::library::library_filename;

/// File extension of manifest files.
pub const MANIFEST_EXTENSION: &str = "manifest";

/// Priority of plugins that do not set one.
pub const DEFAULT_PRIORITY: u32 = 100;

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

/// Metadata describing a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub author: String,
    pub version: String,
    pub description: String,
    /// Library file name, relative to the manifest
    pub lib: String,
    /// Optional type tag, such as `logger` or `renderer`
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Plugin names or type tags that must be loaded first
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Lower loads earlier among plugins whose dependencies are met
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Resolve `lib` against modules linked into the host
    #[serde(default, rename = "static")]
    pub is_static: bool,
    /// Directory the manifest was read from
    #[serde(skip)]
    pub root: PathBuf,
}

impl PluginManifest {
    /// Reads and validates the manifest at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ManifestError::NotFound(path.to_path_buf())
            } else {
                ManifestError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let mut manifest = Self::parse(path, &content)?;
        manifest.root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(manifest)
    }

    /// Parses manifest text. `path` is only used in error messages.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ManifestError> {
        let mut manifest: PluginManifest =
            serde_json::from_str(content).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        manifest.description = manifest.description.trim().to_string();
        manifest.kind = manifest.kind.trim().to_string();
        manifest.validate(path)?;
        Ok(manifest)
    }

    fn validate(&self, path: &Path) -> Result<(), ManifestError> {
        let required = [
            ("name", &self.name),
            ("author", &self.author),
            ("version", &self.version),
            ("description", &self.description),
            ("lib", &self.lib),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ManifestError::MissingField {
                    path: path.to_path_buf(),
                    field,
                });
            }
        }
        Ok(())
    }

    /// Full path of the plugin library, with the platform naming applied
    /// when `lib` has no extension.
    pub fn library_path(&self) -> PathBuf {
        self.root.join(library_filename(&self.lib))
    }

    /// Whether a dependency on `token` is met by this plugin, either by name
    /// or by type tag.
    pub fn provides(&self, token: &str) -> bool {
        same_name(&self.name, token) || (!self.kind.is_empty() && same_name(&self.kind, token))
    }

    /// Whether this plugin depends on `other`.
    pub fn depends_on(&self, other: &PluginManifest) -> bool {
        !same_name(&self.name, &other.name)
            && self.dependencies.iter().any(|dep| other.provides(dep))
    }

    /// Loggers are tagged with a type containing "logger".
    pub fn is_logger_type(&self) -> bool {
        self.kind.to_ascii_lowercase().contains("logger")
    }

    /// Where the manifest of the plugin in `plugin_dir` is expected.
    pub fn path_in(plugin_dir: &Path) -> Option<PathBuf> {
        let name = plugin_dir.file_name()?;
        Some(plugin_dir.join(format!(
            "{}.{}",
            name.to_string_lossy(),
            MANIFEST_EXTENSION
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    const RENDERER: &str = r#"{
        "name": "Renderer",
        "author": "Tbx",
        "version": "0.3.0",
        "description": "  OpenGL renderer\n",
        "lib": "Renderer",
        "dependencies": ["Windowing"],
        "homepage": "ignored"
    }"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = PluginManifest::parse(Path::new("Renderer.manifest"), RENDERER).unwrap();

        assert_eq!(manifest.name, "Renderer");
        assert_eq!(manifest.description, "OpenGL renderer");
        assert_eq!(manifest.dependencies, vec!["Windowing".to_string()]);
        assert_eq!(manifest.priority, DEFAULT_PRIORITY);
        assert!(manifest.kind.is_empty());
        assert!(!manifest.is_static);
    }

    #[test]
    fn test_type_tag() {
        let content = r#"{
            "name": "FileLogger", "author": "Tbx", "version": "1",
            "description": "Logs", "lib": "FileLogger", "type": " Logger "
        }"#;
        let logger = PluginManifest::parse(Path::new("FileLogger.manifest"), content).unwrap();
        assert_eq!(logger.kind, "Logger");
        assert!(logger.is_logger_type());
        assert!(logger.provides("filelogger"));
        assert!(logger.provides("logger"));
        assert!(!logger.provides("renderer"));

        let renderer = PluginManifest::parse(Path::new("Renderer.manifest"), RENDERER).unwrap();
        assert!(!renderer.is_logger_type());
        assert!(!renderer.provides(""));

        let mut sandbox = renderer.clone();
        sandbox.name = "Sandbox".to_string();
        sandbox.dependencies = vec!["LOGGER".to_string()];
        assert!(sandbox.depends_on(&logger));
        assert!(!sandbox.depends_on(&renderer));
    }

    #[test]
    fn test_missing_field_rejected() {
        let content = r#"{ "name": "Input", "author": "Tbx", "version": "1", "description": "x" }"#;
        let error = PluginManifest::parse(Path::new("Input.manifest"), content).unwrap_err();
        assert!(matches!(error, ManifestError::Parse { .. }));
    }

    #[test]
    fn test_empty_field_rejected() {
        let content = r#"{
            "name": "Input", "author": "Tbx", "version": "1",
            "description": "   ", "lib": "Input"
        }"#;
        let error = PluginManifest::parse(Path::new("Input.manifest"), content).unwrap_err();
        assert!(matches!(
            error,
            ManifestError::MissingField { field: "description", .. }
        ));
    }

    #[test]
    fn test_load_sets_root() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(RENDERER.as_bytes()).unwrap();

        let manifest = PluginManifest::load(file.path()).unwrap();
        assert_eq!(manifest.root, file.path().parent().unwrap());
        assert_eq!(
            manifest.library_path(),
            manifest.root.join(library_filename("Renderer"))
        );
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let error = PluginManifest::load(dir.path().join("Nothing.manifest")).unwrap_err();
        assert!(matches!(error, ManifestError::NotFound(_)));
    }

    #[test]
    fn test_manifest_path_follows_directory_name() {
        let path = PluginManifest::path_in(Path::new("plugins/Windowing")).unwrap();
        assert_eq!(path, Path::new("plugins/Windowing/Windowing.manifest"));
    }
}
