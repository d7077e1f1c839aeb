//! Application configuration.
//!
//! Settings may be given in a TOML file. Every key is optional; a missing file means defaults.

use std::path::{Path, PathBuf};

use fuse_dispatch::session::SessionConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Application configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// How the file system is mounted and scheduled.
    pub session: SessionConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Failed to parse {}: {source}", path.display())]
    DeserializationError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to read {}: {source}", path.display())]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns every validation error message, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        self.session
            .validate()
            .map_err(|errors| errors.into_iter().map(|e| format!("session: {e}")).collect())
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("fuse-dispatch").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            let path = home.join(".config").join("fuse-dispatch").join("config.toml");
            if !paths.contains(&path) {
                paths.push(path);
            }
        }

        paths.push(PathBuf::from("/etc/fuse-dispatch/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::DeserializationError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads configuration from the external path if given, else the first config file found.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads and validates the configuration, falling back to defaults when no file exists.
    /// Errors if a config file exists but is malformed or invalid.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(res) = Self::load(external_config_path) else {
            debug!("No configuration file found, using defaults.");
            return Ok(Self::default());
        };
        let config = res?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        debug!("Loaded configuration successfully.");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn session_table_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nworkers = 2\nfsname = \"demo\"\n").unwrap();

        let config = Config::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.session.workers, Some(2));
        assert_eq!(config.session.fsname, "demo");
    }

    #[test]
    fn invalid_values_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nworkers = 0\n").unwrap();

        match Config::load_or_default(Some(&path)) {
            Err(ConfigError::ValidationErrors(errors)) => {
                assert_eq!(errors, vec!["session: workers must be at least 1.".to_owned()]);
            }
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_or_default(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::IoError { .. }));
    }
}
