//! Session configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! event_capacity = 1024
//! bin_limit = 64
//! autosave_interval_secs = 30
//! file = "notebooks/analysis.json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{DEFAULT_BIN_LIMIT, DEFAULT_EVENT_CAPACITY, MIN_AUTOSAVE_INTERVAL_SECS};

/// Errors loading a [`SessionConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-session settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Capacity of the session broadcast channel.
    pub event_capacity: usize,
    /// Deleted entries kept for restore.
    pub bin_limit: usize,
    /// Save periodically when set and `file` is known.
    pub autosave_interval_secs: Option<u64>,
    /// Where `save` writes the exported notebook.
    pub file: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            bin_limit: DEFAULT_BIN_LIMIT,
            autosave_interval_secs: None,
            file: None,
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Autosave period, if enabled.
    pub fn autosave_interval(&self) -> Option<Duration> {
        self.autosave_interval_secs
            .map(|secs| Duration::from_secs(secs.max(MIN_AUTOSAVE_INTERVAL_SECS)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive".into()));
        }
        if self.autosave_interval_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "autosave_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SessionConfig::from_toml_str("").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert!(config.autosave_interval().is_none());
    }

    #[test]
    fn test_parse_all_fields() {
        let config = SessionConfig::from_toml_str(
            r#"
            event_capacity = 16
            bin_limit = 2
            autosave_interval_secs = 30
            file = "out/nb.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.event_capacity, 16);
        assert_eq!(config.bin_limit, 2);
        assert_eq!(config.autosave_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.file, Some(PathBuf::from("out/nb.json")));
    }

    #[test]
    fn test_rejects_unknown_and_invalid_fields() {
        assert!(matches!(
            SessionConfig::from_toml_str("bogus = 1"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            SessionConfig::from_toml_str("event_capacity = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(&path, "bin_limit = 5\n").unwrap();

        assert_eq!(SessionConfig::load(&path).unwrap().bin_limit, 5);
        assert!(matches!(
            SessionConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_toml_round_trip_keeps_values() {
        let config = SessionConfig::default().with_file("a.json");
        let text = config.to_toml_string().unwrap();
        assert_eq!(SessionConfig::from_toml_str(&text).unwrap(), config);
    }
}
