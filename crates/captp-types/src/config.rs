//! Connection configuration, loadable from TOML with defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Maximum single message size accepted by framed transports (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Settings for one CapTP connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapTpConfig {
    /// Our name for this side of the connection (used in logs and close reasons).
    pub our_id: String,
    /// Tag attached to every message. Messages carrying another epoch belong
    /// to a defunct earlier connection and are ignored.
    pub epoch: u64,
    /// Send DROP notices when imported references become unreachable.
    /// When false, imports live until the connection closes.
    pub gc_imports: bool,
    /// Largest frame a framed transport will read.
    pub max_message_size: u32,
}

impl Default for CapTpConfig {
    fn default() -> Self {
        Self {
            our_id: uuid::Uuid::new_v4().to_string(),
            epoch: 0,
            gc_imports: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl CapTpConfig {
    /// Config with a fixed `our_id` and defaults elsewhere.
    pub fn named(our_id: impl Into<String>) -> Self {
        Self {
            our_id: our_id.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Load from a TOML file, falling back to defaults if the file is
    /// missing or unreadable.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!(path = %path.display(), "CapTP config not found, using defaults");
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "Loaded CapTP configuration");
                    config
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to parse CapTP config, using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read CapTP config, using defaults"
                );
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CapTpConfig::default();
        assert!(!config.our_id.is_empty());
        assert_eq!(config.epoch, 0);
        assert!(config.gc_imports);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CapTpConfig::from_toml_str("our_id = \"alice\"\nepoch = 3\n").unwrap();
        assert_eq!(config.our_id, "alice");
        assert_eq!(config.epoch, 3);
        assert!(config.gc_imports);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "our_id = \"bob\"").unwrap();
        writeln!(file, "gc_imports = false").unwrap();
        writeln!(file, "max_message_size = 1024").unwrap();

        let config = CapTpConfig::load(file.path());
        assert_eq!(config.our_id, "bob");
        assert!(!config.gc_imports);
        assert_eq!(config.max_message_size, 1024);
    }

    #[test]
    fn test_load_invalid_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "epoch = \"not a number\"").unwrap();
        let config = CapTpConfig::load(file.path());
        assert_eq!(config.epoch, 0);

        let missing = CapTpConfig::load(Path::new("/nonexistent/captp.toml"));
        assert!(missing.gc_imports);
    }
}
