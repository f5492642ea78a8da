//! Configuration parsing and validation for fleetgated
//!
//! Supports TOML configuration with:
//! - Versioned schema
//! - Listen address and data directory
//! - The single-open-session hardening flag (off by default for
//!   parity with the legacy deployment)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid listen address {0:?}: {1}")]
    InvalidListenAddr(String, std::net::AddrParseError),

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Current supported config version
pub const CURRENT_CONFIG_VERSION: u32 = 1;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_DATA_DIR: &str = "/var/lib/fleetgate";
const DEFAULT_DB_FILE: &str = "fleetgate.db";

/// Raw TOML shape; every field is optional and falls back to a default.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_version")]
    config_version: u32,
    listen_addr: Option<String>,
    data_dir: Option<PathBuf>,
    db_file: Option<String>,
    #[serde(default)]
    enforce_single_open_session_per_machine: bool,
}

fn default_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

/// Validated service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub db_file: String,

    /// When set, starting a session on a machine that already has an
    /// open session fails with a conflict. Off by default to preserve
    /// the legacy overlapping-session behavior.
    pub enforce_single_open_session_per_machine: bool,
}

impl ServiceConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.parse().unwrap(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            db_file: DEFAULT_DB_FILE.to_string(),
            enforce_single_open_session_per_machine: false,
        }
    }
}

/// Load and validate configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<ServiceConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    debug!(
        path = %path.display(),
        listen_addr = %config.listen_addr,
        "Configuration loaded"
    );
    Ok(config)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> ConfigResult<ServiceConfig> {
    let raw: RawConfig = toml::from_str(content)?;

    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    let defaults = ServiceConfig::default();
    let listen_addr = match raw.listen_addr {
        Some(s) => s
            .parse()
            .map_err(|e| ConfigError::InvalidListenAddr(s, e))?,
        None => defaults.listen_addr,
    };

    Ok(ServiceConfig {
        listen_addr,
        data_dir: raw.data_dir.unwrap_or(defaults.data_dir),
        db_file: raw.db_file.unwrap_or(defaults.db_file),
        enforce_single_open_session_per_machine: raw.enforce_single_open_session_per_machine,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config = parse_config("config_version = 1").unwrap();
        assert_eq!(config.listen_addr.port(), 5000);
        assert!(!config.enforce_single_open_session_per_machine);
    }

    #[test]
    fn parse_full_config() {
        let config = parse_config(
            r#"
            config_version = 1
            listen_addr = "0.0.0.0:8080"
            data_dir = "/tmp/fleetgate"
            db_file = "test.db"
            enforce_single_open_session_per_machine = true
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/fleetgate/test.db"));
        assert!(config.enforce_single_open_session_per_machine);
    }

    #[test]
    fn reject_wrong_version() {
        let result = parse_config("config_version = 99");
        assert!(matches!(result, Err(ConfigError::UnsupportedVersion(99))));
    }

    #[test]
    fn reject_bad_listen_addr() {
        let result = parse_config(
            r#"
            config_version = 1
            listen_addr = "not-an-addr"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidListenAddr(..))));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "config_version = 1\n").unwrap();
        assert!(load_config(&path).is_ok());
    }
}
