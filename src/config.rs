//! Runtime configuration, loaded the way the teacher's `Config` loads
//! `config.toml` (`toml::from_str` over a file read), but with defaults so a
//! missing file is not fatal — this server has no WLED-style "nothing works
//! without it" dependency.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::RelayError;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Address the combined HTTP/signaling listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Port for the combined HTTP status + signaling upgrade listener.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Kept for parity with the teacher's config shape; this relay's
    /// performance lane is a WebRTC data channel, not RTP-MIDI, so this
    /// field is currently unused (see DESIGN.md).
    pub midi_port: Option<u16>,
    /// Log level override, passed through to `env_logger`'s default filter
    /// when `RUST_LOG` is unset.
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            midi_port: None,
            log_level: None,
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let path_ref = path.as_ref();
        let content = fs::read_to_string(path_ref).map_err(|source| RelayError::ConfigLoad {
            path: path_ref.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `midi-relay.toml` from the working directory if present,
    /// otherwise fall back to defaults.
    pub fn load_default_or_fallback() -> Self {
        match Self::load_from_file("midi-relay.toml") {
            Ok(cfg) => cfg,
            Err(_) => Self::default(),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Reads the `JCMP_DEBUG` environment variable per-event debug logging
/// switch (`spec.md` §6). Not a TOML field — it is read fresh at startup.
pub fn debug_enabled() -> bool {
    std::env::var("JCMP_DEBUG")
        .map(|v| v == "1")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_valid_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "bind_addr = \"127.0.0.1\"\nport = 6000\nlog_level = \"debug\"").unwrap();
        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.port, 6000);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_load_missing_fields_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "").unwrap();
        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0");
        assert_eq!(config.port, 5000);
    }

    #[test]
    fn test_load_invalid_file() {
        let res = Config::load_from_file("/nonexistent/path/to/midi-relay.toml");
        assert!(res.is_err());
    }

    #[test]
    fn test_bind_address() {
        let config = Config {
            bind_addr: "127.0.0.1".to_string(),
            port: 5000,
            midi_port: None,
            log_level: None,
        };
        assert_eq!(config.bind_address(), "127.0.0.1:5000");
    }
}
