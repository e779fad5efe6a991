//! Configuration module
//!
//! Handles loading and saving chanmux configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::MAX_FRAME_SIZE;
use crate::protocol::DEFAULT_PORT;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Demo channel settings
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name announced in the handshake
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Largest accepted frame body
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Consecutive undecodable packets before a connection is closed (0 = never)
    #[serde(default = "default_max_protocol_errors")]
    pub max_protocol_errors: u32,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_max_protocol_errors() -> u32 {
    16
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            connect_timeout_ms: default_connect_timeout(),
            max_frame_size: default_max_frame_size(),
            max_protocol_errors: default_max_protocol_errors(),
        }
    }
}

impl NetworkConfig {
    /// Runtime settings for the TCP link, with `port` overriding the file
    pub fn to_runtime(&self, port: u16) -> crate::network::NetworkConfig {
        let mut runtime = crate::network::NetworkConfig::new(port);
        if let Some(bind_address) = &self.bind_address {
            runtime.bind_address = bind_address.clone();
        }
        runtime.connect_timeout_ms = self.connect_timeout_ms;
        runtime.max_frame_size = self.max_frame_size;
        runtime.max_protocol_errors = self.max_protocol_errors;
        runtime
    }
}

/// Demo channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name used by `server` and `client`
    #[serde(default = "default_channel_name")]
    pub name: String,
    /// How often the owner thread drains its task queue (ms)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

fn default_channel_name() -> String {
    "bounce".to_string()
}

fn default_tick_interval() -> u64 {
    50
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: default_channel_name(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths: Vec<PathBuf> = [
            dirs::config_dir().map(|p| p.join("chanmux/config.toml")),
            Some(PathBuf::from("./chanmux.toml")),
            Some(PathBuf::from("./config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self::load_first(&config_paths)
    }

    /// Load the first existing file of `paths`, or the defaults if none exists.
    ///
    /// A file that exists but does not parse is an error, not a fallback.
    pub fn load_first(paths: &[PathBuf]) -> ConfigResult<Self> {
        match paths.iter().find(|path| path.exists()) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "bounce-host".to_string(),
            verbose: false,
        },
        network: NetworkConfig {
            bind_address: Some("0.0.0.0".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.channel.name, "bounce");
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.channel.tick_interval_ms = 10;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, config.network.port);
        assert_eq!(loaded.channel.tick_interval_ms, 10);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nport = 9000\nmax_protocol_errors = 0").unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, 9000);
        assert_eq!(loaded.network.connect_timeout_ms, 5000);
        assert_eq!(loaded.channel.name, "bounce");

        let runtime = loaded.network.to_runtime(9100);
        assert_eq!(runtime.port, 9100);
        assert_eq!(runtime.bind_address, "0.0.0.0");
        assert_eq!(runtime.max_protocol_errors, 0);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(&dir.path().join("absent.toml")),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_search_path_reports_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.toml");
        let broken = dir.path().join("chanmux.toml");
        std::fs::write(&broken, "[network\nport = ").unwrap();

        assert!(matches!(
            Config::load_first(&[absent.clone(), broken]),
            Err(ConfigError::Parse(_))
        ));

        let config = Config::load_first(&[absent]).unwrap();
        assert_eq!(config.network.port, DEFAULT_PORT);
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "bounce-host");
        assert_eq!(parsed.network.bind_address.as_deref(), Some("0.0.0.0"));
    }
}
