use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::announcer::AnnounceSettings;
use crate::interfaces::ALL_INTERFACES;
use crate::protocol::{DEFAULT_MULTICAST_ADDR, FALLBACK_PORT, MAX_DATAGRAM_SIZE};
use crate::receiver::ReceiveSettings;

/// Largest UDP payload IPv4 can carry.
const MAX_UDP_PAYLOAD: usize = 65_507;
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Env {
        key: String,
        value: String,
        reason: String,
    },
    #[error("{0} is not an IPv4 multicast address")]
    NotMulticast(Ipv4Addr),
    #[error("invalid port 0 for {0}")]
    ZeroPort(&'static str),
    #[error("max datagram size must be between 1 and 65507, got {0}")]
    DatagramSize(usize),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("invalid log level: {0}")]
    LogLevel(String),
}

/// Main configuration, read from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Group announcements are sent to and received from
    pub multicast_addr: SocketAddrV4,

    /// TCP port of the fallback server
    pub fallback_port: u16,

    /// Interfaces to announce on; empty or "all" means every interface
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Announcements larger than this go through the fallback server
    pub max_datagram_size: usize,

    /// Upper bound on a response read from a fallback server
    pub max_fetch_size: usize,

    #[serde(with = "crate::duration_serde")]
    pub announce_interval: Duration,

    #[serde(with = "crate::duration_serde")]
    pub fetch_timeout: Duration,

    /// How long `send` and `receive` run before giving up
    #[serde(with = "crate::duration_serde")]
    pub run_timeout: Duration,

    /// Serve the current clipboard over fallback rather than the first oversized one
    pub fallback_refresh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            multicast_addr: DEFAULT_MULTICAST_ADDR,
            fallback_port: FALLBACK_PORT,
            interfaces: vec![ALL_INTERFACES.to_string()],
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_datagram_size: MAX_DATAGRAM_SIZE,
            max_fetch_size: 64 * 1024 * 1024,
            announce_interval: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(10),
            run_timeout: Duration::from_secs(60),
            fallback_refresh: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lanclip")
            .join("config.toml")
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `path`, or the default location when it exists, then apply
    /// `LANCLIP_*` environment overrides and validate.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => {
                let default = Self::default_config_path();
                if default.exists() {
                    Self::load(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("LANCLIP_MULTICAST_ADDR") {
            self.network.multicast_addr = parse_env("LANCLIP_MULTICAST_ADDR", value)?;
        }
        if let Some(value) = lookup("LANCLIP_FALLBACK_PORT") {
            self.network.fallback_port = parse_env("LANCLIP_FALLBACK_PORT", value)?;
        }
        if let Some(value) = lookup("LANCLIP_INTERFACES") {
            self.network.interfaces = value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(value) = lookup("LANCLIP_TIMEOUT") {
            self.transfer.run_timeout =
                crate::duration_serde::parse(&value).map_err(|reason| ConfigError::Env {
                    key: "LANCLIP_TIMEOUT".to_string(),
                    value,
                    reason,
                })?;
        }
        if let Some(value) = lookup("LANCLIP_LOG_LEVEL") {
            self.logging.level = value;
        }
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let group = self.network.multicast_addr;
        if !group.ip().is_multicast() {
            return Err(ConfigError::NotMulticast(*group.ip()));
        }
        if group.port() == 0 {
            return Err(ConfigError::ZeroPort("multicast_addr"));
        }
        if self.network.fallback_port == 0 {
            return Err(ConfigError::ZeroPort("fallback_port"));
        }

        let size = self.transfer.max_datagram_size;
        if size == 0 || size > MAX_UDP_PAYLOAD {
            return Err(ConfigError::DatagramSize(size));
        }
        if self.transfer.announce_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("announce_interval"));
        }
        if self.transfer.fetch_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("fetch_timeout"));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::LogLevel(self.logging.level.clone()));
        }
        Ok(())
    }

    pub fn announce_settings(&self) -> AnnounceSettings {
        AnnounceSettings {
            max_datagram_size: self.transfer.max_datagram_size,
            interval: self.transfer.announce_interval,
            fallback_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.network.fallback_port)),
            refresh_fallback: self.transfer.fallback_refresh,
        }
    }

    pub fn receive_settings(&self) -> ReceiveSettings {
        ReceiveSettings {
            group: self.network.multicast_addr,
            fallback_port: self.network.fallback_port,
            max_datagram_size: self.transfer.max_datagram_size,
            max_fetch_size: self.transfer.max_fetch_size,
            fetch_timeout: self.transfer.fetch_timeout,
        }
    }
}

fn parse_env<T>(key: &str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Env {
        key: key.to_string(),
        reason: e.to_string(),
        value,
    })
}
