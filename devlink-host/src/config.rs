//! Load config from file and environment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use devlink_core::{DeviceId, DeviceRecord, PeerAddress};

use crate::connection::DEFAULT_MAX_FRAME_LEN;

/// Host configuration. File: $DEVLINK_CONFIG, else ~/.config/devlink/config.toml,
/// else /etc/devlink/config.toml.
/// Env overrides: DEVLINK_LISTEN_ADDR, DEVLINK_READ_BUFFER, DEVLINK_MAX_FRAME, DEVLINK_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Stream listen address (default 0.0.0.0:47800).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Bytes requested per read (default 4096).
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Frame delimiter (default "|").
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Longest unterminated frame a peer may send before it is disconnected (default 64 KiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// tracing filter directive (default "info"). RUST_LOG wins when set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Devices known before any connection exists.
    #[serde(default)]
    pub devices: Vec<DeclaredDevice>,
}

/// A pre-declared device. Both fields are optional; discovery fills in what is missing.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeclaredDevice {
    pub id: Option<u32>,
    pub address: Option<String>,
    pub name: Option<String>,
}

impl DeclaredDevice {
    pub fn to_record(&self) -> DeviceRecord {
        let record = DeviceRecord::declared(
            self.id.map(DeviceId),
            self.address.as_deref().map(PeerAddress::from),
        );
        match &self.name {
            Some(name) => record.with_name(name.clone()),
            None => record,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 47800))
}
fn default_read_buffer_size() -> usize {
    4096
}
fn default_delimiter() -> String {
    devlink_core::DEFAULT_DELIMITER.to_owned()
}
fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}
fn default_log_filter() -> String {
    "info".to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            read_buffer_size: default_read_buffer_size(),
            delimiter: default_delimiter(),
            max_frame_len: default_max_frame_len(),
            log_filter: default_log_filter(),
            devices: Vec::new(),
        }
    }
}

/// Error loading or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Apply env overrides through `lookup` (std::env::var in production).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(s) = lookup("DEVLINK_LISTEN_ADDR") {
            self.listen_addr = s.parse().map_err(|_| ConfigError::Env {
                var: "DEVLINK_LISTEN_ADDR",
                value: s.clone(),
            })?;
        }
        if let Some(s) = lookup("DEVLINK_READ_BUFFER") {
            self.read_buffer_size = s.parse().map_err(|_| ConfigError::Env {
                var: "DEVLINK_READ_BUFFER",
                value: s.clone(),
            })?;
        }
        if let Some(s) = lookup("DEVLINK_MAX_FRAME") {
            self.max_frame_len = s.parse().map_err(|_| ConfigError::Env {
                var: "DEVLINK_MAX_FRAME",
                value: s.clone(),
            })?;
        }
        if let Some(s) = lookup("DEVLINK_LOG") {
            self.log_filter = s;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be positive"));
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::Invalid("max_frame_len must be positive"));
        }
        if self.delimiter.is_empty() {
            return Err(ConfigError::Invalid("delimiter must not be empty"));
        }
        Ok(())
    }

    pub fn declared_records(&self) -> Vec<DeviceRecord> {
        self.devices.iter().map(DeclaredDevice::to_record).collect()
    }
}

/// Load config: defaults, then config file (if present), then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_path() {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    c.apply_env(|var| std::env::var(var).ok())?;
    c.validate()?;
    Ok(c)
}

fn config_path() -> Option<PathBuf> {
    if let Some(p) = std::env::var_os("DEVLINK_CONFIG") {
        return Some(PathBuf::from(p));
    }
    let mut candidates = Vec::new();
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        candidates.push(h.join(".config/devlink/config.toml"));
    }
    candidates.push(PathBuf::from("/etc/devlink/config.toml"));
    candidates.into_iter().find(|p| p.exists())
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    Config::from_toml(&s).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}
