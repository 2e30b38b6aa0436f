//! Stream configuration shared by the receiver and the decoder.
//!
//! A [`Config`] is built once at startup, either programmatically through
//! [`Config::new`] and the `with_*` setters or from a TOML file, and is then
//! shared read-only (usually behind an `Arc`).

use crate::bitplane;
use crate::types::{BitOrder, Resolution};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_TIMESTAMP_INTERVAL: u64 = 1000;

/// Largest accepted per-frame header, in bytes.
pub const MAX_HEADER_SIZE: usize = 16 * 1024 * 1024;

/// Environment variable naming a config file when none is given explicitly.
pub const CONFIG_ENV: &str = "EVSTREAM_CONFIG";

/// Errors produced while loading or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid geometry {width}x{height}: {reason}")]
    InvalidGeometry {
        width: u32,
        height: u32,
        reason: &'static str,
    },

    #[error("invalid network setting: {0}")]
    InvalidNetwork(String),
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    camera: Option<CameraSection>,
    network: Option<NetworkSection>,
    timing: Option<TimingSection>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraSection {
    width: Option<u32>,
    height: Option<u32>,
    bit_order: Option<BitOrder>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct NetworkSection {
    host: Option<String>,
    port: Option<u16>,
    header_size: Option<usize>,
    connect_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    tcp_nodelay: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TimingSection {
    timestamp_interval: Option<u64>,
    timestamp_offset: Option<u64>,
}

/// Immutable stream configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Sensor width in pixels
    pub width: u32,
    /// Sensor height in pixels
    pub height: u32,
    /// Camera server host name or address
    pub host: String,
    /// Camera server TCP port
    pub port: u16,
    /// Bytes preceding every frame payload on the wire (0 = no header)
    pub header_size: usize,
    /// Timestamp units added per frame-number increment
    pub timestamp_interval: u64,
    /// Timestamp of frame number 0
    pub timestamp_offset: u64,
    /// Pixel order within each byte of a bit-plane row
    pub bit_order: BitOrder,
    /// Upper bound on each connection attempt
    pub connect_timeout: Option<Duration>,
    /// Upper bound on a single blocking read
    pub read_timeout: Option<Duration>,
    /// Disable Nagle's algorithm on the connection
    pub tcp_nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            header_size: 0,
            timestamp_interval: DEFAULT_TIMESTAMP_INTERVAL,
            timestamp_offset: 0,
            bit_order: BitOrder::MsbFirst,
            connect_timeout: None,
            read_timeout: None,
            tcp_nodelay: true,
        }
    }
}

impl Config {
    /// Creates a validated config for the given geometry with default
    /// network and timing settings.
    pub fn new(width: u32, height: u32) -> Result<Self, ConfigError> {
        let cfg = Self {
            width,
            height,
            ..Self::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_header_size(mut self, header_size: usize) -> Self {
        self.header_size = header_size;
        self
    }

    pub fn with_timestamp_interval(mut self, interval: u64) -> Self {
        self.timestamp_interval = interval;
        self
    }

    pub fn with_timestamp_offset(mut self, offset: u64) -> Self {
        self.timestamp_offset = offset;
        self
    }

    pub fn with_bit_order(mut self, order: BitOrder) -> Self {
        self.bit_order = order;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Loads the config file named by `path`, or by [`CONFIG_ENV`] when
    /// `path` is `None`. Falls back to defaults when neither is set.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let file = match path.or(env_path.as_deref()) {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };
        let cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        let cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Self {
        let defaults = Self::default();
        let camera = file.camera.unwrap_or_default();
        let network = file.network.unwrap_or_default();
        let timing = file.timing.unwrap_or_default();
        Self {
            width: camera.width.unwrap_or(defaults.width),
            height: camera.height.unwrap_or(defaults.height),
            bit_order: camera.bit_order.unwrap_or(defaults.bit_order),
            host: network.host.unwrap_or(defaults.host),
            port: network.port.unwrap_or(defaults.port),
            header_size: network.header_size.unwrap_or(defaults.header_size),
            connect_timeout: network.connect_timeout_ms.map(Duration::from_millis),
            read_timeout: network.read_timeout_ms.map(Duration::from_millis),
            tcp_nodelay: network.tcp_nodelay.unwrap_or(defaults.tcp_nodelay),
            timestamp_interval: timing
                .timestamp_interval
                .unwrap_or(defaults.timestamp_interval),
            timestamp_offset: timing.timestamp_offset.unwrap_or(defaults.timestamp_offset),
        }
    }

    /// Checks the invariants every consumer relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let geometry = |reason| ConfigError::InvalidGeometry {
            width: self.width,
            height: self.height,
            reason,
        };
        if self.width == 0 || self.height == 0 {
            return Err(geometry("width and height must be positive"));
        }
        // Event coordinates are u16.
        if self.width > u16::MAX as u32 + 1 || self.height > u16::MAX as u32 + 1 {
            return Err(geometry("width and height must not exceed 65536"));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidNetwork("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidNetwork("port must not be 0".into()));
        }
        if self.header_size > MAX_HEADER_SIZE {
            return Err(ConfigError::InvalidNetwork(format!(
                "header_size {} exceeds {} bytes",
                self.header_size, MAX_HEADER_SIZE
            )));
        }
        if matches!(self.read_timeout, Some(t) if t.is_zero())
            || matches!(self.connect_timeout, Some(t) if t.is_zero())
        {
            return Err(ConfigError::InvalidNetwork(
                "timeouts must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Payload bytes per frame, excluding the header.
    pub fn frame_size(&self) -> usize {
        bitplane::frame_size(self.width, self.height)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// `host:port` as used for name resolution.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
