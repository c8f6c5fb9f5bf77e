use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::reassembly::AssemblerConfig;
use crate::traffic::LengthPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("tracking.flush_after must be greater than zero")]
    ZeroFlushAfter,

    #[error("tracking.cleanup_interval must be greater than zero")]
    ZeroCleanupInterval,

    #[error("capture.snaplen must be positive, got {0}")]
    InvalidSnaplen(i32),

    #[error("capture.timeout_ms must be positive, got {0}")]
    InvalidTimeout(i32),

    #[error("dns.cache_size must be greater than zero when dns.resolve is on")]
    ZeroDnsCache,

    #[error("dns.cache_ttl must be greater than zero when dns.resolve is on")]
    ZeroDnsTtl,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub tracking: TrackingConfig,
    pub dns: DnsConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interface: Option<String>,
    pub snaplen: i32,
    pub promiscuous: bool,
    pub timeout_ms: i32,
    /// BPF expression, applied as-is.
    pub filter: Option<String>,
    /// Packets to process before stopping, negative for no limit.
    pub packet_count: i64,
    pub ip4: bool,
    pub ip6: bool,
}

/// Processing mode of the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Direction-normalized flow counters.
    #[default]
    Flows,
    /// TCP stream reassembly and per-stream statistics.
    Streams,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub mode: Mode,
    #[serde(with = "humantime_serde")]
    pub flush_after: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    pub length_policy: LengthPolicy,
    pub adopt_unmatched: bool,
    pub connection_max_buffer: usize,
    pub total_max_buffer: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DnsConfig {
    pub resolve: bool,
    pub cache_size: usize,
    /// How long a resolved name is reused before it is looked up again.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// How long an address whose lookup failed is labelled by its IP text.
    #[serde(with = "humantime_serde")]
    pub failure_ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen: SocketAddr,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            snaplen: 65536,
            promiscuous: true,
            timeout_ms: 1000,
            filter: None,
            packet_count: -1,
            ip4: true,
            ip6: true,
        }
    }
}

impl CaptureConfig {
    pub fn packet_budget(&self) -> Option<u64> {
        u64::try_from(self.packet_count).ok()
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Flows,
            flush_after: Duration::from_secs(120),
            cleanup_interval: Duration::from_secs(30),
            length_policy: LengthPolicy::Frame,
            adopt_unmatched: true,
            connection_max_buffer: 0,
            total_max_buffer: 0,
        }
    }
}

impl TrackingConfig {
    pub fn assembler(&self) -> AssemblerConfig {
        AssemblerConfig {
            connection_max_buffer: self.connection_max_buffer,
            total_max_buffer: self.total_max_buffer,
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            resolve: false,
            cache_size: 4096,
            cache_ttl: Duration::from_secs(3600),
            failure_ttl: Duration::from_secs(30),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9155)),
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracking.flush_after.is_zero() {
            return Err(ConfigError::ZeroFlushAfter);
        }
        if self.tracking.cleanup_interval.is_zero() {
            return Err(ConfigError::ZeroCleanupInterval);
        }
        if self.capture.snaplen <= 0 {
            return Err(ConfigError::InvalidSnaplen(self.capture.snaplen));
        }
        if self.capture.timeout_ms <= 0 {
            return Err(ConfigError::InvalidTimeout(self.capture.timeout_ms));
        }
        if self.dns.resolve && self.dns.cache_size == 0 {
            return Err(ConfigError::ZeroDnsCache);
        }
        if self.dns.resolve && self.dns.cache_ttl.is_zero() {
            return Err(ConfigError::ZeroDnsTtl);
        }
        Ok(())
    }
}
