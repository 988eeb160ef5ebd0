//! Configuration types for the profiling daemon
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Values are layered: defaults, then an optional TOML file, then
//! `DEVSCOPE_*` environment variables (`__` separates nested keys, e.g.
//! `DEVSCOPE_PIPELINE__WORKERS=4`).

use crate::controller::device::DeviceCapabilities;
use devscope_shared::protocol::wire::{FrameCodec, DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_NAME_LEN};
use devscope_shared::DeviceId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub transport: TransportConfig,
    pub pipeline: PipelineConfig,
    pub watcher: WatcherConfig,

    /// Devices reachable over TCP. Devices missing here are unreachable.
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Control handshake attempts before giving up (data handshake is tried once)
    pub handshake_attempts: u32,

    /// Fixed sleep between control handshake attempts
    pub handshake_interval_ms: u64,

    pub connect_timeout_ms: u64,

    /// Read/write timeout on control connections (None = block forever)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_timeout_ms: Option<u64>,

    /// Hard maximum for one frame; larger frames are rejected unread
    pub max_frame_len: usize,

    /// Maximum type name length, NUL included
    pub max_name_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_attempts: 5,
            handshake_interval_ms: 1000,
            connect_timeout_ms: 3000,
            io_timeout_ms: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_name_len: DEFAULT_MAX_NAME_LEN,
        }
    }
}

impl TransportConfig {
    pub fn handshake_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.max_name_len, self.max_frame_len)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of one chunk buffer in bytes
    pub chunk_capacity: usize,

    /// Bounded queue length per worker
    pub queue_capacity: usize,

    /// Worker threads in the upload pool
    pub workers: usize,

    /// Upper bound on how long a flush waits for queues to drain
    pub flush_timeout_ms: u64,

    /// Root directory for file-mode streams
    pub output_dir: PathBuf,
}

fn default_workers() -> usize {
    num_cpus::get().clamp(1, 16)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: 1024 * 1024,
            queue_capacity: 1024,
            workers: default_workers(),
            flush_timeout_ms: 3000,
            output_dir: PathBuf::from("devscope-output"),
        }
    }
}

impl PipelineConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Sentinel directory; setting it enables the disconnected (cloud) control plane
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Watcher tick: readiness wait timeout and heartbeat sweep period
    pub heartbeat_interval_ms: u64,

    /// A job with no heartbeat for this long is stopped
    pub heartbeat_timeout_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            root: None,
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 30_000,
        }
    }
}

impl WatcherConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// One TCP-reachable device endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: DeviceId,

    /// `host:port` of the device-side agent
    pub address: String,

    #[serde(default)]
    pub capabilities: DeviceCapabilities,
}

impl DaemonConfig {
    /// Load defaults, then `path` (if given), then `DEVSCOPE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("DEVSCOPE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: DaemonConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.transport.handshake_attempts == 0 {
            return invalid("transport.handshake_attempts must be greater than 0");
        }
        if self.transport.max_name_len < 2 {
            return invalid("transport.max_name_len must allow at least one character");
        }
        if self.transport.max_frame_len < self.transport.max_name_len + 4 {
            return invalid("transport.max_frame_len is smaller than a frame header");
        }
        if self.pipeline.workers == 0 {
            return invalid("pipeline.workers must be greater than 0");
        }
        if self.pipeline.chunk_capacity == 0 {
            return invalid("pipeline.chunk_capacity must be greater than 0");
        }
        if self.pipeline.chunk_capacity > self.transport.max_frame_len / 2 {
            return invalid("pipeline.chunk_capacity must leave room in a frame");
        }
        if self.pipeline.queue_capacity == 0 {
            return invalid("pipeline.queue_capacity must be greater than 0");
        }
        if self.watcher.heartbeat_interval_ms == 0 {
            return invalid("watcher.heartbeat_interval_ms must be greater than 0");
        }
        if self.watcher.heartbeat_timeout_ms < self.watcher.heartbeat_interval_ms {
            return invalid("watcher.heartbeat_timeout_ms must not be shorter than the interval");
        }

        let mut ids = std::collections::HashSet::new();
        for device in &self.devices {
            if !ids.insert(device.id) {
                return Err(ConfigError::Invalid(format!(
                    "device {} is configured more than once",
                    device.id
                )));
            }
        }

        Ok(())
    }

    pub fn device(&self, id: DeviceId) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Render as TOML (used by `print-config`).
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
