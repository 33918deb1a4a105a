//! Configuration sections - broker, logging and system settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Broker connection settings shared by every module's event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or address. Required: there is no default, and a
    /// config without one fails validation.
    #[serde(default)]
    pub broker: String,

    /// Broker TCP port.
    /// Default: 1883
    #[serde(default = "MqttConfig::default_port")]
    pub port: u16,

    /// Default quality-of-service level for publish and subscribe (0, 1 or 2).
    /// Default: 1
    #[serde(default = "MqttConfig::default_qos")]
    pub qos: u8,

    /// Keep-alive interval in seconds.
    /// Default: 60
    #[serde(default = "MqttConfig::default_keepalive")]
    pub keepalive: u64,

    /// First reconnect delay in milliseconds (doubles per attempt).
    /// Default: 1000
    #[serde(default = "MqttConfig::default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Upper bound for the reconnect delay in milliseconds.
    /// Default: 32000
    #[serde(default = "MqttConfig::default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_qos() -> u8 {
        1
    }

    fn default_keepalive() -> u64 {
        60
    }

    fn default_reconnect_initial_ms() -> u64 {
        1_000
    }

    fn default_reconnect_max_ms() -> u64 {
        32_000
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: String::new(),
            port: Self::default_port(),
            qos: Self::default_qos(),
            keepalive: Self::default_keepalive(),
            reconnect_initial_ms: Self::default_reconnect_initial_ms(),
            reconnect_max_ms: Self::default_reconnect_max_ms(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    /// Default: false
    #[serde(default)]
    pub json: bool,

    /// Directory for per-module log files, rotated daily. Relative paths
    /// are taken from the working directory.
    /// Default: logs
    #[serde(default = "LoggingConfig::default_dir")]
    pub dir: PathBuf,

    /// Days of rotated log files to keep.
    /// Default: 7
    #[serde(default = "LoggingConfig::default_rotate_days")]
    pub rotate_days: u32,
}

impl LoggingConfig {
    pub const LEVELS: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];

    fn default_level() -> String {
        "info".to_string()
    }

    fn default_dir() -> PathBuf {
        PathBuf::from("logs")
    }

    fn default_rotate_days() -> u32 {
        7
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            dir: Self::default_dir(),
            rotate_days: Self::default_rotate_days(),
        }
    }
}

/// Process-wide settings shared by all modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// First topic segment for every bus topic.
    /// Default: sa
    #[serde(default = "SystemConfig::default_service_prefix")]
    pub service_prefix: String,

    /// Root directory of the installation.
    /// Default: .
    #[serde(default = "SystemConfig::default_project_root")]
    pub project_root: PathBuf,

    /// Seconds between health heartbeats.
    /// Default: 30
    #[serde(default = "SystemConfig::default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl SystemConfig {
    fn default_service_prefix() -> String {
        "sa".to_string()
    }

    fn default_project_root() -> PathBuf {
        PathBuf::from(".")
    }

    fn default_heartbeat_interval_secs() -> u64 {
        30
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            service_prefix: Self::default_service_prefix(),
            project_root: Self::default_project_root(),
            heartbeat_interval_secs: Self::default_heartbeat_interval_secs(),
        }
    }
}
