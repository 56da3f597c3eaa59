//! Configuration for the command station controller
//!
//! Loads configuration from a TOML file with the parameters needed to reach
//! a Central Station and tune the core's timers. The core treats all of
//! these as opaque inputs; anything not supplied falls back to the CS2/CS3
//! factory defaults.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Connection parameters (CAN-over-TCP socket and HTTP side-channel)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Central Station hostname or IP address
    pub host: String,
    /// CAN-over-TCP port (15731 on CS2/CS3)
    #[serde(default = "default_can_port")]
    pub can_port: u16,
    /// HTTP port for catalog and icon downloads
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Run against the in-process virtual command station instead of hardware
    #[serde(default)]
    pub virtual_mode: bool,
    /// Connect immediately on daemon startup
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

/// Timer and timeout tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    /// Watchdog liveness interval in seconds
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_interval_secs: u64,
    /// Measurement poll interval in seconds (0 disables polling)
    #[serde(default = "default_poll_secs")]
    pub measurement_poll_secs: u64,
    /// Default accessory switch time in milliseconds
    #[serde(default = "default_switch_time")]
    pub default_switch_time_ms: u16,
    /// Reply timeout for control commands in milliseconds
    #[serde(default = "default_control_timeout")]
    pub control_timeout_ms: u64,
    /// Reply timeout for discovery commands in milliseconds
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_ms: u64,
}

fn default_can_port() -> u16 {
    15731
}

fn default_http_port() -> u16 {
    80
}

fn default_true() -> bool {
    true
}

fn default_watchdog_secs() -> u64 {
    10
}

fn default_poll_secs() -> u64 {
    5
}

fn default_switch_time() -> u16 {
    200
}

fn default_control_timeout() -> u64 {
    1000
}

fn default_discovery_timeout() -> u64 {
    5000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_secs: default_watchdog_secs(),
            measurement_poll_secs: default_poll_secs(),
            default_switch_time_ms: default_switch_time(),
            control_timeout_ms: default_control_timeout(),
            discovery_timeout_ms: default_discovery_timeout(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: ControllerConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default configuration for a Central Station on the usual address
    pub fn cs_defaults() -> Self {
        Self {
            connection: ConnectionConfig {
                host: "192.168.0.2".to_string(),
                can_port: default_can_port(),
                http_port: default_http_port(),
                virtual_mode: false,
                auto_connect: true,
            },
            timing: TimingConfig::default(),
        }
    }

    /// Configuration for the in-process virtual command station
    pub fn virtual_defaults() -> Self {
        let mut config = Self::cs_defaults();
        config.connection.host = "127.0.0.1".to_string();
        config.connection.virtual_mode = true;
        config
    }
}
