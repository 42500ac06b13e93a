//! Per-bus configuration.
//!
//! Every value has a default matching the protocol's reference timings, so an
//! empty JSON object is a valid configuration file.

use crate::error::ConfigError;
use crate::protocol::MAX_SLAVES;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 1000;
const DEFAULT_SILENCE_LIMIT_MS: u64 = 5000;
const DEFAULT_EVENT_CAPACITY: usize = 8;
const DEFAULT_COMMAND_CAPACITY: usize = 1;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 1000;
const DEFAULT_INBOUND_CAPACITY: usize = 32;

// Adapters report a missing acknowledge with one of these, depending on the driver.
#[cfg(target_os = "linux")]
const DEFAULT_NACK_ERRNOS: &[i32] = &[
    libc::ENXIO,
    libc::EREMOTEIO,
    libc::EIO,
    libc::ETIMEDOUT,
    libc::EAGAIN,
];
#[cfg(not(target_os = "linux"))]
const DEFAULT_NACK_ERRNOS: &[i32] = &[libc::ENXIO, libc::EIO, libc::ETIMEDOUT, libc::EAGAIN];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Period of the discovery timer.
    pub discovery_interval_ms: u64,
    /// A slave not seen for this long gets probed during discovery.
    pub silence_limit_ms: u64,
    pub max_slaves: usize,
    /// Upper bound of consecutive polls in one alert burst.
    pub poll_burst_limit: usize,
    pub event_capacity: usize,
    pub command_capacity: usize,
    pub sim: SimConfig,
    pub i2c: I2cConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: DEFAULT_DISCOVERY_INTERVAL_MS,
            silence_limit_ms: DEFAULT_SILENCE_LIMIT_MS,
            max_slaves: MAX_SLAVES,
            poll_burst_limit: MAX_SLAVES,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            sim: SimConfig::default(),
            i2c: I2cConfig::default(),
        }
    }
}

impl BusConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &'static str, &'static str); 7] = [
            (self.discovery_interval_ms > 0, "discovery_interval_ms", "positive"),
            (self.silence_limit_ms > 0, "silence_limit_ms", "positive"),
            (
                self.max_slaves > 0 && self.max_slaves <= MAX_SLAVES,
                "max_slaves",
                "between 1 and 32",
            ),
            (self.poll_burst_limit > 0, "poll_burst_limit", "positive"),
            (self.event_capacity > 0, "event_capacity", "positive"),
            (self.command_capacity > 0, "command_capacity", "positive"),
            (self.sim.inbound_capacity > 0, "sim.inbound_capacity", "positive"),
        ];

        for (ok, field, requirement) in checks {
            if !ok {
                return Err(ConfigError::Invalid { field, requirement });
            }
        }
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn silence_limit(&self) -> Duration {
        Duration::from_millis(self.silence_limit_ms)
    }
}

/// Settings of the simulated TCP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub handshake_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Packets received from slaves and not yet taken by the bus. A full
    /// queue stops reading from the slaves' connections.
    pub inbound_capacity: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

impl SimConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Settings of the hardware I2C transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct I2cConfig {
    /// `errno` values of a failed `I2C_RDWR` that mean "not acknowledged".
    /// Every other errno is a fatal I/O error.
    pub nack_errnos: Vec<i32>,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            nack_errnos: DEFAULT_NACK_ERRNOS.to_vec(),
        }
    }
}

impl I2cConfig {
    pub fn is_nack(&self, errno: i32) -> bool {
        self.nack_errnos.contains(&errno)
    }
}
