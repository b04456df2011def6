//! Fault detection settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ping_retry_count must be at least 1")]
    ZeroRetryCount,
    #[error("ping_timeout must be greater than zero")]
    ZeroPingTimeout,
    #[error("notification_queue_capacity must be at least 1")]
    ZeroQueueCapacity,
}

/// Configuration for node fault detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultDetectionConfig {
    /// Time between successful pings to the same node (default: 1s)
    #[serde(with = "millis")]
    pub ping_interval: Duration,
    /// Per-attempt timeout (default: 30s)
    #[serde(with = "millis")]
    pub ping_timeout: Duration,
    /// Consecutive failed attempts before a node is declared failed (default: 3)
    pub ping_retry_count: u32,
    /// Try one reconnect when the transport reports a disconnect (default: false)
    pub connect_on_network_disconnect: bool,
    /// Forward transport disconnects to the detector (default: true)
    pub register_connection_listener: bool,
    /// Bound of the listener notification queue (default: 1024)
    pub notification_queue_capacity: usize,
}

impl Default for FaultDetectionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(30),
            ping_retry_count: 3,
            connect_on_network_disconnect: false,
            register_connection_listener: true,
            notification_queue_capacity: 1024,
        }
    }
}

impl FaultDetectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_retry_count == 0 {
            return Err(ConfigError::ZeroRetryCount);
        }
        if self.ping_timeout.is_zero() {
            return Err(ConfigError::ZeroPingTimeout);
        }
        if self.notification_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }
}

/// Durations as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
