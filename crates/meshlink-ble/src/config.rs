//! Configuration for the session manager
//!
//! This module provides the configuration structures for scanning, connect
//! attempts, handshake pacing, and reconnect behavior, plus the protocol
//! constants shared by the transport implementations.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use meshlink_core::FirmwareVersion;

/// GATT service advertised by mesh radios
pub const RADIO_SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1_b218_15a8_461f_9fa8_5dca_e273_eafd);

/// Characteristic the app writes frames to
pub const TO_RADIO_UUID: Uuid = Uuid::from_u128(0xf75c_76d2_129e_4dad_a1dd_7866_1244_01e7);

/// Characteristic the radio notifies frames on
pub const FROM_RADIO_UUID: Uuid = Uuid::from_u128(0x8ba2_bcc2_ee02_4a55_a531_c525_c5e4_54d5);

/// Frame magic number (first 2 bytes of every frame)
pub const FRAME_MAGIC: u16 = 0x94C3;

/// Maximum frame payload size
pub const MAX_FRAME_PAYLOAD: usize = 512;

/// Hard ceiling on connect attempts per session
pub const MAX_CONNECT_ATTEMPTS: u8 = 10;

/// Oldest firmware the session core will negotiate with
pub const MIN_FIRMWARE_VERSION: FirmwareVersion = FirmwareVersion::new(2, 3, 0);

/// Protocol version this implementation speaks
pub const PROTOCOL_VERSION: u32 = 1;

/// Main configuration for the connection manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Scanning behavior
    #[serde(default)]
    pub scan: ScanConfig,

    /// Connect attempt behavior
    #[serde(default)]
    pub connect: ConnectConfig,

    /// Handshake pacing
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// Reconnect pacing (the enable flag is a persisted preference)
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Drop peripherals not seen advertising for this long
    #[serde(with = "humantime_serde", default = "default_stale_after")]
    pub stale_after: Duration,
}

fn default_stale_after() -> Duration {
    Duration::from_secs(30)
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
        }
    }
}

/// Connect attempt configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Timeout window for a single connect attempt
    #[serde(with = "humantime_serde", default = "default_attempt_timeout")]
    pub attempt_timeout: Duration,

    /// Attempt ceiling (clamped to [`MAX_CONNECT_ATTEMPTS`])
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,
}

fn default_attempt_timeout() -> Duration {
    Duration::from_millis(1500)
}

fn default_max_attempts() -> u8 {
    MAX_CONNECT_ATTEMPTS
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: default_attempt_timeout(),
            max_attempts: MAX_CONNECT_ATTEMPTS,
        }
    }
}

/// Handshake pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Timeout for each handshake step (identity, config, subscribe)
    #[serde(with = "humantime_serde", default = "default_step_timeout")]
    pub step_timeout: Duration,
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            step_timeout: default_step_timeout(),
        }
    }
}

/// Reconnect pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt after a link drop
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Cap on the delay between reconnect attempts
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// Builder for [`ManagerConfig`]
#[derive(Debug, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt connect timeout
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect.attempt_timeout = timeout;
        self
    }

    /// Set the connect attempt ceiling (clamped to 10)
    pub fn max_attempts(mut self, attempts: u8) -> Self {
        self.config.connect.max_attempts = attempts.clamp(1, MAX_CONNECT_ATTEMPTS);
        self
    }

    /// Set the per-step handshake timeout
    pub fn handshake_step_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake.step_timeout = timeout;
        self
    }

    /// Set the delay before the first reconnect attempt
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect.initial_delay = delay;
        self
    }

    /// Set the scanner stale-entry horizon
    pub fn scan_stale_after(mut self, horizon: Duration) -> Self {
        self.config.scan.stale_after = horizon;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.connect.max_attempts, MAX_CONNECT_ATTEMPTS);
        assert_eq!(config.connect.attempt_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_builder() {
        let config = ManagerConfigBuilder::new()
            .attempt_timeout(Duration::from_millis(500))
            .max_attempts(3)
            .build();

        assert_eq!(config.connect.attempt_timeout, Duration::from_millis(500));
        assert_eq!(config.connect.max_attempts, 3);
    }

    #[test]
    fn test_max_attempts_clamping() {
        let config = ManagerConfigBuilder::new().max_attempts(50).build();
        assert_eq!(config.connect.max_attempts, MAX_CONNECT_ATTEMPTS);

        let config = ManagerConfigBuilder::new().max_attempts(0).build();
        assert_eq!(config.connect.max_attempts, 1);
    }

    #[test]
    fn test_minimum_firmware_constant() {
        assert_eq!(MIN_FIRMWARE_VERSION.to_string(), "2.3.0");
    }
}
