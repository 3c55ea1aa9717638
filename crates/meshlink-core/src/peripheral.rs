//! Peripheral identity and discovery types
//!
//! A peripheral is a mesh radio visible over the transport. Discovery records
//! are ephemeral: they exist only while the device is in range during the
//! process lifetime. The preferred-device pair is the one piece of peripheral
//! identity that survives restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a peripheral as reported by the transport.
///
/// On most platforms this is a UUID string; the core treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralId(pub String);

impl PeripheralId {
    /// Create a peripheral id from its string form
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random peripheral id (used by tests and mock transports)
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get a short form of the id (first 8 characters)
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport-level link state of a single peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No link
    Disconnected,
    /// Link establishment in progress
    Connecting,
    /// Link established
    Connected,
}

/// Coarse signal quality derived from an RSSI sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalQuality {
    /// Below -80 dBm
    Poor,
    /// -80 to -68 dBm
    Fair,
    /// -67 to -56 dBm
    Good,
    /// -55 dBm and above
    Excellent,
}

impl SignalQuality {
    /// Bucket an RSSI sample (dBm) into a quality level
    pub fn from_rssi(rssi: i16) -> Self {
        if rssi >= -55 {
            SignalQuality::Excellent
        } else if rssi >= -67 {
            SignalQuality::Good
        } else if rssi >= -80 {
            SignalQuality::Fair
        } else {
            SignalQuality::Poor
        }
    }
}

/// A peripheral currently visible to the scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPeripheral {
    /// Transport identity
    pub id: PeripheralId,
    /// Advertised device name
    pub name: String,
    /// Most recent RSSI sample in dBm
    pub rssi: i16,
    /// When the peripheral was last seen advertising
    pub last_seen: DateTime<Utc>,
    /// Current link state
    pub link: LinkState,
}

impl DiscoveredPeripheral {
    /// Create a discovery record for a newly seen peripheral
    pub fn new(id: PeripheralId, name: impl Into<String>, rssi: i16) -> Self {
        Self {
            id,
            name: name.into(),
            rssi,
            last_seen: Utc::now(),
            link: LinkState::Disconnected,
        }
    }

    /// Signal quality bucket for the latest RSSI sample
    pub fn signal_quality(&self) -> SignalQuality {
        SignalQuality::from_rssi(self.rssi)
    }
}

/// The persisted preferred device: the radio to reconnect to automatically
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredDevice {
    /// Peripheral transport identity
    pub peripheral_id: PeripheralId,
    /// Mesh node number associated with the device
    pub node_num: u32,
}

impl PreferredDevice {
    /// Create a preferred-device pair
    pub fn new(peripheral_id: PeripheralId, node_num: u32) -> Self {
        Self {
            peripheral_id,
            node_num,
        }
    }

    /// Whether the pair refers to the given peripheral
    pub fn matches(&self, id: &PeripheralId) -> bool {
        &self.peripheral_id == id
    }
}
