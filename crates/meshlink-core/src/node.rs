//! Persisted mesh-node state
//!
//! [`NodeSnapshot`] is the subset of node state the session core reads and
//! writes in the persistent store, keyed by node number. The sync bridge
//! merges inbound updates into the snapshot; consumers render from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Kinds of node updates delivered over the notification stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeUpdateKind {
    /// Names and identity of a node
    NodeInfo = 1,
    /// GPS position
    Position = 2,
    /// Battery, channel utilization, airtime
    Telemetry = 3,
    /// Radio configuration (region code)
    Config = 4,
}

impl NodeUpdateKind {
    /// Stable string form, used as a storage key
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeUpdateKind::NodeInfo => "node_info",
            NodeUpdateKind::Position => "position",
            NodeUpdateKind::Telemetry => "telemetry",
            NodeUpdateKind::Config => "config",
        }
    }

    /// All kinds, in tag order
    pub fn all() -> [NodeUpdateKind; 4] {
        [
            NodeUpdateKind::NodeInfo,
            NodeUpdateKind::Position,
            NodeUpdateKind::Telemetry,
            NodeUpdateKind::Config,
        ]
    }
}

impl TryFrom<u8> for NodeUpdateKind {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NodeUpdateKind::NodeInfo),
            2 => Ok(NodeUpdateKind::Position),
            3 => Ok(NodeUpdateKind::Telemetry),
            4 => Ok(NodeUpdateKind::Config),
            other => Err(CoreError::UnknownUpdateKind(other)),
        }
    }
}

impl std::fmt::Display for NodeUpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted state describing one mesh node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Mesh node number (storage key)
    pub num: u32,
    /// Short display name (up to 4 characters on most radios)
    pub short_name: Option<String>,
    /// Long display name
    pub long_name: Option<String>,
    /// Firmware version string as reported by the device
    pub firmware: Option<String>,
    /// LoRa region code; `None` or `Some(0)` means unset
    pub region: Option<u16>,
    /// Latitude in degrees
    pub latitude: Option<f64>,
    /// Longitude in degrees
    pub longitude: Option<f64>,
    /// Battery level percent
    pub battery_level: Option<u32>,
    /// Channel utilization percent
    pub channel_utilization: Option<f64>,
    /// Transmit airtime utilization percent
    pub air_util_tx: Option<f64>,
    /// When the node was last heard from
    pub last_heard: Option<DateTime<Utc>>,
}

impl NodeSnapshot {
    /// Create an empty snapshot for a node number
    pub fn new(num: u32) -> Self {
        Self {
            num,
            ..Default::default()
        }
    }

    /// Whether the node's LoRa region is unset.
    ///
    /// Region code 0 is the wire value for "unset"; a node that has never
    /// reported configuration counts as unset too.
    pub fn region_unset(&self) -> bool {
        matches!(self.region, None | Some(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in NodeUpdateKind::all() {
            assert_eq!(NodeUpdateKind::try_from(kind as u8).unwrap(), kind);
        }
        assert!(NodeUpdateKind::try_from(0).is_err());
        assert!(NodeUpdateKind::try_from(99).is_err());
    }

    #[test]
    fn test_region_unset() {
        let mut node = NodeSnapshot::new(1234);
        assert!(node.region_unset());

        node.region = Some(0);
        assert!(node.region_unset());

        node.region = Some(3); // US
        assert!(!node.region_unset());
    }
}
