//! Session model and connection lifecycle states
//!
//! A [`Session`] wraps exactly one peripheral from the moment a connect
//! attempt starts. It is replaced wholesale on reconnect; it is never
//! partially reused. At most one session is active at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::peripheral::PeripheralId;
use crate::version::FirmwareVersion;

/// Lifecycle state of the single managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection and none in progress
    Disconnected,
    /// Transport-level connect in progress
    Connecting,
    /// Transport link established, handshake not yet complete
    Connected,
    /// Handshake complete, notification stream live
    Subscribed,
    /// Link dropped; automatic reconnect to the preferred device in progress
    Reconnecting,
    /// Terminal for the current device (attempt ceiling or incompatible firmware)
    Failed,
}

impl ConnectionState {
    /// Whether a peripheral currently occupies the connection slot
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Subscribed
                | ConnectionState::Reconnecting
        )
    }

    /// Whether the transport link is up
    pub fn is_linked(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Subscribed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Subscribed => write!(f, "subscribed"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// The live, negotiated state of the connection to one peripheral
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// The peripheral this session wraps
    pub peripheral_id: PeripheralId,
    /// Advertised name at connect time
    pub name: String,
    /// Mesh node number, known after the identity exchange
    pub node_num: Option<u32>,
    /// Firmware version, known after the identity exchange
    pub firmware: Option<FirmwareVersion>,
    /// Negotiated protocol version
    pub protocol_version: Option<u32>,
    /// True only after the full handshake has completed
    pub is_subscribed: bool,
    /// Connect attempt currently underway (1-based)
    pub attempt: u8,
    /// Most recent error surfaced to consumers
    pub last_error: Option<String>,
    /// When the first connect attempt started
    pub started_at: DateTime<Utc>,
}

impl Session {
    /// Create a session for a fresh connect attempt
    pub fn new(peripheral_id: PeripheralId, name: impl Into<String>) -> Self {
        Self {
            peripheral_id,
            name: name.into(),
            node_num: None,
            firmware: None,
            protocol_version: None,
            is_subscribed: false,
            attempt: 1,
            last_error: None,
            started_at: Utc::now(),
        }
    }

    /// Record an error for consumer display
    pub fn note_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Firmware version string for display, if known
    pub fn firmware_string(&self) -> Option<String> {
        self.firmware.map(|v| v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Subscribed.to_string(), "subscribed");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn test_active_states() {
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Reconnecting.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(!ConnectionState::Failed.is_active());
    }

    #[test]
    fn test_new_session_is_unsubscribed() {
        let session = Session::new(PeripheralId::new("AA:BB"), "Mesh-A1B2");
        assert!(!session.is_subscribed);
        assert_eq!(session.attempt, 1);
        assert!(session.last_error.is_none());
    }
}
