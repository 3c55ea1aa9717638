//! BLE Connection and Session Manager for Mesh Radios
//!
//! This crate is the headless core of a mesh-radio companion app: it
//! discovers radios over Bluetooth Low Energy, connects to exactly one of
//! them, negotiates a session, and keeps a local persistent store of mesh
//! node state synchronized with the device. Consumers (UI layers, daemons)
//! observe state snapshots; they never touch the transport directly.
//!
//! # Architecture
//!
//! The core operates in four layers:
//!
//! 1. **Transport** - [`RadioTransport`] over btleplug (or a mock)
//! 2. **Connection State Machine** - [`ConnectionManager`] with a 10-attempt
//!    ceiling, per-attempt timeouts, and single-active-session discipline
//! 3. **Session Negotiation** - identity → firmware version check → config
//!    pull → notification subscribe
//! 4. **Sync** - idempotent application of node updates to the store, plus
//!    outbound text/config requests
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Enable the `ble` feature for real hardware:
//! // meshlink-ble = { version = "0.1", features = ["ble"] }
//!
//! use meshlink_ble::{BleTransport, ConnectionManager, ManagerConfig};
//! use meshlink_state::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqliteStore::open("meshlink.db").await?;
//!     let (transport, events) = BleTransport::new().await?;
//!
//!     let (manager, handle) =
//!         ConnectionManager::new(transport, events, store, ManagerConfig::default());
//!     tokio::spawn(manager.run());
//!
//!     // Discover radios; state arrives on the watch channel.
//!     handle.start_scanning().await?;
//!     let mut state = handle.watch();
//!     while state.changed().await.is_ok() {
//!         let snapshot = state.borrow().clone();
//!         println!("{} radios visible", snapshot.visible.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Session lifecycle
//!
//! ```text
//! Disconnected ──connect──► Connecting ──link up──► Connected
//!      ▲                        │                       │
//!      │                 10 attempts exhausted      handshake
//!      │                        ▼                       ▼
//!      │◄──link drop──────── Failed ◄──old firmware─ Subscribed
//!      │                                                │
//!      └───────────◄─ Reconnecting ◄──preferred device drop
//! ```
//!
//! A session's `is_subscribed` flag becomes true only after the full
//! handshake completes; an incompatible firmware version is terminal for
//! that device and is surfaced for explicit user acknowledgment.
//!
//! # Features
//!
//! - `ble` - btleplug-backed transport (requires `libdbus-1-dev` on Linux)

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

// Session components
pub mod handshake;
pub mod policy;
pub mod scanner;
pub mod sync;

// The manager service
pub mod manager;

// Testing utilities
pub mod test_utils;

// Re-exports for convenience
pub use config::{
    ConnectConfig, HandshakeConfig, ManagerConfig, ManagerConfigBuilder, ReconnectConfig,
    ScanConfig, FRAME_MAGIC, MAX_CONNECT_ATTEMPTS, MIN_FIRMWARE_VERSION, PROTOCOL_VERSION,
    RADIO_SERVICE_UUID,
};
pub use error::{Result, SessionError};
pub use handshake::{HandshakeStep, NegotiatedSession, Negotiator, Progress};
pub use manager::{ConnectionManager, ManagerCommand, ManagerHandle, ManagerState, ManagerStats};
pub use policy::{should_reconnect, PreferredDevicePolicy};
pub use protocol::{FrameReader, NodeUpdate, NodeUpdateBody, RadioFrame};
pub use scanner::Scanner;
pub use sync::{ApplyOutcome, SyncBridge};
pub use transport::{RadioTransport, TransportEvent};

#[cfg(feature = "ble")]
pub use transport::BleTransport;

// Core type re-exports so consumers rarely need meshlink-core directly
pub use meshlink_core::{
    ConnectionState, DiscoveredPeripheral, FirmwareVersion, NodeSnapshot, NodeUpdateKind,
    PeripheralId, PreferredDevice, Session, SignalQuality,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(FRAME_MAGIC, 0x94C3);
        assert_eq!(MAX_CONNECT_ATTEMPTS, 10);
        assert_eq!(MIN_FIRMWARE_VERSION.to_string(), "2.3.0");
        assert_eq!(PROTOCOL_VERSION, 1);
    }
}
