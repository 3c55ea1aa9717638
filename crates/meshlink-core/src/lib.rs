//! Meshlink Core - Foundational types for the mesh-radio session core
//!
//! This crate provides the types shared between the session manager
//! (`meshlink-ble`) and the persistence layer (`meshlink-state`):
//!
//! - [`peripheral`] - Peripheral identity, discovery records, signal quality
//! - [`session`] - Session model and connection state machine states
//! - [`node`] - Persisted mesh-node snapshots and update kinds
//! - [`version`] - Firmware version parsing and comparison
//! - [`error`] - Core error types
//!
//! # Example
//!
//! ```rust
//! use meshlink_core::{FirmwareVersion, PeripheralId, SignalQuality};
//!
//! let id = PeripheralId::new("9F1C2D3E-0A1B-4C5D-8E9F-001122334455");
//! assert_eq!(id.short(), "9F1C2D3E");
//!
//! let fw: FirmwareVersion = "2.3.2.f00db43".parse().unwrap();
//! assert!(fw >= "2.3.0".parse().unwrap());
//!
//! assert_eq!(SignalQuality::from_rssi(-60), SignalQuality::Good);
//! ```

pub mod error;
pub mod node;
pub mod peripheral;
pub mod session;
pub mod version;

pub use error::{CoreError, Result};
pub use node::{NodeSnapshot, NodeUpdateKind};
pub use peripheral::{
    DiscoveredPeripheral, LinkState, PeripheralId, PreferredDevice, SignalQuality,
};
pub use session::{ConnectionState, Session};
pub use version::FirmwareVersion;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
