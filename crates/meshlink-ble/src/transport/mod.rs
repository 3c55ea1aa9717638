//! Transport abstraction for mesh-radio connectivity
//!
//! The session manager is written against [`RadioTransport`], a thin async
//! interface over whatever BLE stack the platform provides. Implementations:
//!
//! - `BleTransport` - btleplug-backed (requires the `ble` feature; needs
//!   `libdbus-1-dev` on Linux)
//! - [`crate::test_utils::MockRadio`] - deterministic in-memory transport
//!   used by the test suite
//!
//! All transport callbacks are delivered as [`TransportEvent`]s on a single
//! mpsc channel created alongside the transport. The manager owns the
//! receiving end and is the only place session state is mutated, which keeps
//! state transitions from racing across callback contexts.

#[cfg(feature = "ble")]
mod ble;
#[cfg(feature = "ble")]
pub use ble::BleTransport;

use async_trait::async_trait;
use bytes::Bytes;

use meshlink_core::PeripheralId;

use crate::error::Result;

/// Asynchronous callbacks from the transport stack, serialized on one channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The radio adapter powered on or off
    AdapterStateChanged {
        /// Whether the adapter is usable
        powered: bool,
    },
    /// A peripheral advertising the mesh-radio service appeared
    Discovered {
        /// Transport identity
        id: PeripheralId,
        /// Advertised name
        name: String,
        /// Signal strength sample in dBm
        rssi: i16,
    },
    /// A fresh RSSI sample for an already-visible peripheral
    RssiUpdated {
        /// Transport identity
        id: PeripheralId,
        /// Signal strength sample in dBm
        rssi: i16,
    },
    /// A peripheral went out of range
    PeripheralLost {
        /// Transport identity
        id: PeripheralId,
    },
    /// A connect request completed successfully
    Connected {
        /// Transport identity
        id: PeripheralId,
    },
    /// A connect request failed
    ConnectFailed {
        /// Transport identity
        id: PeripheralId,
        /// Transport-reported reason
        reason: String,
    },
    /// An established link dropped
    LinkDropped {
        /// Transport identity
        id: PeripheralId,
        /// Transport-reported reason
        reason: String,
    },
    /// Bytes arrived on the FromRadio characteristic
    Notification {
        /// Transport identity
        id: PeripheralId,
        /// Raw notification payload (may be a partial frame)
        payload: Bytes,
    },
}

/// Interface to the platform radio stack
///
/// Completion of `connect` is signaled by a [`TransportEvent::Connected`] or
/// [`TransportEvent::ConnectFailed`] event, not by the method returning;
/// the method itself only initiates the request. Timeout policy lives in the
/// manager, not the transport.
#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Begin discovery of mesh-radio peripherals. Idempotent while scanning.
    async fn start_scan(&mut self) -> Result<()>;

    /// Halt discovery, releasing the radio.
    async fn stop_scan(&mut self) -> Result<()>;

    /// Initiate a connection to a peripheral.
    async fn connect(&mut self, id: &PeripheralId) -> Result<()>;

    /// Tear down the link to a peripheral and release its resources.
    async fn disconnect(&mut self, id: &PeripheralId) -> Result<()>;

    /// Write a framed payload to the peripheral's ToRadio characteristic.
    async fn write(&mut self, id: &PeripheralId, payload: &[u8]) -> Result<()>;

    /// Transport name for logging.
    fn name(&self) -> &str;
}
