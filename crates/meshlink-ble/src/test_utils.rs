//! Testing utilities
//!
//! [`MockRadio`] is a deterministic in-memory transport that behaves like a
//! radio stack plus one emulated mesh device. Tests configure a
//! [`DeviceProfile`] (firmware, node number, region), script connect
//! failures, and inject arbitrary transport events through the
//! [`MockRadioHandle`].
//!
//! The mock answers handshake frames the way a real radio would, so the
//! full manager loop can be exercised without hardware.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use meshlink_core::PeripheralId;

use crate::error::{Result, SessionError};
use crate::protocol::{FrameReader, NodeUpdate, RadioFrame};
use crate::transport::{RadioTransport, TransportEvent};

/// Identity the emulated device reports during the handshake
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    /// Mesh node number
    pub node_num: u32,
    /// Firmware version string reported in the identity response
    pub firmware: String,
    /// Protocol version
    pub protocol_version: u32,
    /// LoRa region code (0 = unset)
    pub region: u16,
    /// Channel count
    pub max_channels: u8,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            node_num: 1234,
            firmware: "2.3.2".to_string(),
            protocol_version: 1,
            region: 3,
            max_channels: 8,
        }
    }
}

/// A transport call recorded by the mock, in call order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOp {
    /// `start_scan` was called
    StartScan,
    /// `stop_scan` was called
    StopScan,
    /// `connect` was called for the peripheral
    Connect(PeripheralId),
    /// `disconnect` was called for the peripheral
    Disconnect(PeripheralId),
    /// `write` was called for the peripheral
    Write(PeripheralId),
}

#[derive(Debug)]
struct MockShared {
    ops: Vec<TransportOp>,
    profile: DeviceProfile,
    /// Number of upcoming connect calls that should fail
    connect_failures: u32,
    /// Swallow handshake frames so step timeouts can be tested
    mute_device: bool,
    /// Decoded frames written to the device
    written_frames: Vec<RadioFrame>,
}

/// Deterministic in-memory transport with an emulated device behind it
#[derive(Debug)]
pub struct MockRadio {
    shared: Arc<Mutex<MockShared>>,
    events_tx: mpsc::Sender<TransportEvent>,
    reader: FrameReader,
    scanning: bool,
    connected: Option<PeripheralId>,
}

/// Test-side handle for scripting the mock
#[derive(Debug, Clone)]
pub struct MockRadioHandle {
    shared: Arc<Mutex<MockShared>>,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl MockRadio {
    /// Create a mock with the default device profile
    pub fn new() -> (Self, mpsc::Receiver<TransportEvent>, MockRadioHandle) {
        Self::with_profile(DeviceProfile::default())
    }

    /// Create a mock emulating the given device
    pub fn with_profile(
        profile: DeviceProfile,
    ) -> (Self, mpsc::Receiver<TransportEvent>, MockRadioHandle) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let shared = Arc::new(Mutex::new(MockShared {
            ops: Vec::new(),
            profile,
            connect_failures: 0,
            mute_device: false,
            written_frames: Vec::new(),
        }));

        let handle = MockRadioHandle {
            shared: shared.clone(),
            events_tx: events_tx.clone(),
        };

        (
            Self {
                shared,
                events_tx,
                reader: FrameReader::new(),
                scanning: false,
                connected: None,
            },
            events_rx,
            handle,
        )
    }

    async fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event).await;
    }

    /// Answer a handshake frame the way the emulated device would
    async fn device_respond(&mut self, id: &PeripheralId, frame: &RadioFrame) {
        let (profile, mute) = {
            let shared = self.shared.lock();
            (shared.profile.clone(), shared.mute_device)
        };
        if mute {
            return;
        }

        let response = match frame {
            RadioFrame::WantIdentity => Some(RadioFrame::Identity {
                node_num: profile.node_num,
                protocol_version: profile.protocol_version,
                firmware: profile.firmware.clone(),
            }),
            RadioFrame::WantConfig | RadioFrame::ConfigRequest => {
                Some(RadioFrame::ConfigComplete {
                    region: profile.region,
                    max_channels: profile.max_channels,
                })
            }
            RadioFrame::Subscribe => Some(RadioFrame::SubscribeAck),
            _ => None,
        };

        if let Some(response) = response {
            let encoded = response.encode().expect("mock frames encode");
            self.emit(TransportEvent::Notification {
                id: id.clone(),
                payload: encoded,
            })
            .await;
        }
    }
}

#[async_trait]
impl RadioTransport for MockRadio {
    async fn start_scan(&mut self) -> Result<()> {
        self.shared.lock().ops.push(TransportOp::StartScan);
        self.scanning = true;
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        self.shared.lock().ops.push(TransportOp::StopScan);
        self.scanning = false;
        Ok(())
    }

    async fn connect(&mut self, id: &PeripheralId) -> Result<()> {
        let should_fail = {
            let mut shared = self.shared.lock();
            shared.ops.push(TransportOp::Connect(id.clone()));
            if shared.connect_failures > 0 {
                shared.connect_failures -= 1;
                true
            } else {
                false
            }
        };

        if should_fail {
            self.emit(TransportEvent::ConnectFailed {
                id: id.clone(),
                reason: "scripted failure".to_string(),
            })
            .await;
        } else {
            self.connected = Some(id.clone());
            self.emit(TransportEvent::Connected { id: id.clone() }).await;
        }
        Ok(())
    }

    async fn disconnect(&mut self, id: &PeripheralId) -> Result<()> {
        self.shared.lock().ops.push(TransportOp::Disconnect(id.clone()));
        self.connected = None;
        self.reader.clear();
        Ok(())
    }

    async fn write(&mut self, id: &PeripheralId, payload: &[u8]) -> Result<()> {
        if self.connected.as_ref() != Some(id) {
            return Err(SessionError::WriteError("not connected".to_string()));
        }
        self.shared.lock().ops.push(TransportOp::Write(id.clone()));

        self.reader.extend(payload);
        let mut decoded = Vec::new();
        while let Some(frame_payload) = self.reader.next_frame()? {
            decoded.push(RadioFrame::decode(&frame_payload)?);
        }
        for frame in decoded {
            self.shared.lock().written_frames.push(frame.clone());
            self.device_respond(id, &frame).await;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "MockRadio"
    }
}

impl MockRadioHandle {
    /// Script the next `count` connect calls to fail
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.lock().connect_failures = count;
    }

    /// Stop the emulated device from answering handshake frames
    pub fn mute_device(&self, muted: bool) {
        self.shared.lock().mute_device = muted;
    }

    /// Swap the emulated device profile
    pub fn set_profile(&self, profile: DeviceProfile) {
        self.shared.lock().profile = profile;
    }

    /// All transport calls made so far, in order
    pub fn ops(&self) -> Vec<TransportOp> {
        self.shared.lock().ops.clone()
    }

    /// All frames the manager wrote to the device, decoded
    pub fn written_frames(&self) -> Vec<RadioFrame> {
        self.shared.lock().written_frames.clone()
    }

    /// Make a peripheral visible to the scanner
    pub async fn advertise(&self, id: &PeripheralId, name: &str, rssi: i16) {
        let _ = self
            .events_tx
            .send(TransportEvent::Discovered {
                id: id.clone(),
                name: name.to_string(),
                rssi,
            })
            .await;
    }

    /// Drop the link to a connected peripheral
    pub async fn drop_link(&self, id: &PeripheralId, reason: &str) {
        let _ = self
            .events_tx
            .send(TransportEvent::LinkDropped {
                id: id.clone(),
                reason: reason.to_string(),
            })
            .await;
    }

    /// Flip adapter power
    pub async fn set_powered(&self, powered: bool) {
        let _ = self
            .events_tx
            .send(TransportEvent::AdapterStateChanged { powered })
            .await;
    }

    /// Deliver a node update notification from the device
    pub async fn notify_update(&self, id: &PeripheralId, update: NodeUpdate) {
        let encoded = RadioFrame::NodeUpdate(update).encode().expect("mock frames encode");
        let _ = self
            .events_tx
            .send(TransportEvent::Notification {
                id: id.clone(),
                payload: encoded,
            })
            .await;
    }

    /// Deliver raw bytes as a notification (fragmentation/garbage tests)
    pub async fn notify_raw(&self, id: &PeripheralId, payload: Bytes) {
        let _ = self
            .events_tx
            .send(TransportEvent::Notification {
                id: id.clone(),
                payload,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_answers_handshake() {
        let (mut radio, mut events, _handle) = MockRadio::new();
        let id = PeripheralId::new("AA:BB");

        radio.connect(&id).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Connected { id: id.clone() }
        );

        let want = RadioFrame::WantIdentity.encode().unwrap();
        radio.write(&id, &want).await.unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Notification { payload, .. } => {
                let mut reader = FrameReader::new();
                reader.extend(&payload);
                let frame = RadioFrame::decode(&reader.next_frame().unwrap().unwrap()).unwrap();
                assert!(matches!(frame, RadioFrame::Identity { node_num: 1234, .. }));
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mock_scripted_connect_failures() {
        let (mut radio, mut events, handle) = MockRadio::new();
        let id = PeripheralId::new("AA:BB");
        handle.fail_next_connects(1);

        radio.connect(&id).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::ConnectFailed { .. }
        ));

        radio.connect(&id).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Connected { .. }
        ));
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let (mut radio, _events, _handle) = MockRadio::new();
        let id = PeripheralId::new("AA:BB");
        let frame = RadioFrame::WantIdentity.encode().unwrap();
        assert!(radio.write(&id, &frame).await.is_err());
    }
}
