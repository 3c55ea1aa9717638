//! btleplug-backed radio transport
//!
//! Bridges the platform BLE stack into the serialized [`TransportEvent`]
//! channel the manager consumes. Scanning is filtered to peripherals
//! advertising the mesh-radio service; connected peripherals get their
//! FromRadio characteristic subscribed and pumped into the event channel.
//!
//! # Requirements
//!
//! Enable the `ble` feature in Cargo.toml. On Linux you also need BlueZ
//! development files:
//!
//! ```bash
//! apt install libdbus-1-dev
//! ```

use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use meshlink_core::PeripheralId;

use crate::config::{FROM_RADIO_UUID, RADIO_SERVICE_UUID, TO_RADIO_UUID};
use crate::error::{Result, SessionError};
use crate::transport::{RadioTransport, TransportEvent};

/// Event channel depth between the BLE stack and the manager
const EVENT_QUEUE_DEPTH: usize = 256;

/// BLE transport over btleplug
///
/// Create with [`BleTransport::new`], which also returns the event channel
/// receiver to hand to the manager.
pub struct BleTransport {
    adapter: Adapter,
    events_tx: mpsc::Sender<TransportEvent>,
    scanning: bool,
}

impl BleTransport {
    /// Initialize the platform BLE stack and spawn the event pump.
    ///
    /// Fails with [`SessionError::TransportUnavailable`] when no Bluetooth
    /// adapter is present.
    pub async fn new() -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(SessionError::TransportUnavailable)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        // Consumers start from a powered adapter; power loss shows up as
        // scan/connect failures reported by the stack.
        let _ = events_tx
            .send(TransportEvent::AdapterStateChanged { powered: true })
            .await;

        Self::spawn_event_pump(adapter.clone(), events_tx.clone()).await?;

        info!("BLE transport initialized");
        Ok((
            Self {
                adapter,
                events_tx,
                scanning: false,
            },
            events_rx,
        ))
    }

    /// Translate btleplug central events into transport events
    async fn spawn_event_pump(
        adapter: Adapter,
        events_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<()> {
        let mut stream = adapter.events().await?;

        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(pid) | CentralEvent::DeviceUpdated(pid) => {
                        let Ok(peripheral) = adapter.peripheral(&pid).await else {
                            continue;
                        };
                        let Ok(Some(props)) = peripheral.properties().await else {
                            continue;
                        };
                        // The scan filter should already restrict us to mesh
                        // radios, but macOS delivers cached peripherals too.
                        if !props.services.contains(&RADIO_SERVICE_UUID) {
                            continue;
                        }
                        let id = PeripheralId::new(pid.to_string());
                        let name = props
                            .local_name
                            .unwrap_or_else(|| "unknown".to_string());
                        let rssi = props.rssi.unwrap_or(i16::MIN);
                        trace!(id = %id.short(), %name, rssi, "BLE advertisement");
                        let _ = events_tx
                            .send(TransportEvent::Discovered { id, name, rssi })
                            .await;
                    }
                    CentralEvent::DeviceDisconnected(pid) => {
                        let id = PeripheralId::new(pid.to_string());
                        debug!(id = %id.short(), "BLE device disconnected");
                        let _ = events_tx
                            .send(TransportEvent::LinkDropped {
                                id,
                                reason: "link closed by stack".to_string(),
                            })
                            .await;
                    }
                    _ => {}
                }
            }
            warn!("BLE central event stream ended");
        });

        Ok(())
    }

    /// Resolve a peripheral id to the platform handle
    async fn find_peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        let peripherals = self.adapter.peripherals().await?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())
            .ok_or_else(|| SessionError::PeripheralNotFound(id.to_string()))
    }

    /// Connect, discover services, and subscribe the FromRadio stream
    async fn establish(
        peripheral: &Peripheral,
        id: &PeripheralId,
        events_tx: &mpsc::Sender<TransportEvent>,
    ) -> Result<()> {
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let from_radio = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == FROM_RADIO_UUID)
            .ok_or_else(|| {
                SessionError::ConnectFailed("device has no FromRadio characteristic".to_string())
            })?;
        peripheral.subscribe(&from_radio).await?;

        let mut notifications = peripheral.notifications().await?;
        let tx = events_tx.clone();
        let notify_id = id.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != FROM_RADIO_UUID {
                    continue;
                }
                let event = TransportEvent::Notification {
                    id: notify_id.clone(),
                    payload: Bytes::from(notification.value),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!(id = %notify_id.short(), "Notification stream ended");
        });

        Ok(())
    }
}

#[async_trait::async_trait]
impl RadioTransport for BleTransport {
    async fn start_scan(&mut self) -> Result<()> {
        if self.scanning {
            return Ok(());
        }
        self.adapter
            .start_scan(ScanFilter {
                services: vec![RADIO_SERVICE_UUID],
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "BLE scan failed to start");
                SessionError::TransportUnavailable
            })?;
        self.scanning = true;
        info!("BLE scanning started");
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        if !self.scanning {
            return Ok(());
        }
        self.adapter.stop_scan().await?;
        self.scanning = false;
        info!("BLE scanning stopped");
        Ok(())
    }

    async fn connect(&mut self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.find_peripheral(id).await?;
        let events_tx = self.events_tx.clone();
        let id = id.clone();

        // Link establishment and service discovery can stall for seconds;
        // run them off the manager loop so its attempt timeout stays in
        // charge, and report the outcome as an event either way.
        tokio::spawn(async move {
            match Self::establish(&peripheral, &id, &events_tx).await {
                Ok(()) => {
                    info!(id = %id.short(), "BLE link established");
                    let _ = events_tx.send(TransportEvent::Connected { id }).await;
                }
                Err(e) => {
                    debug!(id = %id.short(), error = %e, "BLE connect failed");
                    let _ = events_tx
                        .send(TransportEvent::ConnectFailed {
                            id,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        });

        Ok(())
    }

    async fn disconnect(&mut self, id: &PeripheralId) -> Result<()> {
        match self.find_peripheral(id).await {
            Ok(peripheral) => {
                peripheral.disconnect().await?;
                info!(id = %id.short(), "BLE link released");
                Ok(())
            }
            // Already gone is as disconnected as it gets.
            Err(SessionError::PeripheralNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn write(&mut self, id: &PeripheralId, payload: &[u8]) -> Result<()> {
        let peripheral = self.find_peripheral(id).await?;
        let to_radio = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == TO_RADIO_UUID)
            .ok_or_else(|| {
                SessionError::WriteError("device has no ToRadio characteristic".to_string())
            })?;

        peripheral
            .write(&to_radio, payload, WriteType::WithResponse)
            .await
            .map_err(|e| SessionError::WriteError(e.to_string()))
    }

    fn name(&self) -> &str {
        "ble"
    }
}
