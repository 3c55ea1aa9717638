//! ConnectionManager - the session state machine service
//!
//! This module provides the main service owning the lifecycle of the single
//! active radio connection. It handles:
//!
//! - Discovery bookkeeping (via [`Scanner`])
//! - Connect attempts with a 10-attempt ceiling and per-attempt timeout
//! - The session handshake (via [`Negotiator`])
//! - Bidirectional sync once subscribed (via [`SyncBridge`])
//! - Preferred-device auto-connect and reconnect (via [`policy`])
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     ConnectionManager                         │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  ┌────────────┐    ┌───────────────┐    ┌────────────────┐    │
//! │  │ Transport  │───►│ Event loop    │◄───│ ManagerHandle  │    │
//! │  │ events rx  │    │               │    │ (commands)     │    │
//! │  └────────────┘    │ Scanner       │    └────────────────┘    │
//! │                    │ Negotiator    │    ┌────────────────┐    │
//! │                    │ SyncBridge    │───►│ watch<State>   │    │
//! │                    │ Policy        │    └────────────────┘    │
//! │                    └───────────────┘                          │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every transport callback and consumer command funnels through one
//! `tokio::select!` loop, so session state never races. Consumers observe
//! the [`ManagerState`] snapshot on a watch channel; errors surface there
//! (`session.last_error` + `connection`), never as panics or exceptions
//! across the boundary.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshlink_ble::{ConnectionManager, ManagerConfig};
//! use meshlink_ble::test_utils::MockRadio;
//! use meshlink_state::SqliteStore;
//!
//! let store = SqliteStore::in_memory().await?;
//! let (radio, events, _script) = MockRadio::new();
//! let (manager, handle) = ConnectionManager::new(radio, events, store, ManagerConfig::default());
//! tokio::spawn(manager.run());
//!
//! handle.start_scanning().await?;
//! ```

use chrono::Utc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use meshlink_core::{
    ConnectionState, DiscoveredPeripheral, LinkState, PeripheralId, PreferredDevice, Session,
};
use meshlink_state::SqliteStore;

use crate::config::ManagerConfig;
use crate::error::{Result, SessionError};
use crate::handshake::{Negotiator, Progress};
use crate::policy::{should_reconnect, PreferredDevicePolicy};
use crate::protocol::{FrameReader, RadioFrame};
use crate::scanner::Scanner;
use crate::sync::SyncBridge;
use crate::transport::{RadioTransport, TransportEvent};

/// Housekeeping cadence (stale-peripheral expiry)
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

/// Command channel depth
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Commands that can be sent to the manager
#[derive(Debug)]
pub enum ManagerCommand {
    /// Begin discovery (idempotent)
    StartScanning,
    /// Halt discovery
    StopScanning,
    /// Connect to a peripheral, tearing down any active session first
    Connect(PeripheralId),
    /// Disconnect the active session, canceling any in-flight handshake
    Disconnect,
    /// Persist a preferred device pair
    MarkPreferred {
        /// Peripheral to prefer
        id: PeripheralId,
        /// Node number associated with it
        node_num: u32,
        /// Completion reply
        reply: oneshot::Sender<Result<()>>,
    },
    /// Clear the preference if it names the currently connected device
    ClearPreferred {
        /// Replies with whether the preference was cleared
        reply: oneshot::Sender<Result<bool>>,
    },
    /// Pure preference lookup
    IsPreferred {
        /// Peripheral to check
        id: PeripheralId,
        /// Lookup reply
        reply: oneshot::Sender<Result<bool>>,
    },
    /// Persist the auto-reconnect flag
    SetAutoReconnect {
        /// New flag value
        enabled: bool,
        /// Completion reply
        reply: oneshot::Sender<Result<()>>,
    },
    /// Send a text message (requires `Subscribed`)
    SendText {
        /// Destination node, broadcast when `None`
        to: Option<u32>,
        /// Message body
        body: String,
        /// Completion reply
        reply: oneshot::Sender<Result<()>>,
    },
    /// Ask the radio to re-send configuration (requires `Subscribed`)
    RequestConfig {
        /// Completion reply
        reply: oneshot::Sender<Result<()>>,
    },
    /// Get operation counters
    GetStats {
        /// Stats reply
        reply: oneshot::Sender<ManagerStats>,
    },
    /// Stop the manager
    Shutdown,
}

/// Operation counters, retrievable through the handle
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    /// Transport connect calls issued
    pub connect_attempts: u64,
    /// Connect attempts that failed or timed out
    pub connect_failures: u64,
    /// Handshakes that reached `Subscribed`
    pub handshakes_completed: u64,
    /// Handshakes aborted by step failure or timeout
    pub handshake_failures: u64,
    /// Devices rejected for old firmware
    pub incompatible_firmware: u64,
    /// Established links that dropped
    pub link_drops: u64,
    /// Node updates applied to the store
    pub updates_applied: u64,
    /// Node updates dropped as duplicates
    pub updates_ignored: u64,
}

/// Consumer-observable snapshot, published on a watch channel.
/// Read-only for consumers; only the manager mutates it.
#[derive(Debug, Clone)]
pub struct ManagerState {
    /// Whether discovery is running
    pub is_scanning: bool,
    /// Whether the radio adapter is usable (false = "radio off")
    pub radio_available: bool,
    /// Peripherals currently visible, strongest signal first
    pub visible: Vec<DiscoveredPeripheral>,
    /// Connection lifecycle state
    pub connection: ConnectionState,
    /// The active (or most recent) session
    pub session: Option<Session>,
    /// Advisory: the connected radio has no LoRa region configured
    pub region_unset: bool,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            is_scanning: false,
            radio_available: true,
            visible: Vec::new(),
            connection: ConnectionState::Disconnected,
            session: None,
            region_unset: false,
        }
    }
}

/// Handle for controlling a running [`ConnectionManager`]
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<ManagerCommand>,
    state_rx: watch::Receiver<ManagerState>,
}

impl ManagerHandle {
    /// Begin discovery. Idempotent while already scanning.
    pub async fn start_scanning(&self) -> Result<()> {
        Ok(self.commands.send(ManagerCommand::StartScanning).await?)
    }

    /// Halt discovery, releasing the radio.
    pub async fn stop_scanning(&self) -> Result<()> {
        Ok(self.commands.send(ManagerCommand::StopScanning).await?)
    }

    /// Connect to a peripheral. Outcome surfaces through the state snapshot.
    pub async fn connect(&self, id: PeripheralId) -> Result<()> {
        Ok(self.commands.send(ManagerCommand::Connect(id)).await?)
    }

    /// Disconnect the active session.
    pub async fn disconnect(&self) -> Result<()> {
        Ok(self.commands.send(ManagerCommand::Disconnect).await?)
    }

    /// Persist a preferred device pair, replacing any prior pair.
    pub async fn mark_preferred(&self, id: PeripheralId, node_num: u32) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ManagerCommand::MarkPreferred {
                id,
                node_num,
                reply,
            })
            .await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Clear the preference if it names the currently connected device.
    /// Returns whether it was cleared.
    pub async fn clear_preferred(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ManagerCommand::ClearPreferred { reply })
            .await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Whether the given peripheral is the stored preferred device.
    pub async fn is_preferred(&self, id: PeripheralId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ManagerCommand::IsPreferred { id, reply })
            .await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Persist the auto-reconnect flag.
    pub async fn set_auto_reconnect(&self, enabled: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ManagerCommand::SetAutoReconnect { enabled, reply })
            .await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Send a text message. Fails with [`SessionError::NotSubscribed`]
    /// unless the session is subscribed.
    pub async fn send_text(&self, to: Option<u32>, body: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ManagerCommand::SendText {
                to,
                body: body.into(),
                reply,
            })
            .await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Ask the radio to re-send configuration state. Fails with
    /// [`SessionError::NotSubscribed`] unless the session is subscribed.
    pub async fn request_config(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ManagerCommand::RequestConfig { reply })
            .await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Get operation counters.
    pub async fn stats(&self) -> Result<ManagerStats> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ManagerCommand::GetStats { reply })
            .await?;
        rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    /// Stop the manager.
    pub async fn shutdown(&self) -> Result<()> {
        Ok(self.commands.send(ManagerCommand::Shutdown).await?)
    }

    /// Current state snapshot.
    pub fn state(&self) -> ManagerState {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to state snapshots.
    pub fn watch(&self) -> watch::Receiver<ManagerState> {
        self.state_rx.clone()
    }
}

/// The session state machine service
pub struct ConnectionManager<T: RadioTransport> {
    transport: T,
    events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<ManagerCommand>,
    state_tx: watch::Sender<ManagerState>,
    config: ManagerConfig,
    scanner: Scanner,
    policy: PreferredDevicePolicy,
    sync: SyncBridge,
    reader: FrameReader,

    connection: ConnectionState,
    session: Option<Session>,
    negotiator: Option<Negotiator>,

    connect_deadline: Option<Instant>,
    handshake_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,

    /// Cached preference state, kept in step with the store
    preferred: Option<PreferredDevice>,
    auto_reconnect: bool,
    /// Consumer asked for scanning; resume it when the radio powers back on
    scan_requested: bool,

    stats: ManagerStats,
}

impl<T: RadioTransport> ConnectionManager<T> {
    /// Create a manager over a transport and its event channel
    pub fn new(
        transport: T,
        events: mpsc::Receiver<TransportEvent>,
        store: SqliteStore,
        config: ManagerConfig,
    ) -> (Self, ManagerHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(ManagerState::default());

        let handle = ManagerHandle {
            commands: command_tx,
            state_rx,
        };

        let manager = Self {
            transport,
            events,
            commands: command_rx,
            state_tx,
            scanner: Scanner::new(config.scan.stale_after),
            policy: PreferredDevicePolicy::new(store.clone()),
            sync: SyncBridge::new(store),
            reader: FrameReader::new(),
            config,
            connection: ConnectionState::Disconnected,
            session: None,
            negotiator: None,
            connect_deadline: None,
            handshake_deadline: None,
            reconnect_at: None,
            preferred: None,
            auto_reconnect: true,
            scan_requested: false,
            stats: ManagerStats::default(),
        };

        (manager, handle)
    }

    /// Run the manager service until shutdown
    pub async fn run(mut self) -> Result<()> {
        info!(transport = self.transport.name(), "Starting connection manager");

        // Load persisted preference state once; commands keep the cache fresh.
        self.preferred = self.policy.preferred().await?;
        self.auto_reconnect = self.policy.auto_reconnect_enabled().await?;
        self.publish();

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                Some(event) = self.events.recv() => {
                    self.on_transport_event(event).await;
                }

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.on_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    self.on_deadline().await;
                }

                _ = tokio::time::sleep(HOUSEKEEPING_INTERVAL) => {
                    self.scanner.expire_stale(Utc::now());
                    self.publish();
                }
            }
        }

        // Release transport resources on the way out
        if let Some(session) = &self.session {
            if self.connection.is_active() {
                let id = session.peripheral_id.clone();
                let _ = self.transport.disconnect(&id).await;
            }
        }
        if self.scanner.is_scanning() {
            let _ = self.transport.stop_scan().await;
        }

        info!("Connection manager stopped");
        Ok(())
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::AdapterStateChanged { powered } => {
                self.on_adapter_state(powered).await;
            }
            TransportEvent::Discovered { id, name, rssi } => {
                self.scanner.discovered(id.clone(), name, rssi);
                self.maybe_auto_connect(&id).await;
            }
            TransportEvent::RssiUpdated { id, rssi } => {
                self.scanner.rssi_updated(&id, rssi);
            }
            TransportEvent::PeripheralLost { id } => {
                self.scanner.lost(&id);
            }
            TransportEvent::Connected { id } => {
                self.on_connected(id).await;
            }
            TransportEvent::ConnectFailed { id, reason } => {
                if self.is_current(&id) {
                    self.on_connect_failure(reason).await;
                }
            }
            TransportEvent::LinkDropped { id, reason } => {
                self.on_link_dropped(id, reason).await;
            }
            TransportEvent::Notification { id, payload } => {
                if self.is_current(&id) {
                    self.on_notification(&payload).await;
                }
            }
        }
        self.publish();
    }

    async fn on_adapter_state(&mut self, powered: bool) {
        self.scanner.adapter_state_changed(powered);

        if !powered {
            warn!("Radio adapter powered off");
            if let Some(session) = self.session.as_mut() {
                if self.connection.is_active() {
                    session.is_subscribed = false;
                    session.note_error(SessionError::TransportUnavailable.to_string());
                    self.connection = ConnectionState::Disconnected;
                    self.clear_in_flight();
                    self.sync.session_ended();
                }
            }
        } else {
            info!("Radio adapter powered on");
            // TransportUnavailable auto-clears; resume a requested scan.
            if self.scan_requested && !self.scanner.is_scanning() {
                if self.transport.start_scan().await.is_ok() {
                    self.scanner.scanning_started();
                }
            }
        }
    }

    /// Auto-connect to the preferred device when it becomes visible.
    ///
    /// Runs only from a cold `Disconnected` state with no prior session, so
    /// an explicit disconnect in this process keeps the radio released.
    async fn maybe_auto_connect(&mut self, id: &PeripheralId) {
        if self.connection != ConnectionState::Disconnected || self.session.is_some() {
            return;
        }
        if !self.auto_reconnect {
            return;
        }
        let preferred = match &self.preferred {
            Some(p) if p.matches(id) => p.clone(),
            _ => return,
        };

        info!(
            id = %preferred.peripheral_id.short(),
            node = preferred.node_num,
            "Preferred device visible, auto-connecting"
        );
        self.start_connect(id.clone(), false).await;
    }

    async fn on_connected(&mut self, id: PeripheralId) {
        if !self.is_current(&id)
            || !matches!(
                self.connection,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            )
        {
            debug!(id = %id.short(), "Ignoring connect completion for stale target");
            return;
        }

        info!(id = %id.short(), "Transport link established");
        self.connection = ConnectionState::Connected;
        self.connect_deadline = None;
        self.reconnect_at = None;
        self.scanner.set_link_state(&id, LinkState::Connected);
        self.reader.clear();

        // Transport is up; negotiate the session.
        let (negotiator, first) = Negotiator::start();
        self.negotiator = Some(negotiator);
        self.send_handshake_frame(first).await;
    }

    async fn on_connect_failure(&mut self, reason: String) {
        self.stats.connect_failures += 1;
        self.connect_deadline = None;

        let max_attempts = self.config.connect.max_attempts;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.note_error(reason.as_str());

        if session.attempt >= max_attempts {
            warn!(
                id = %session.peripheral_id.short(),
                attempts = session.attempt,
                "Connect attempt ceiling reached"
            );
            let error = SessionError::ConnectTimeout {
                attempt: session.attempt,
                max_attempts,
            };
            session.note_error(error.to_string());
            let id = session.peripheral_id.clone();
            self.connection = ConnectionState::Failed;
            self.clear_in_flight();
            let _ = self.transport.disconnect(&id).await;
            self.scanner.set_link_state(&id, LinkState::Disconnected);
        } else {
            session.attempt += 1;
            debug!(
                id = %session.peripheral_id.short(),
                attempt = session.attempt,
                max_attempts,
                "Retrying connect"
            );
            self.begin_attempt().await;
        }
    }

    async fn on_link_dropped(&mut self, id: PeripheralId, reason: String) {
        if !self.is_current(&id) || !self.connection.is_active() {
            return;
        }

        warn!(id = %id.short(), %reason, "Link dropped");
        self.stats.link_drops += 1;
        self.clear_in_flight();
        self.sync.session_ended();
        self.scanner.set_link_state(&id, LinkState::Disconnected);

        if should_reconnect(&id, self.preferred.as_ref(), self.auto_reconnect) {
            info!(id = %id.short(), "Preferred device dropped, scheduling reconnect");
            let name = self
                .session
                .as_ref()
                .map(|s| s.name.clone())
                .unwrap_or_default();
            // The old session is gone; reconnection gets a fresh one.
            let mut session = Session::new(id, name);
            session.note_error(SessionError::LinkDropped(reason).to_string());
            self.session = Some(session);
            self.connection = ConnectionState::Reconnecting;
            self.reconnect_at =
                Some(Instant::now() + self.config.reconnect.initial_delay);
        } else {
            if let Some(session) = self.session.as_mut() {
                session.is_subscribed = false;
                session.note_error(SessionError::LinkDropped(reason).to_string());
            }
            self.connection = ConnectionState::Disconnected;
        }
    }

    async fn on_notification(&mut self, payload: &[u8]) {
        self.reader.extend(payload);

        loop {
            let frame_payload = match self.reader.next_frame() {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Corrupt frame in notification stream");
                    if self.negotiator.is_some() {
                        self.fail_handshake(SessionError::HandshakeFailure {
                            step: self.handshake_step_name(),
                            reason: "malformed response".to_string(),
                        })
                        .await;
                        return;
                    }
                    continue;
                }
            };

            let frame = match RadioFrame::decode(&frame_payload) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Undecodable frame");
                    if self.negotiator.is_some() {
                        self.fail_handshake(SessionError::HandshakeFailure {
                            step: self.handshake_step_name(),
                            reason: e.to_string(),
                        })
                        .await;
                        return;
                    }
                    continue;
                }
            };

            self.on_frame(frame).await;
            if self.connection == ConnectionState::Failed {
                return;
            }
        }
    }

    async fn on_frame(&mut self, frame: RadioFrame) {
        if let Some(negotiator) = self.negotiator.as_mut() {
            match negotiator.on_frame(&frame) {
                Ok(Progress::Send(next)) => {
                    self.send_handshake_frame(next).await;
                }
                Ok(Progress::Complete(negotiated)) => {
                    self.negotiator = None;
                    self.handshake_deadline = None;
                    self.stats.handshakes_completed += 1;

                    if let Some(session) = self.session.as_mut() {
                        session.node_num = Some(negotiated.node_num);
                        session.firmware = Some(negotiated.firmware);
                        session.protocol_version = Some(negotiated.protocol_version);
                        // The handshake is the only path that sets this.
                        session.is_subscribed = true;
                        session.last_error = None;
                    }
                    self.connection = ConnectionState::Subscribed;

                    if let Err(e) = self
                        .sync
                        .session_started(
                            negotiated.node_num,
                            &negotiated.firmware,
                            negotiated.region,
                        )
                        .await
                    {
                        warn!(error = %e, "Failed to persist negotiated identity");
                    }

                    self.refresh_preferred_node(negotiated.node_num).await;
                }
                Ok(Progress::Ignored) => {}
                Err(e) => {
                    self.fail_handshake(e).await;
                }
            }
            return;
        }

        if self.connection == ConnectionState::Subscribed {
            match frame {
                RadioFrame::NodeUpdate(update) => {
                    if let Err(e) = self.sync.apply(&update).await {
                        warn!(error = %e, node = update.num, "Failed to apply node update");
                    }
                }
                other => {
                    trace!(frame = ?other, "Ignoring non-update frame while subscribed");
                }
            }
        } else {
            trace!(frame = ?frame, "Dropping frame outside session");
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Returns false when the manager should stop
    async fn on_command(&mut self, command: ManagerCommand) -> bool {
        match command {
            ManagerCommand::StartScanning => {
                self.scan_requested = true;
                if self.scanner.radio_available() && !self.scanner.is_scanning() {
                    match self.transport.start_scan().await {
                        Ok(()) => self.scanner.scanning_started(),
                        Err(e) => warn!(error = %e, "Failed to start scanning"),
                    }
                }
            }
            ManagerCommand::StopScanning => {
                self.scan_requested = false;
                if self.scanner.is_scanning() {
                    if let Err(e) = self.transport.stop_scan().await {
                        warn!(error = %e, "Failed to stop scanning");
                    }
                    self.scanner.scanning_stopped();
                }
            }
            ManagerCommand::Connect(id) => {
                self.start_connect(id, false).await;
            }
            ManagerCommand::Disconnect => {
                self.explicit_disconnect().await;
            }
            ManagerCommand::MarkPreferred {
                id,
                node_num,
                reply,
            } => {
                let result = self.policy.mark_preferred(id.clone(), node_num).await;
                if result.is_ok() {
                    self.preferred = Some(PreferredDevice::new(id, node_num));
                }
                let _ = reply.send(result);
            }
            ManagerCommand::ClearPreferred { reply } => {
                let result = self.clear_preferred_guarded().await;
                let _ = reply.send(result);
            }
            ManagerCommand::IsPreferred { id, reply } => {
                let _ = reply.send(self.policy.is_preferred(&id).await);
            }
            ManagerCommand::SetAutoReconnect { enabled, reply } => {
                let result = self.policy.set_auto_reconnect(enabled).await;
                if result.is_ok() {
                    self.auto_reconnect = enabled;
                }
                let _ = reply.send(result);
            }
            ManagerCommand::SendText { to, body, reply } => {
                let frame = RadioFrame::Text {
                    packet_id: rand::random(),
                    to: to.unwrap_or(0xFFFFFFFF),
                    body,
                };
                let _ = reply.send(self.send_outbound(frame).await);
            }
            ManagerCommand::RequestConfig { reply } => {
                let _ = reply.send(self.send_outbound(RadioFrame::ConfigRequest).await);
            }
            ManagerCommand::GetStats { reply } => {
                let mut stats = self.stats.clone();
                stats.updates_applied = self.sync.applied_count();
                stats.updates_ignored = self.sync.ignored_count();
                let _ = reply.send(stats);
            }
            ManagerCommand::Shutdown => {
                info!("Shutdown requested");
                return false;
            }
        }
        self.publish();
        true
    }

    /// Outbound calls are refused until the session is subscribed.
    async fn send_outbound(&mut self, frame: RadioFrame) -> Result<()> {
        if self.connection != ConnectionState::Subscribed {
            return Err(SessionError::NotSubscribed);
        }
        let id = match &self.session {
            Some(session) => session.peripheral_id.clone(),
            None => return Err(SessionError::NotSubscribed),
        };
        let encoded = frame.encode()?;
        self.transport.write(&id, &encoded).await
    }

    async fn clear_preferred_guarded(&mut self) -> Result<bool> {
        let connected = match (&self.session, self.connection.is_linked()) {
            (Some(session), true) => session.peripheral_id.clone(),
            _ => return Ok(false),
        };
        let cleared = self.policy.clear_preferred(&connected).await?;
        if cleared {
            self.preferred = None;
        }
        Ok(cleared)
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    async fn start_connect(&mut self, id: PeripheralId, reconnecting: bool) {
        // Exclusivity: tear down the active link before touching the new one.
        if let Some(current) = &self.session {
            if self.connection.is_active() {
                let current_id = current.peripheral_id.clone();
                debug!(id = %current_id.short(), "Disconnecting before new connect");
                let _ = self.transport.disconnect(&current_id).await;
                self.scanner
                    .set_link_state(&current_id, LinkState::Disconnected);
            }
        }
        self.clear_in_flight();
        self.sync.session_ended();

        // Scanning interferes with connection traffic; stop it first.
        if self.scanner.is_scanning() {
            if let Err(e) = self.transport.stop_scan().await {
                warn!(error = %e, "Failed to stop scanning before connect");
            }
            self.scanner.scanning_stopped();
            self.scan_requested = false;
        }

        let name = self
            .scanner
            .name_of(&id)
            .unwrap_or("unknown")
            .to_string();
        self.session = Some(Session::new(id.clone(), name));
        self.connection = if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        self.scanner.set_link_state(&id, LinkState::Connecting);
        self.begin_attempt().await;
    }

    /// Issue the transport connect for the current session target and arm
    /// the attempt timeout. A transport-level error is left to the timeout
    /// path so every failure goes through the same counter.
    async fn begin_attempt(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let id = session.peripheral_id.clone();
        self.stats.connect_attempts += 1;
        self.connect_deadline = Some(Instant::now() + self.config.connect.attempt_timeout);

        if let Err(e) = self.transport.connect(&id).await {
            warn!(id = %id.short(), error = %e, "Transport connect call failed");
            if let Some(session) = self.session.as_mut() {
                session.note_error(e.to_string());
            }
        }
    }

    async fn explicit_disconnect(&mut self) {
        let Some(session) = self.session.as_mut() else {
            self.connection = ConnectionState::Disconnected;
            return;
        };

        info!(id = %session.peripheral_id.short(), "Disconnect requested");
        session.is_subscribed = false;
        let id = session.peripheral_id.clone();

        // Cancel any in-flight handshake before releasing the link.
        self.clear_in_flight();
        self.sync.session_ended();
        let _ = self.transport.disconnect(&id).await;
        self.scanner.set_link_state(&id, LinkState::Disconnected);
        self.connection = ConnectionState::Disconnected;
    }

    async fn fail_handshake(&mut self, error: SessionError) {
        let id = self.session.as_ref().map(|s| s.peripheral_id.clone());
        self.clear_in_flight();
        self.sync.session_ended();

        if error.is_terminal() {
            // Incompatible firmware: terminal for this device, surfaced for
            // explicit user acknowledgment rather than silent retry.
            warn!(error = %error, "Handshake rejected device");
            self.stats.incompatible_firmware += 1;
            self.connection = ConnectionState::Failed;
        } else {
            warn!(error = %error, "Handshake failed");
            self.stats.handshake_failures += 1;
            self.connection = ConnectionState::Disconnected;
        }

        if let Some(session) = self.session.as_mut() {
            session.is_subscribed = false;
            session.note_error(error.to_string());
        }

        if let Some(id) = id {
            let _ = self.transport.disconnect(&id).await;
            self.scanner.set_link_state(&id, LinkState::Disconnected);
        }
    }

    async fn send_handshake_frame(&mut self, frame: RadioFrame) {
        let Some(session) = &self.session else {
            return;
        };
        let id = session.peripheral_id.clone();
        self.handshake_deadline = Some(Instant::now() + self.config.handshake.step_timeout);

        let write = match frame.encode() {
            Ok(encoded) => self.transport.write(&id, &encoded).await,
            Err(e) => Err(e),
        };
        if let Err(e) = write {
            self.fail_handshake(SessionError::HandshakeFailure {
                step: self.handshake_step_name(),
                reason: e.to_string(),
            })
            .await;
        }
    }

    fn handshake_step_name(&self) -> &'static str {
        self.negotiator
            .as_ref()
            .map(|n| n.step().as_str())
            .unwrap_or("handshake")
    }

    /// If the connected device is the preferred one, keep the stored node
    /// number in step with what the radio reports.
    async fn refresh_preferred_node(&mut self, node_num: u32) {
        let Some(session) = &self.session else {
            return;
        };
        let Some(preferred) = &self.preferred else {
            return;
        };
        if preferred.matches(&session.peripheral_id) && preferred.node_num != node_num {
            let id = session.peripheral_id.clone();
            if self.policy.mark_preferred(id.clone(), node_num).await.is_ok() {
                self.preferred = Some(PreferredDevice::new(id, node_num));
            }
        }
    }

    // ========================================================================
    // Timeouts
    // ========================================================================

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.connect_deadline,
            self.handshake_deadline,
            self.reconnect_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();

        if self.connect_deadline.is_some_and(|d| d <= now) {
            debug!("Connect attempt timed out");
            self.on_connect_failure("attempt timeout".to_string()).await;
        } else if self.handshake_deadline.is_some_and(|d| d <= now) {
            self.fail_handshake(SessionError::HandshakeFailure {
                step: self.handshake_step_name(),
                reason: "step timeout".to_string(),
            })
            .await;
        } else if self.reconnect_at.is_some_and(|d| d <= now) {
            self.reconnect_at = None;
            if self.connection == ConnectionState::Reconnecting {
                debug!("Reconnect delay elapsed, attempting connect");
                self.begin_attempt().await;
            }
        }

        self.publish();
    }

    fn clear_in_flight(&mut self) {
        self.negotiator = None;
        self.connect_deadline = None;
        self.handshake_deadline = None;
        self.reconnect_at = None;
        self.reader.clear();
    }

    // ========================================================================
    // Observable state
    // ========================================================================

    fn is_current(&self, id: &PeripheralId) -> bool {
        self.session
            .as_ref()
            .map(|s| &s.peripheral_id == id)
            .unwrap_or(false)
    }

    fn publish(&self) {
        let state = ManagerState {
            is_scanning: self.scanner.is_scanning(),
            radio_available: self.scanner.radio_available(),
            visible: self.scanner.visible(),
            connection: self.connection,
            session: self.session.clone(),
            region_unset: self.sync.region_unset(),
        };
        self.state_tx.send_replace(state);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
