//! Integration tests for the session manager
//!
//! These tests drive the full manager loop against the emulated radio in
//! `test_utils`, covering:
//!
//! - Connect retry policy and the 10-attempt ceiling
//! - Handshake, subscription, and the firmware version gate
//! - Single-active-session discipline (disconnect before connect)
//! - Preferred-device auto-connect and reconnect
//! - Idempotent node-update sync and the region advisory

use std::time::Duration;

use meshlink_ble::test_utils::{DeviceProfile, MockRadio, MockRadioHandle, TransportOp};
use meshlink_ble::{
    ConnectionManager, ConnectionState, ManagerConfig, ManagerConfigBuilder, ManagerHandle,
    ManagerState, NodeUpdate, NodeUpdateBody, PeripheralId, PreferredDevice, RadioFrame,
    SessionError,
};
use meshlink_state::SqliteStore;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    handle: ManagerHandle,
    script: MockRadioHandle,
    store: SqliteStore,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn spawn_manager(profile: DeviceProfile, config: ManagerConfig) -> Harness {
    let store = SqliteStore::in_memory().await.unwrap();
    spawn_manager_with_store(profile, config, store).await
}

async fn spawn_manager_with_store(
    profile: DeviceProfile,
    config: ManagerConfig,
    store: SqliteStore,
) -> Harness {
    init_tracing();
    let (radio, events, script) = MockRadio::with_profile(profile);
    let (manager, handle) = ConnectionManager::new(radio, events, store.clone(), config);
    tokio::spawn(manager.run());
    Harness {
        handle,
        script,
        store,
    }
}

async fn wait_for(
    handle: &ManagerHandle,
    what: &str,
    pred: impl Fn(&ManagerState) -> bool,
) -> ManagerState {
    let mut watch = handle.watch();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            {
                let state = watch.borrow_and_update().clone();
                if pred(&state) {
                    return state;
                }
            }
            watch.changed().await.expect("manager stopped");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

fn fast_config() -> ManagerConfig {
    ManagerConfigBuilder::new()
        .attempt_timeout(Duration::from_millis(100))
        .handshake_step_timeout(Duration::from_millis(200))
        .reconnect_initial_delay(Duration::from_millis(50))
        .build()
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn scanner_tracks_visible_peripherals() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    h.handle.start_scanning().await.unwrap();

    let id = PeripheralId::new("AA:BB");
    h.script.advertise(&id, "Mesh-A1B2", -60).await;

    let state = wait_for(&h.handle, "peripheral visible", |s| {
        s.is_scanning && !s.visible.is_empty()
    })
    .await;
    assert_eq!(state.visible[0].name, "Mesh-A1B2");
    assert_eq!(state.visible[0].rssi, -60);
}

#[tokio::test]
async fn radio_off_yields_empty_set_not_error() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    h.handle.start_scanning().await.unwrap();

    let id = PeripheralId::new("AA:BB");
    h.script.advertise(&id, "Mesh-A1B2", -60).await;
    wait_for(&h.handle, "peripheral visible", |s| !s.visible.is_empty()).await;

    h.script.set_powered(false).await;
    let state = wait_for(&h.handle, "radio off", |s| !s.radio_available).await;
    assert!(state.visible.is_empty());

    // Powering back on resumes the requested scan
    h.script.set_powered(true).await;
    wait_for(&h.handle, "scan resumed", |s| {
        s.radio_available && s.is_scanning
    })
    .await;
}

// ============================================================================
// Connect + handshake
// ============================================================================

#[tokio::test]
async fn connect_reaches_subscribed_with_negotiated_identity() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    h.handle.start_scanning().await.unwrap();

    let id = PeripheralId::new("AA:BB");
    h.script.advertise(&id, "Mesh-A1B2", -60).await;
    wait_for(&h.handle, "peripheral visible", |s| !s.visible.is_empty()).await;

    h.handle.connect(id.clone()).await.unwrap();
    let state = wait_for(&h.handle, "subscribed", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;

    let session = state.session.expect("session present");
    assert!(session.is_subscribed);
    assert_eq!(session.node_num, Some(1234));
    assert_eq!(session.firmware.unwrap().to_string(), "2.3.2");
    assert!(session.last_error.is_none());

    // Scanning was stopped before the connect to keep the radio clear
    assert!(!state.is_scanning);
    let ops = h.script.ops();
    let stop = ops.iter().position(|op| *op == TransportOp::StopScan);
    let connect = ops
        .iter()
        .position(|op| *op == TransportOp::Connect(id.clone()));
    assert!(stop.unwrap() < connect.unwrap());

    // Negotiated identity was persisted
    let node = h.store.node(1234).await.unwrap().unwrap();
    assert_eq!(node.firmware.as_deref(), Some("2.3.2"));
}

#[tokio::test]
async fn attempt_counter_reaches_ceiling_then_failed() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    let id = PeripheralId::new("AA:BB");

    // Every connect call fails; the manager retries up to the ceiling
    h.script.fail_next_connects(100);
    h.handle.connect(id.clone()).await.unwrap();

    let state = wait_for(&h.handle, "failed", |s| {
        s.connection == ConnectionState::Failed
    })
    .await;

    let session = state.session.expect("session retained for observability");
    assert_eq!(session.attempt, 10);
    assert!(!session.is_subscribed);
    assert!(session.last_error.unwrap().contains("attempt 10 of 10"));

    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.connect_attempts, 10);
    assert_eq!(stats.connect_failures, 10);

    let connects = h
        .script
        .ops()
        .iter()
        .filter(|op| matches!(op, TransportOp::Connect(_)))
        .count();
    assert_eq!(connects, 10);
}

#[tokio::test]
async fn attempt_counter_is_observable_during_retries() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    let id = PeripheralId::new("AA:BB");

    h.script.fail_next_connects(3);
    h.handle.connect(id.clone()).await.unwrap();

    // After three scripted failures the fourth attempt succeeds; the
    // counter must have climbed to 4, never past it.
    let state = wait_for(&h.handle, "subscribed after retries", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;
    assert_eq!(state.session.unwrap().attempt, 4);

    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.connect_failures, 3);
    assert_eq!(stats.connect_attempts, 4);
}

// Real wall-clock: this flow drives a real SQLite-backed manager whose store
// operations complete on background threads, which tokio's `start_paused`
// virtual clock cannot observe as pending work (it would auto-advance past the
// handshake-step timeout before the manager runs). The fast_config timeouts are
// sub-second, so real time keeps the test quick and deterministic.
#[tokio::test]
async fn unresponsive_device_fails_handshake_step_timeout() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    let id = PeripheralId::new("AA:BB");

    // Link comes up but the device never answers the identity request
    h.script.mute_device(true);
    h.handle.connect(id.clone()).await.unwrap();

    let state = wait_for(&h.handle, "handshake abort", |s| {
        s.connection == ConnectionState::Disconnected && s.session.is_some()
    })
    .await;

    let session = state.session.unwrap();
    assert!(!session.is_subscribed);
    assert!(session.last_error.unwrap().contains("identity"));

    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.handshake_failures, 1);
    assert_eq!(stats.handshakes_completed, 0);
}

#[tokio::test]
async fn old_firmware_is_terminal_and_never_subscribes() {
    // Scenario: "Mesh-A1B2" at -60 dBm running 2.1.0, minimum is 2.3.0
    let profile = DeviceProfile {
        firmware: "2.1.0".to_string(),
        ..DeviceProfile::default()
    };
    let h = spawn_manager(profile, fast_config()).await;
    h.handle.start_scanning().await.unwrap();

    let id = PeripheralId::new("AA:BB");
    h.script.advertise(&id, "Mesh-A1B2", -60).await;
    wait_for(&h.handle, "peripheral visible", |s| !s.visible.is_empty()).await;

    h.handle.connect(id.clone()).await.unwrap();
    let state = wait_for(&h.handle, "failed", |s| {
        s.connection == ConnectionState::Failed
    })
    .await;

    let session = state.session.unwrap();
    assert!(!session.is_subscribed);
    let error = session.last_error.unwrap();
    assert!(error.contains("2.1.0"));
    assert!(error.contains("2.3.0"));

    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.incompatible_firmware, 1);
    assert_eq!(stats.handshakes_completed, 0);

    // The link was released, not silently retried
    let ops = h.script.ops();
    assert!(ops.contains(&TransportOp::Disconnect(id)));
    assert_eq!(
        ops.iter()
            .filter(|op| matches!(op, TransportOp::Connect(_)))
            .count(),
        1
    );
}

// ============================================================================
// Exclusivity
// ============================================================================

#[tokio::test]
async fn connecting_to_b_disconnects_a_first() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    let a = PeripheralId::new("AA:AA");
    let b = PeripheralId::new("BB:BB");

    h.handle.connect(a.clone()).await.unwrap();
    wait_for(&h.handle, "subscribed to A", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;

    h.handle.connect(b.clone()).await.unwrap();
    wait_for(&h.handle, "subscribed to B", |s| {
        s.connection == ConnectionState::Subscribed
            && s.session.as_ref().map(|sess| sess.peripheral_id.clone()) == Some(b.clone())
    })
    .await;

    let ops = h.script.ops();
    let disconnect_a = ops
        .iter()
        .position(|op| *op == TransportOp::Disconnect(a.clone()))
        .expect("A was disconnected");
    let connect_b = ops
        .iter()
        .position(|op| *op == TransportOp::Connect(b.clone()))
        .expect("B was connected");
    assert!(
        disconnect_a < connect_b,
        "disconnect(A) must come strictly before connect(B)"
    );
}

#[tokio::test]
async fn explicit_disconnect_releases_link_and_stays_down() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    let id = PeripheralId::new("AA:BB");

    h.handle.connect(id.clone()).await.unwrap();
    wait_for(&h.handle, "subscribed", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;

    h.handle.disconnect().await.unwrap();
    let state = wait_for(&h.handle, "disconnected", |s| {
        s.connection == ConnectionState::Disconnected
    })
    .await;
    assert!(!state.session.unwrap().is_subscribed);
    assert!(h.script.ops().contains(&TransportOp::Disconnect(id)));

    // Outbound calls are refused again
    let err = h.handle.send_text(None, "hello").await.unwrap_err();
    assert!(matches!(err, SessionError::NotSubscribed));
}

// ============================================================================
// Preferred device
// ============================================================================

#[tokio::test]
async fn preferred_device_auto_connects_at_startup() {
    // A previous run recorded ("AA:BB", node 1234); the process restarts
    let store = SqliteStore::in_memory().await.unwrap();
    store
        .set_preferred_device(&PreferredDevice::new(PeripheralId::new("AA:BB"), 1234))
        .await
        .unwrap();

    let h = spawn_manager_with_store(DeviceProfile::default(), fast_config(), store).await;
    h.handle.start_scanning().await.unwrap();

    // The device becomes visible; no user action follows
    let id = PeripheralId::new("AA:BB");
    h.script.advertise(&id, "Mesh-A1B2", -60).await;

    let state = wait_for(&h.handle, "auto-connected", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;
    assert_eq!(state.session.unwrap().peripheral_id, id);
}

#[tokio::test]
async fn non_preferred_devices_are_not_auto_connected() {
    let store = SqliteStore::in_memory().await.unwrap();
    store
        .set_preferred_device(&PreferredDevice::new(PeripheralId::new("AA:BB"), 1234))
        .await
        .unwrap();

    let h = spawn_manager_with_store(DeviceProfile::default(), fast_config(), store).await;
    h.handle.start_scanning().await.unwrap();

    let other = PeripheralId::new("CC:DD");
    h.script.advertise(&other, "Someone-Else", -50).await;
    let state = wait_for(&h.handle, "visible", |s| !s.visible.is_empty()).await;
    assert_eq!(state.connection, ConnectionState::Disconnected);
    assert!(state.session.is_none());
}

#[tokio::test(start_paused = true)]
async fn preferred_device_reconnects_after_link_drop() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    let id = PeripheralId::new("AA:BB");

    h.handle.connect(id.clone()).await.unwrap();
    wait_for(&h.handle, "subscribed", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;

    h.handle.mark_preferred(id.clone(), 1234).await.unwrap();
    assert!(h.handle.is_preferred(id.clone()).await.unwrap());

    h.script.drop_link(&id, "went out of range").await;
    wait_for(&h.handle, "reconnecting", |s| {
        matches!(
            s.connection,
            ConnectionState::Reconnecting | ConnectionState::Subscribed
        )
    })
    .await;

    // A fresh session comes back up without user action
    let state = wait_for(&h.handle, "resubscribed", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;
    assert!(state.session.unwrap().is_subscribed);

    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.link_drops, 1);
    assert_eq!(stats.handshakes_completed, 2);
}

#[tokio::test]
async fn unpreferred_link_drop_stays_disconnected() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    let id = PeripheralId::new("AA:BB");

    h.handle.connect(id.clone()).await.unwrap();
    wait_for(&h.handle, "subscribed", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;

    h.script.drop_link(&id, "went out of range").await;
    let state = wait_for(&h.handle, "disconnected", |s| {
        s.connection == ConnectionState::Disconnected
    })
    .await;

    let session = state.session.unwrap();
    assert!(!session.is_subscribed);
    assert!(session.last_error.unwrap().contains("Link dropped"));
}

#[tokio::test]
async fn clear_preferred_guards_against_unrelated_device() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    let preferred = PeripheralId::new("AA:BB");
    let other = PeripheralId::new("CC:DD");

    h.handle
        .mark_preferred(preferred.clone(), 1234)
        .await
        .unwrap();

    // Connected to a different device: the stored pair must survive
    h.handle.connect(other.clone()).await.unwrap();
    wait_for(&h.handle, "subscribed", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;

    assert!(!h.handle.clear_preferred().await.unwrap());
    assert!(h.handle.is_preferred(preferred.clone()).await.unwrap());

    // Connected to the preferred device: clearing works
    h.handle.connect(preferred.clone()).await.unwrap();
    wait_for(&h.handle, "subscribed to preferred", |s| {
        s.connection == ConnectionState::Subscribed
            && s.session.as_ref().map(|sess| sess.peripheral_id.clone())
                == Some(preferred.clone())
    })
    .await;

    assert!(h.handle.clear_preferred().await.unwrap());
    assert!(!h.handle.is_preferred(preferred).await.unwrap());
}

// ============================================================================
// Sync
// ============================================================================

#[tokio::test]
async fn node_updates_flow_into_the_store() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    let id = PeripheralId::new("AA:BB");

    h.handle.connect(id.clone()).await.unwrap();
    wait_for(&h.handle, "subscribed", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;

    h.script
        .notify_update(
            &id,
            NodeUpdate {
                num: 5678,
                seq: 1,
                body: NodeUpdateBody::Telemetry {
                    battery_level: 92,
                    channel_utilization: 8.5,
                    air_util_tx: 1.5,
                },
            },
        )
        .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(node) = h.store.node(5678).await.unwrap() {
                assert_eq!(node.battery_level, Some(92));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("update never applied");
}

#[tokio::test]
async fn duplicate_updates_do_not_touch_the_store_twice() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    let id = PeripheralId::new("AA:BB");

    h.handle.connect(id.clone()).await.unwrap();
    wait_for(&h.handle, "subscribed", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;

    let update = NodeUpdate {
        num: 5678,
        seq: 7,
        body: NodeUpdateBody::Telemetry {
            battery_level: 70,
            channel_utilization: 5.0,
            air_util_tx: 1.0,
        },
    };
    h.script.notify_update(&id, update.clone()).await;
    h.script.notify_update(&id, update).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = h.handle.stats().await.unwrap();
            if stats.updates_applied == 1 && stats.updates_ignored == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("duplicate was not deduplicated");
}

#[tokio::test]
async fn outbound_text_reaches_the_device_once_subscribed() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    let id = PeripheralId::new("AA:BB");

    h.handle.connect(id.clone()).await.unwrap();
    wait_for(&h.handle, "subscribed", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;

    h.handle.send_text(Some(5678), "camp at the ridge").await.unwrap();

    let texts: Vec<_> = h
        .script
        .written_frames()
        .into_iter()
        .filter(|f| matches!(f, RadioFrame::Text { .. }))
        .collect();
    assert_eq!(texts.len(), 1);
    match &texts[0] {
        RadioFrame::Text { to, body, .. } => {
            assert_eq!(*to, 5678);
            assert_eq!(body, "camp at the ridge");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn region_unset_surfaces_as_advisory() {
    let profile = DeviceProfile {
        region: 0,
        ..DeviceProfile::default()
    };
    let h = spawn_manager(profile, fast_config()).await;
    let id = PeripheralId::new("AA:BB");

    h.handle.connect(id.clone()).await.unwrap();
    let state = wait_for(&h.handle, "subscribed", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;

    // Advisory, not an error: the session is healthy
    assert!(state.region_unset);
    assert!(state.session.as_ref().unwrap().last_error.is_none());

    // The user sets a region on the device; the advisory clears
    h.script
        .notify_update(
            &id,
            NodeUpdate {
                num: 1234,
                seq: 1,
                body: NodeUpdateBody::Config { region: 3 },
            },
        )
        .await;
    wait_for(&h.handle, "advisory cleared", |s| !s.region_unset).await;
}

// ============================================================================
// Radio power during a session
// ============================================================================

#[tokio::test]
async fn radio_power_loss_tears_down_the_session() {
    let h = spawn_manager(DeviceProfile::default(), fast_config()).await;
    let id = PeripheralId::new("AA:BB");

    h.handle.connect(id.clone()).await.unwrap();
    wait_for(&h.handle, "subscribed", |s| {
        s.connection == ConnectionState::Subscribed
    })
    .await;

    h.script.set_powered(false).await;
    let state = wait_for(&h.handle, "torn down", |s| {
        s.connection == ConnectionState::Disconnected
    })
    .await;

    let session = state.session.unwrap();
    assert!(!session.is_subscribed);
    assert!(session
        .last_error
        .unwrap()
        .contains("Transport unavailable"));
}
