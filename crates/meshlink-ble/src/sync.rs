//! Sync bridge between the notification stream and the node store
//!
//! Once a session is subscribed, every inbound [`NodeUpdate`] is applied to
//! the persistent store as an idempotent upsert keyed by
//! `(node number, update kind, sequence)`. Duplicates and out-of-order
//! replays are dropped by two guards:
//!
//! - an LRU cache of recently applied keys (fast path)
//! - the store's last-applied sequence per `(node, kind)` (survives restarts)
//!
//! The bridge also watches the connected node's configuration for the
//! region-unset anomaly and surfaces it as an advisory flag, not an error.

use lru::LruCache;
use std::num::NonZeroUsize;
use tracing::{debug, trace, warn};

use chrono::Utc;
use meshlink_core::{FirmwareVersion, NodeSnapshot, NodeUpdateKind};
use meshlink_state::SqliteStore;

use crate::error::Result;
use crate::protocol::{NodeUpdate, NodeUpdateBody};

/// Number of recently applied update keys kept in memory
const DEDUP_CACHE_SIZE: usize = 1024;

/// Result of applying one inbound update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update changed the store
    Applied,
    /// Already applied (or older than what is applied); store untouched
    Duplicate,
}

/// Applies inbound node updates to the persistent store
#[derive(Debug)]
pub struct SyncBridge {
    store: SqliteStore,
    dedup: LruCache<(u32, NodeUpdateKind, u32), ()>,
    connected_node: Option<u32>,
    region_unset: bool,
    applied: u64,
    ignored: u64,
}

impl SyncBridge {
    /// Create a bridge over the given store
    pub fn new(store: SqliteStore) -> Self {
        let cap = NonZeroUsize::new(DEDUP_CACHE_SIZE.max(1)).unwrap();
        Self {
            store,
            dedup: LruCache::new(cap),
            connected_node: None,
            region_unset: false,
            applied: 0,
            ignored: 0,
        }
    }

    /// Record the outcome of a completed handshake: persist what the radio
    /// reported about itself and arm the region advisory for this node.
    pub async fn session_started(
        &mut self,
        node_num: u32,
        firmware: &FirmwareVersion,
        region: u16,
    ) -> Result<()> {
        self.connected_node = Some(node_num);
        self.region_unset = region == 0;

        let mut snapshot = self
            .store
            .node(node_num)
            .await?
            .unwrap_or_else(|| NodeSnapshot::new(node_num));
        snapshot.firmware = Some(firmware.to_string());
        snapshot.region = Some(region);
        snapshot.last_heard = Some(Utc::now());
        self.store.upsert_node(&snapshot).await?;

        if self.region_unset {
            warn!(node = node_num, "Connected radio has no region configured");
        }
        Ok(())
    }

    /// Forget the connected node (session torn down)
    pub fn session_ended(&mut self) {
        self.connected_node = None;
        self.region_unset = false;
    }

    /// Whether the connected node's LoRa region is unset (advisory)
    pub fn region_unset(&self) -> bool {
        self.region_unset
    }

    /// Updates applied to the store
    pub fn applied_count(&self) -> u64 {
        self.applied
    }

    /// Updates dropped as duplicates or stale replays
    pub fn ignored_count(&self) -> u64 {
        self.ignored
    }

    /// Apply one inbound update idempotently
    pub async fn apply(&mut self, update: &NodeUpdate) -> Result<ApplyOutcome> {
        let kind = update.kind();
        let key = (update.num, kind, update.seq);

        if self.dedup.contains(&key) {
            trace!(node = update.num, %kind, seq = update.seq, "Duplicate update (cached)");
            self.ignored += 1;
            return Ok(ApplyOutcome::Duplicate);
        }

        if let Some(last) = self.store.last_applied(update.num, kind).await? {
            if update.seq <= last {
                debug!(
                    node = update.num,
                    %kind,
                    seq = update.seq,
                    last,
                    "Dropping stale or replayed update"
                );
                self.dedup.put(key, ());
                self.ignored += 1;
                return Ok(ApplyOutcome::Duplicate);
            }
        }

        let mut snapshot = self
            .store
            .node(update.num)
            .await?
            .unwrap_or_else(|| NodeSnapshot::new(update.num));
        self.merge(&mut snapshot, &update.body);
        snapshot.last_heard = Some(Utc::now());

        self.store.upsert_node(&snapshot).await?;
        self.store
            .record_applied(update.num, kind, update.seq)
            .await?;
        self.dedup.put(key, ());
        self.applied += 1;

        debug!(node = update.num, %kind, seq = update.seq, "Applied node update");
        Ok(ApplyOutcome::Applied)
    }

    fn merge(&mut self, snapshot: &mut NodeSnapshot, body: &NodeUpdateBody) {
        match body {
            NodeUpdateBody::NodeInfo {
                short_name,
                long_name,
            } => {
                snapshot.short_name = Some(short_name.clone());
                snapshot.long_name = Some(long_name.clone());
            }
            NodeUpdateBody::Position {
                latitude,
                longitude,
            } => {
                snapshot.latitude = Some(*latitude);
                snapshot.longitude = Some(*longitude);
            }
            NodeUpdateBody::Telemetry {
                battery_level,
                channel_utilization,
                air_util_tx,
            } => {
                snapshot.battery_level = Some(*battery_level);
                snapshot.channel_utilization = Some(*channel_utilization as f64);
                snapshot.air_util_tx = Some(*air_util_tx as f64);
            }
            NodeUpdateBody::Config { region } => {
                snapshot.region = Some(*region);
                if self.connected_node == Some(snapshot.num) {
                    self.region_unset = *region == 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bridge() -> SyncBridge {
        SyncBridge::new(SqliteStore::in_memory().await.unwrap())
    }

    fn telemetry(num: u32, seq: u32, battery: u32) -> NodeUpdate {
        NodeUpdate {
            num,
            seq,
            body: NodeUpdateBody::Telemetry {
                battery_level: battery,
                channel_utilization: 10.0,
                air_util_tx: 2.0,
            },
        }
    }

    #[tokio::test]
    async fn test_apply_then_query() {
        let mut bridge = bridge().await;
        let outcome = bridge.apply(&telemetry(1234, 1, 87)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let node = bridge.store.node(1234).await.unwrap().unwrap();
        assert_eq!(node.battery_level, Some(87));
        assert!(node.last_heard.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_apply_is_idempotent() {
        let mut bridge = bridge().await;
        let update = telemetry(1234, 5, 50);

        assert_eq!(bridge.apply(&update).await.unwrap(), ApplyOutcome::Applied);
        let first = bridge.store.node(1234).await.unwrap().unwrap();

        assert_eq!(
            bridge.apply(&update).await.unwrap(),
            ApplyOutcome::Duplicate
        );
        let mut second = bridge.store.node(1234).await.unwrap().unwrap();

        // last_heard is the only field that could differ; the duplicate
        // must not have touched the row at all.
        second.last_heard = first.last_heard;
        assert_eq!(first, second);
        assert_eq!(bridge.ignored_count(), 1);
        assert_eq!(bridge.applied_count(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_update_dropped() {
        let mut bridge = bridge().await;

        bridge.apply(&telemetry(7, 10, 80)).await.unwrap();
        // An older replay arrives late
        assert_eq!(
            bridge.apply(&telemetry(7, 3, 95)).await.unwrap(),
            ApplyOutcome::Duplicate
        );

        let node = bridge.store.node(7).await.unwrap().unwrap();
        assert_eq!(node.battery_level, Some(80));
    }

    #[tokio::test]
    async fn test_kinds_sequence_independently() {
        let mut bridge = bridge().await;

        bridge.apply(&telemetry(7, 10, 80)).await.unwrap();
        let info = NodeUpdate {
            num: 7,
            seq: 2,
            body: NodeUpdateBody::NodeInfo {
                short_name: "RDGE".into(),
                long_name: "Ridge Repeater".into(),
            },
        };
        assert_eq!(bridge.apply(&info).await.unwrap(), ApplyOutcome::Applied);

        let node = bridge.store.node(7).await.unwrap().unwrap();
        assert_eq!(node.short_name.as_deref(), Some("RDGE"));
        assert_eq!(node.battery_level, Some(80));
    }

    #[tokio::test]
    async fn test_region_advisory_follows_connected_node() {
        let mut bridge = bridge().await;
        let firmware: FirmwareVersion = "2.3.2".parse().unwrap();

        bridge.session_started(1234, &firmware, 0).await.unwrap();
        assert!(bridge.region_unset());

        // A config update for some other node does not clear the advisory
        let other = NodeUpdate {
            num: 999,
            seq: 1,
            body: NodeUpdateBody::Config { region: 3 },
        };
        bridge.apply(&other).await.unwrap();
        assert!(bridge.region_unset());

        // The connected node getting a region does
        let own = NodeUpdate {
            num: 1234,
            seq: 1,
            body: NodeUpdateBody::Config { region: 3 },
        };
        bridge.apply(&own).await.unwrap();
        assert!(!bridge.region_unset());

        bridge.session_ended();
        assert!(!bridge.region_unset());
    }

    #[tokio::test]
    async fn test_session_started_persists_identity() {
        let mut bridge = bridge().await;
        let firmware: FirmwareVersion = "2.3.2".parse().unwrap();

        bridge.session_started(42, &firmware, 3).await.unwrap();

        let node = bridge.store.node(42).await.unwrap().unwrap();
        assert_eq!(node.firmware.as_deref(), Some("2.3.2"));
        assert_eq!(node.region, Some(3));
        assert!(!bridge.region_unset());
    }
}
