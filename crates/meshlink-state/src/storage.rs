//! SQLite-backed store for node snapshots and preferences
//!
//! Schema (created on open):
//!
//! - `nodes`: one row per mesh node, keyed by node number; upserts replace
//!   field-by-field so the sync bridge can write a merged snapshot.
//! - `applied`: last applied `(kind, sequence)` per node, the persistence
//!   half of the idempotent-apply guarantee.
//! - `preferences`: key/value rows surviving restarts, holding the preferred
//!   device pair and the auto-reconnect flag.

use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{debug, info};

use meshlink_core::{NodeSnapshot, NodeUpdateKind, PeripheralId, PreferredDevice};

use crate::error::{Result, StateError};

const PREF_PERIPHERAL_ID: &str = "preferred_peripheral_id";
const PREF_NODE_NUM: &str = "preferred_node_num";
const PREF_AUTO_RECONNECT: &str = "auto_reconnect";

/// SQLite store for node snapshots and process-wide preferences
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a store at the given path
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %path.as_ref().display(), "Opened node store");
        Ok(store)
    }

    /// Open an in-memory store (tests and throwaway sessions)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        // A single persistent connection keeps the in-memory database alive.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                num                 INTEGER PRIMARY KEY,
                short_name          TEXT,
                long_name           TEXT,
                firmware            TEXT,
                region              INTEGER,
                latitude            REAL,
                longitude           REAL,
                battery_level       INTEGER,
                channel_utilization REAL,
                air_util_tx         REAL,
                last_heard          INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS applied (
                num  INTEGER NOT NULL,
                kind TEXT    NOT NULL,
                seq  INTEGER NOT NULL,
                PRIMARY KEY (num, kind)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ===== Node snapshots =====

    /// Insert or replace the snapshot for a node
    pub async fn upsert_node(&self, node: &NodeSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (
                num, short_name, long_name, firmware, region,
                latitude, longitude, battery_level, channel_utilization,
                air_util_tx, last_heard
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(num) DO UPDATE SET
                short_name          = excluded.short_name,
                long_name           = excluded.long_name,
                firmware            = excluded.firmware,
                region              = excluded.region,
                latitude            = excluded.latitude,
                longitude           = excluded.longitude,
                battery_level       = excluded.battery_level,
                channel_utilization = excluded.channel_utilization,
                air_util_tx         = excluded.air_util_tx,
                last_heard          = excluded.last_heard
            "#,
        )
        .bind(node.num as i64)
        .bind(&node.short_name)
        .bind(&node.long_name)
        .bind(&node.firmware)
        .bind(node.region.map(|r| r as i64))
        .bind(node.latitude)
        .bind(node.longitude)
        .bind(node.battery_level.map(|b| b as i64))
        .bind(node.channel_utilization)
        .bind(node.air_util_tx)
        .bind(node.last_heard.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await?;

        debug!(num = node.num, "Upserted node snapshot");
        Ok(())
    }

    /// Fetch the snapshot for a node number
    pub async fn node(&self, num: u32) -> Result<Option<NodeSnapshot>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE num = ?1")
            .bind(num as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_node).transpose()
    }

    /// Fetch all known node snapshots
    pub async fn all_nodes(&self) -> Result<Vec<NodeSnapshot>> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY num")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_node).collect()
    }

    /// Last applied sequence for `(node, kind)`, if any update was applied
    pub async fn last_applied(&self, num: u32, kind: NodeUpdateKind) -> Result<Option<u32>> {
        let row = sqlx::query("SELECT seq FROM applied WHERE num = ?1 AND kind = ?2")
            .bind(num as i64)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let seq: i64 = row.try_get("seq")?;
                Ok(Some(seq as u32))
            }
            None => Ok(None),
        }
    }

    /// Record that an update with this sequence was applied
    pub async fn record_applied(&self, num: u32, kind: NodeUpdateKind, seq: u32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO applied (num, kind, seq) VALUES (?1, ?2, ?3)
            ON CONFLICT(num, kind) DO UPDATE SET seq = excluded.seq
            "#,
        )
        .bind(num as i64)
        .bind(kind.as_str())
        .bind(seq as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Erase all node and applied-sequence data, keeping preferences
    pub async fn reset_nodes(&self) -> Result<()> {
        sqlx::query("DELETE FROM nodes").execute(&self.pool).await?;
        sqlx::query("DELETE FROM applied")
            .execute(&self.pool)
            .await?;
        info!("Node store reset");
        Ok(())
    }

    /// Erase everything, including preferences
    pub async fn reset(&self) -> Result<()> {
        self.reset_nodes().await?;
        sqlx::query("DELETE FROM preferences")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== Preferences =====

    /// The persisted preferred device, if one is recorded
    pub async fn preferred_device(&self) -> Result<Option<PreferredDevice>> {
        let id = self.preference(PREF_PERIPHERAL_ID).await?;
        let num = self.preference(PREF_NODE_NUM).await?;

        match (id, num) {
            (Some(id), Some(num)) => {
                let node_num = num
                    .parse::<u32>()
                    .map_err(|_| StateError::InvalidData(format!("node num: {num}")))?;
                Ok(Some(PreferredDevice::new(PeripheralId::new(id), node_num)))
            }
            _ => Ok(None),
        }
    }

    /// Persist the preferred device pair, replacing any prior pair
    pub async fn set_preferred_device(&self, device: &PreferredDevice) -> Result<()> {
        self.set_preference(PREF_PERIPHERAL_ID, device.peripheral_id.as_str())
            .await?;
        self.set_preference(PREF_NODE_NUM, &device.node_num.to_string())
            .await?;
        debug!(id = %device.peripheral_id, num = device.node_num, "Preferred device recorded");
        Ok(())
    }

    /// Remove the preferred device pair
    pub async fn clear_preferred_device(&self) -> Result<()> {
        self.delete_preference(PREF_PERIPHERAL_ID).await?;
        self.delete_preference(PREF_NODE_NUM).await?;
        debug!("Preferred device cleared");
        Ok(())
    }

    /// Whether automatic reconnect to the preferred device is enabled.
    /// Defaults to true when never set.
    pub async fn auto_reconnect(&self) -> Result<bool> {
        Ok(self
            .preference(PREF_AUTO_RECONNECT)
            .await?
            .map(|v| v == "true")
            .unwrap_or(true))
    }

    /// Persist the auto-reconnect flag
    pub async fn set_auto_reconnect(&self, enabled: bool) -> Result<()> {
        self.set_preference(PREF_AUTO_RECONNECT, if enabled { "true" } else { "false" })
            .await
    }

    async fn preference(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM preferences WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO preferences (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_preference(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM preferences WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_node(row: SqliteRow) -> Result<NodeSnapshot> {
    let num: i64 = row.try_get("num")?;
    let region: Option<i64> = row.try_get("region")?;
    let battery: Option<i64> = row.try_get("battery_level")?;
    let last_heard: Option<i64> = row.try_get("last_heard")?;

    Ok(NodeSnapshot {
        num: num as u32,
        short_name: row.try_get("short_name")?,
        long_name: row.try_get("long_name")?,
        firmware: row.try_get("firmware")?,
        region: region.map(|r| r as u16),
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        battery_level: battery.map(|b| b as u32),
        channel_utilization: row.try_get("channel_utilization")?,
        air_util_tx: row.try_get("air_util_tx")?,
        last_heard: last_heard.and_then(|t| Utc.timestamp_opt(t, 0).single()),
    })
}
