//! Meshlink State - Persistence for node snapshots and preferences
//!
//! This crate provides the SQLite-backed store the session core syncs into:
//!
//! - **storage**: node snapshot upserts keyed by node number, the
//!   last-applied `(kind, sequence)` record used for idempotent sync, and
//!   process-restart-surviving preferences (preferred device, auto-reconnect)
//! - **error**: state-specific error types
//!
//! ## Example
//!
//! ```ignore
//! use meshlink_state::SqliteStore;
//! use meshlink_core::NodeSnapshot;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqliteStore::open("meshlink.db").await?;
//!
//!     let mut node = NodeSnapshot::new(1234);
//!     node.long_name = Some("Ridge Repeater".into());
//!     store.upsert_node(&node).await?;
//!
//!     assert!(store.node(1234).await?.is_some());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod storage;

pub use error::{Result, StateError};
pub use storage::SqliteStore;
