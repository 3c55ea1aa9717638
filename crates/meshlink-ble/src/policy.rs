//! Preferred-device policy
//!
//! One device may be marked "preferred": the radio the manager reconnects to
//! automatically after a link drop and auto-connects to at startup. The pair
//! `(peripheral id, node number)` is persisted through
//! [`meshlink_state::SqliteStore`] and survives restarts.
//!
//! The reconnect decision itself is a pure function so the policy can be
//! tested without a store or a transport.

use tracing::{debug, info};

use meshlink_core::{PeripheralId, PreferredDevice};
use meshlink_state::SqliteStore;

use crate::error::Result;

/// Decide whether a dropped link should trigger automatic reconnection.
///
/// Reconnect only when the dropped peripheral is the stored preferred device
/// and auto-reconnect is enabled. Everything else stays disconnected until
/// the user picks a device.
pub fn should_reconnect(
    dropped: &PeripheralId,
    stored: Option<&PreferredDevice>,
    auto_reconnect_enabled: bool,
) -> bool {
    auto_reconnect_enabled && stored.map(|p| p.matches(dropped)).unwrap_or(false)
}

/// Persistence wrapper for the preferred-device pair
#[derive(Debug, Clone)]
pub struct PreferredDevicePolicy {
    store: SqliteStore,
}

impl PreferredDevicePolicy {
    /// Create a policy over the given store
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// The stored preferred device, if any
    pub async fn preferred(&self) -> Result<Option<PreferredDevice>> {
        Ok(self.store.preferred_device().await?)
    }

    /// Whether the given peripheral is the preferred device
    pub async fn is_preferred(&self, id: &PeripheralId) -> Result<bool> {
        Ok(self
            .store
            .preferred_device()
            .await?
            .map(|p| p.matches(id))
            .unwrap_or(false))
    }

    /// Persist a new preferred device, replacing any prior pair
    pub async fn mark_preferred(&self, id: PeripheralId, node_num: u32) -> Result<()> {
        let device = PreferredDevice::new(id, node_num);
        info!(id = %device.peripheral_id.short(), node = node_num, "Marking preferred device");
        self.store.set_preferred_device(&device).await?;
        Ok(())
    }

    /// Clear the preference, but only when the caller is clearing the
    /// currently connected device. A mismatched id leaves the stored pair
    /// untouched so an unrelated device cannot wipe the preference.
    ///
    /// Returns whether the preference was actually cleared.
    pub async fn clear_preferred(&self, connected: &PeripheralId) -> Result<bool> {
        match self.store.preferred_device().await? {
            Some(stored) if stored.matches(connected) => {
                self.store.clear_preferred_device().await?;
                info!(id = %connected.short(), "Preferred device cleared");
                Ok(true)
            }
            Some(stored) => {
                debug!(
                    stored = %stored.peripheral_id.short(),
                    requested = %connected.short(),
                    "Ignoring clear for non-connected device"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Whether auto-reconnect is enabled (persisted, defaults to true)
    pub async fn auto_reconnect_enabled(&self) -> Result<bool> {
        Ok(self.store.auto_reconnect().await?)
    }

    /// Persist the auto-reconnect flag
    pub async fn set_auto_reconnect(&self, enabled: bool) -> Result<()> {
        Ok(self.store.set_auto_reconnect(enabled).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pref(id: &str, num: u32) -> PreferredDevice {
        PreferredDevice::new(PeripheralId::new(id), num)
    }

    #[test]
    fn test_should_reconnect_requires_match_and_flag() {
        let dropped = PeripheralId::new("AA:BB");
        let stored = pref("AA:BB", 1234);

        assert!(should_reconnect(&dropped, Some(&stored), true));
        assert!(!should_reconnect(&dropped, Some(&stored), false));
        assert!(!should_reconnect(&dropped, None, true));

        let other = pref("CC:DD", 9);
        assert!(!should_reconnect(&dropped, Some(&other), true));
    }

    #[tokio::test]
    async fn test_mark_then_is_preferred() {
        let store = SqliteStore::in_memory().await.unwrap();
        let policy = PreferredDevicePolicy::new(store);
        let id = PeripheralId::new("AA:BB");

        assert!(!policy.is_preferred(&id).await.unwrap());
        policy.mark_preferred(id.clone(), 1234).await.unwrap();
        assert!(policy.is_preferred(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_guard() {
        let store = SqliteStore::in_memory().await.unwrap();
        let policy = PreferredDevicePolicy::new(store);
        let preferred = PeripheralId::new("AA:BB");
        let unrelated = PeripheralId::new("CC:DD");

        policy.mark_preferred(preferred.clone(), 1234).await.unwrap();

        // Clearing while connected to a different device is a no-op
        assert!(!policy.clear_preferred(&unrelated).await.unwrap());
        assert!(policy.is_preferred(&preferred).await.unwrap());

        // Clearing the connected preferred device works
        assert!(policy.clear_preferred(&preferred).await.unwrap());
        assert!(!policy.is_preferred(&preferred).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_replaces_prior_pair() {
        let store = SqliteStore::in_memory().await.unwrap();
        let policy = PreferredDevicePolicy::new(store);

        policy
            .mark_preferred(PeripheralId::new("AA:BB"), 1)
            .await
            .unwrap();
        policy
            .mark_preferred(PeripheralId::new("CC:DD"), 2)
            .await
            .unwrap();

        let stored = policy.preferred().await.unwrap().unwrap();
        assert_eq!(stored, pref("CC:DD", 2));
    }
}
