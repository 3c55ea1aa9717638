//! Visible-peripheral tracking
//!
//! The scanner is pure state fed by transport events; the manager issues the
//! actual `start_scan`/`stop_scan` calls. Entries disappear when a
//! peripheral goes out of range, when the radio powers off, or when they go
//! stale past the configured horizon.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

use meshlink_core::{DiscoveredPeripheral, LinkState, PeripheralId};

/// Tracks the set of peripherals currently visible to the radio
#[derive(Debug)]
pub struct Scanner {
    peripherals: HashMap<PeripheralId, DiscoveredPeripheral>,
    is_scanning: bool,
    radio_available: bool,
    stale_after: Duration,
}

impl Scanner {
    /// Create a scanner with the given stale-entry horizon
    pub fn new(stale_after: Duration) -> Self {
        Self {
            peripherals: HashMap::new(),
            is_scanning: false,
            radio_available: true,
            stale_after,
        }
    }

    /// Whether discovery is currently running
    pub fn is_scanning(&self) -> bool {
        self.is_scanning
    }

    /// Whether the radio adapter is usable
    pub fn radio_available(&self) -> bool {
        self.radio_available
    }

    /// Note that discovery started
    pub fn scanning_started(&mut self) {
        self.is_scanning = true;
    }

    /// Note that discovery stopped
    pub fn scanning_stopped(&mut self) {
        self.is_scanning = false;
    }

    /// Record an adapter power transition.
    ///
    /// Power-off clears the visible set: scanning on a dead radio yields an
    /// empty list rather than an error, and consumers read
    /// `radio_available` to render the "radio off" state.
    pub fn adapter_state_changed(&mut self, powered: bool) {
        self.radio_available = powered;
        if !powered {
            debug!("Radio powered off, clearing visible peripherals");
            self.peripherals.clear();
            self.is_scanning = false;
        }
    }

    /// Record a discovery advertisement
    pub fn discovered(&mut self, id: PeripheralId, name: String, rssi: i16) {
        trace!(id = %id.short(), %name, rssi, "Peripheral advertisement");
        let entry = self
            .peripherals
            .entry(id.clone())
            .or_insert_with(|| DiscoveredPeripheral::new(id, name.clone(), rssi));
        entry.name = name;
        entry.rssi = rssi;
        entry.last_seen = Utc::now();
    }

    /// Record a fresh RSSI sample
    pub fn rssi_updated(&mut self, id: &PeripheralId, rssi: i16) {
        if let Some(entry) = self.peripherals.get_mut(id) {
            entry.rssi = rssi;
            entry.last_seen = Utc::now();
        }
    }

    /// Record that a peripheral went out of range
    pub fn lost(&mut self, id: &PeripheralId) {
        if self.peripherals.remove(id).is_some() {
            debug!(id = %id.short(), "Peripheral lost");
        }
    }

    /// Update the link state shown for a peripheral
    pub fn set_link_state(&mut self, id: &PeripheralId, link: LinkState) {
        if let Some(entry) = self.peripherals.get_mut(id) {
            entry.link = link;
        }
    }

    /// Whether a peripheral is currently visible
    pub fn is_visible(&self, id: &PeripheralId) -> bool {
        self.peripherals.contains_key(id)
    }

    /// Advertised name for a visible peripheral
    pub fn name_of(&self, id: &PeripheralId) -> Option<&str> {
        self.peripherals.get(id).map(|p| p.name.as_str())
    }

    /// Snapshot of the visible set, strongest signal first
    pub fn visible(&self) -> Vec<DiscoveredPeripheral> {
        let mut list: Vec<_> = self.peripherals.values().cloned().collect();
        list.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        list
    }

    /// Drop entries not seen advertising within the stale horizon.
    /// Connected peripherals are kept regardless; they stop advertising.
    pub fn expire_stale(&mut self, now: DateTime<Utc>) {
        let horizon = ChronoDuration::from_std(self.stale_after)
            .unwrap_or_else(|_| ChronoDuration::seconds(30));
        self.peripherals.retain(|id, p| {
            let fresh = now - p.last_seen <= horizon || p.link != LinkState::Disconnected;
            if !fresh {
                trace!(id = %id.short(), "Expiring stale peripheral");
            }
            fresh
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> Scanner {
        Scanner::new(Duration::from_secs(30))
    }

    #[test]
    fn test_discovery_updates_existing_entry() {
        let mut s = scanner();
        let id = PeripheralId::new("AA:BB");

        s.discovered(id.clone(), "Mesh-A1B2".into(), -70);
        s.discovered(id.clone(), "Mesh-A1B2".into(), -60);

        let visible = s.visible();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].rssi, -60);
    }

    #[test]
    fn test_visible_sorted_by_signal() {
        let mut s = scanner();
        s.discovered(PeripheralId::new("far"), "Far".into(), -90);
        s.discovered(PeripheralId::new("near"), "Near".into(), -50);

        let visible = s.visible();
        assert_eq!(visible[0].name, "Near");
        assert_eq!(visible[1].name, "Far");
    }

    #[test]
    fn test_lost_removes_entry() {
        let mut s = scanner();
        let id = PeripheralId::new("AA:BB");
        s.discovered(id.clone(), "Mesh".into(), -60);
        s.lost(&id);
        assert!(!s.is_visible(&id));
    }

    #[test]
    fn test_radio_off_clears_set() {
        let mut s = scanner();
        s.scanning_started();
        s.discovered(PeripheralId::new("AA:BB"), "Mesh".into(), -60);

        s.adapter_state_changed(false);
        assert!(!s.radio_available());
        assert!(!s.is_scanning());
        assert!(s.visible().is_empty());

        s.adapter_state_changed(true);
        assert!(s.radio_available());
    }

    #[test]
    fn test_stale_expiry_keeps_connected() {
        let mut s = scanner();
        let gone = PeripheralId::new("gone");
        let held = PeripheralId::new("held");
        s.discovered(gone.clone(), "Gone".into(), -60);
        s.discovered(held.clone(), "Held".into(), -60);
        s.set_link_state(&held, LinkState::Connected);

        let later = Utc::now() + ChronoDuration::seconds(120);
        s.expire_stale(later);

        assert!(!s.is_visible(&gone));
        assert!(s.is_visible(&held));
    }
}
