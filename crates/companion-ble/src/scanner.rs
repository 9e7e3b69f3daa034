//! Discovered-peer list maintained from scan results

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::backend::ScanRecord;
use crate::peer::{resolve_display_name, AdvertisedMetadata, PeerAddress, PeerDevice};
use crate::protocol::SERVICE_UUID;

/// RSSI assumed for a first sighting that carries no signal strength
const UNKNOWN_RSSI: i16 = -127;

/// Deduplicated scan results kept in descending RSSI order
#[derive(Debug)]
pub struct DiscoveredPeers {
    peers: Vec<PeerDevice>,
    stale_after: Duration,
}

impl DiscoveredPeers {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            peers: Vec::new(),
            stale_after,
        }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Insert or refresh a peer from a scan result.
    ///
    /// Records that do not advertise the companion service are ignored.
    /// Returns whether the list changed.
    pub fn upsert(&mut self, record: &ScanRecord, now: Instant) -> bool {
        if !record.services.contains(&SERVICE_UUID) {
            debug!("Ignoring {} without the companion service", record.address);
            return false;
        }

        let name = resolve_display_name(
            record.platform_name.as_deref(),
            record.local_name.as_deref(),
        );
        let metadata = AdvertisedMetadata::from_service_data(record.service_data.as_deref());

        match self.peers.iter_mut().find(|p| p.address == record.address) {
            Some(peer) => {
                peer.name = name;
                peer.metadata = metadata;
                if let Some(rssi) = record.rssi {
                    peer.rssi = rssi;
                }
                peer.last_seen = now;
            }
            None => {
                debug!("Discovered {} ({})", name, record.address);
                self.peers.push(PeerDevice {
                    address: record.address.clone(),
                    name,
                    rssi: record.rssi.unwrap_or(UNKNOWN_RSSI),
                    metadata,
                    last_seen: now,
                });
            }
        }

        // Stable sort keeps equal-strength peers in discovery order
        self.peers.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        true
    }

    pub fn remove(&mut self, address: &PeerAddress) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| &p.address != address);
        before != self.peers.len()
    }

    /// Drop peers not seen within the staleness window
    pub fn prune_stale(&mut self, now: Instant) -> Vec<PeerAddress> {
        let stale_after = self.stale_after;
        let mut removed = Vec::new();
        self.peers.retain(|p| {
            let fresh = now.saturating_duration_since(p.last_seen) < stale_after;
            if !fresh {
                removed.push(p.address.clone());
            }
            fresh
        });
        removed
    }

    pub fn get(&self, address: &PeerAddress) -> Option<&PeerDevice> {
        self.peers.iter().find(|p| &p.address == address)
    }

    pub fn list(&self) -> Vec<PeerDevice> {
        self.peers.clone()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(address: &str, rssi: Option<i16>, name: Option<&str>) -> ScanRecord {
        ScanRecord {
            address: PeerAddress::new(address),
            platform_name: None,
            local_name: name.map(str::to_string),
            rssi,
            services: vec![SERVICE_UUID],
            service_data: None,
        }
    }

    #[test]
    fn test_sorted_by_descending_rssi() {
        let mut peers = DiscoveredPeers::new(Duration::from_secs(30));
        let now = Instant::now();
        peers.upsert(&record("A", Some(-80), Some("a")), now);
        peers.upsert(&record("B", Some(-40), Some("b")), now);
        peers.upsert(&record("C", Some(-60), Some("c")), now);

        let order: Vec<_> = peers.list().into_iter().map(|p| p.name).collect();
        assert_eq!(order, vec!["b", "c", "a"]);

        // Rediscovery updates in place and re-sorts
        peers.upsert(&record("A", Some(-30), Some("a2")), now);
        let list = peers.list();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].name, "a2");
        assert_eq!(list[0].rssi, -30);
    }

    #[test]
    fn test_foreign_service_ignored() {
        let mut peers = DiscoveredPeers::new(Duration::from_secs(30));
        let mut foreign = record("X", Some(-20), Some("speaker"));
        foreign.services = vec![Uuid::from_u128(0x180D)];
        assert!(!peers.upsert(&foreign, Instant::now()));
        assert!(peers.list().is_empty());
    }

    #[test]
    fn test_missing_name_and_rssi() {
        let mut peers = DiscoveredPeers::new(Duration::from_secs(30));
        let now = Instant::now();
        peers.upsert(&record("A", None, None), now);
        let peer = peers.get(&PeerAddress::new("A")).unwrap();
        assert_eq!(peer.name, crate::protocol::UNKNOWN_DEVICE_NAME);
        assert_eq!(peer.rssi, UNKNOWN_RSSI);

        // A later sighting without RSSI keeps the known value
        peers.upsert(&record("A", Some(-50), None), now);
        peers.upsert(&record("A", None, None), now);
        assert_eq!(peers.get(&PeerAddress::new("A")).unwrap().rssi, -50);
    }

    #[test]
    fn test_remove_and_prune() {
        let mut peers = DiscoveredPeers::new(Duration::from_secs(30));
        let start = Instant::now();
        peers.upsert(&record("A", Some(-50), None), start);
        peers.upsert(&record("B", Some(-50), None), start + Duration::from_secs(20));

        assert!(peers.remove(&PeerAddress::new("B")));
        assert!(!peers.remove(&PeerAddress::new("B")));

        peers.upsert(&record("B", Some(-50), None), start + Duration::from_secs(20));
        let removed = peers.prune_stale(start + Duration::from_secs(31));
        assert_eq!(removed, vec![PeerAddress::new("A")]);
        assert_eq!(peers.len(), 1);
    }
}
