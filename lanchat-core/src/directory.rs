//! Peer directory: peer ID -> last-known record, filled by discovery.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::identity::{PeerId, PeerRecord};

/// In-memory map of discovered peers. Mutated by discovery; read by anyone needing an IP lookup.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a record. Returns true if the peer was not known before.
    pub fn upsert(&mut self, record: PeerRecord) -> bool {
        self.peers.insert(record.id.clone(), record).is_none()
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn ip_of(&self, id: &PeerId) -> Option<IpAddr> {
        self.peers.get(id).map(|r| r.ip_address)
    }

    /// All records, sorted by display name then ID for stable listing.
    pub fn records(&self) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self.peers.values().cloned().collect();
        out.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        out
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(id)
    }

    /// Forget everyone (logout / reset).
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn rec(id: &str, name: &str, last: u8) -> PeerRecord {
        PeerRecord::new(
            PeerId::new(id),
            name,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
        )
    }

    #[test]
    fn upsert_refreshes_ip() {
        let mut dir = PeerDirectory::new();
        assert!(dir.upsert(rec("b", "Bob", 2)));
        assert!(!dir.upsert(rec("b", "Bob", 9)));
        assert_eq!(dir.len(), 1);
        assert_eq!(
            dir.ip_of(&PeerId::new("b")),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)))
        );
    }

    #[test]
    fn records_sorted_and_clear() {
        let mut dir = PeerDirectory::new();
        dir.upsert(rec("z", "Zed", 3));
        dir.upsert(rec("a", "Amy", 4));
        let names: Vec<_> = dir.records().into_iter().map(|r| r.display_name).collect();
        assert_eq!(names, vec!["Amy", "Zed"]);
        assert!(dir.remove(&PeerId::new("z")).is_some());
        assert!(dir.get(&PeerId::new("z")).is_none());
        dir.clear();
        assert!(dir.is_empty());
        assert_eq!(dir.ip_of(&PeerId::new("a")), None);
    }
}
