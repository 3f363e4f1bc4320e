//! Connection registry: which peer a logical device was last seen on
//!
//! Written by the preamble matcher and the Modbus response path, read by
//! every directed send. Forward (device -> peer) and reverse
//! ((link, peer) -> devices) indices live behind one mutex and are kept
//! mutually consistent; no operation performs I/O while holding it.

use std::collections::HashSet;
use std::time::Instant;

use parking_lot::Mutex;

use crate::model::{DeviceKey, LinkId, PeerAddr};

/// Last observed location of a device
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub link_id: LinkId,
    pub peer: PeerAddr,
    pub last_seen: Instant,
}

#[derive(Default)]
struct Inner {
    forward: ahash::AHashMap<DeviceKey, ConnectionRecord>,
    reverse: ahash::AHashMap<(LinkId, PeerAddr), HashSet<DeviceKey>>,
}

impl Inner {
    fn unlink(&mut self, key: &DeviceKey) {
        if let Some(old) = self.forward.remove(key) {
            let slot = (old.link_id, old.peer);
            if let Some(set) = self.reverse.get_mut(&slot) {
                set.remove(key);
                if set.is_empty() {
                    self.reverse.remove(&slot);
                }
            }
        }
    }
}

/// Device -> peer address registry shared by all link workers
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` was observed on `(link_id, peer)`, replacing any
    /// prior mapping. A device maps to at most one peer at a time.
    pub fn register(&self, key: DeviceKey, link_id: LinkId, peer: PeerAddr) {
        let mut inner = self.inner.lock();
        inner.unlink(&key);
        inner
            .reverse
            .entry((link_id, peer))
            .or_default()
            .insert(key.clone());
        inner.forward.insert(
            key,
            ConnectionRecord {
                link_id,
                peer,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn get(&self, key: &DeviceKey) -> Option<ConnectionRecord> {
        self.inner.lock().forward.get(key).cloned()
    }

    /// Whether any device has registered from this peer
    pub fn is_registered(&self, link_id: LinkId, peer: PeerAddr) -> bool {
        self.inner
            .lock()
            .reverse
            .get(&(link_id, peer))
            .is_some_and(|set| !set.is_empty())
    }

    pub fn remove(&self, key: &DeviceKey) {
        self.inner.lock().unlink(key);
    }

    /// Drop every mapping learned on a link (link shut down)
    pub fn remove_by_link(&self, link_id: LinkId) {
        let mut inner = self.inner.lock();
        let keys: Vec<DeviceKey> = inner
            .forward
            .iter()
            .filter(|(_, rec)| rec.link_id == link_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            inner.unlink(&key);
        }
    }

    /// Drop every mapping learned from one peer (peer disconnected)
    pub fn remove_by_peer(&self, link_id: LinkId, peer: PeerAddr) {
        let mut inner = self.inner.lock();
        let keys = match inner.reverse.get(&(link_id, peer)) {
            Some(set) => set.iter().cloned().collect::<Vec<_>>(),
            None => return,
        };
        for key in keys {
            inner.unlink(&key);
        }
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.inner.lock();
        for (key, rec) in &inner.forward {
            let set = inner
                .reverse
                .get(&(rec.link_id, rec.peer))
                .expect("forward entry missing from reverse index");
            assert!(set.contains(key));
        }
        for ((link_id, peer), set) in &inner.reverse {
            for key in set {
                let rec = inner
                    .forward
                    .get(key)
                    .expect("reverse entry missing from forward index");
                assert_eq!(rec.link_id, *link_id);
                assert_eq!(rec.peer, *peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> PeerAddr {
        format!("10.0.0.1:{port}").parse().expect("peer addr")
    }

    fn key(link: LinkId, code: &str) -> DeviceKey {
        DeviceKey::by_code(link, code)
    }

    #[test]
    fn test_register_and_get() {
        let registry = ConnectionRegistry::new();
        registry.register(key(1, "A"), 1, peer(1000));

        let rec = registry.get(&key(1, "A")).expect("record");
        assert_eq!(rec.link_id, 1);
        assert_eq!(rec.peer, peer(1000));
        assert!(registry.is_registered(1, peer(1000)));
        assert!(!registry.is_registered(1, peer(2000)));
        registry.assert_consistent();
    }

    #[test]
    fn test_reregister_moves_peer() {
        let registry = ConnectionRegistry::new();
        registry.register(key(1, "A"), 1, peer(1000));
        registry.register(key(1, "A"), 1, peer(2000));

        let rec = registry.get(&key(1, "A")).expect("record");
        assert_eq!(rec.peer, peer(2000));
        // The old peer must no longer count as registered
        assert!(!registry.is_registered(1, peer(1000)));
        assert!(registry.is_registered(1, peer(2000)));
        registry.assert_consistent();
    }

    #[test]
    fn test_remove_by_peer_bulk() {
        let registry = ConnectionRegistry::new();
        registry.register(key(1, "A"), 1, peer(1000));
        registry.register(key(1, "B"), 1, peer(1000));
        registry.register(key(1, "C"), 1, peer(2000));

        registry.remove_by_peer(1, peer(1000));
        assert!(registry.get(&key(1, "A")).is_none());
        assert!(registry.get(&key(1, "B")).is_none());
        assert!(registry.get(&key(1, "C")).is_some());
        registry.assert_consistent();
    }

    #[test]
    fn test_remove_by_link() {
        let registry = ConnectionRegistry::new();
        registry.register(key(1, "A"), 1, peer(1000));
        registry.register(key(2, "B"), 2, peer(1000));

        registry.remove_by_link(1);
        assert!(registry.get(&key(1, "A")).is_none());
        assert!(registry.get(&key(2, "B")).is_some());
        registry.assert_consistent();
    }

    #[test]
    fn test_remove_single() {
        let registry = ConnectionRegistry::new();
        registry.register(key(1, "A"), 1, peer(1000));
        registry.register(key(1, "B"), 1, peer(1000));

        registry.remove(&key(1, "A"));
        assert!(registry.get(&key(1, "A")).is_none());
        // Peer still registered through the other device
        assert!(registry.is_registered(1, peer(1000)));
        registry.assert_consistent();
    }
}
