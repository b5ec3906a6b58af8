use crate::{bencode::Value, contact::unix_seconds, id::InfoHash};
use std::{collections::HashMap, net::SocketAddrV4};

/// How long an announced peer is served before it has to re-announce.
const PEER_EXPIRY_SECS: u64 = 30 * 60;

/// How long a BEP44 item is served before it has to be re-put.
const DATA_EXPIRY_SECS: u64 = 120 * 60;

/// Maximum number of peers handed out per info hash.
const MAX_PEERS_RETURNED: usize = 150;

/// Peers other nodes announced to us, per info hash.
pub(crate) struct PeerStore {
    torrents: HashMap<InfoHash, HashMap<SocketAddrV4, u64>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self {
            torrents: HashMap::new(),
        }
    }

    /// Record `addr` as a peer for `info_hash`. Re-announcing refreshes the
    /// entry's timestamp.
    pub fn insert(&mut self, info_hash: InfoHash, addr: SocketAddrV4) {
        self.torrents
            .entry(info_hash)
            .or_default()
            .insert(addr, unix_seconds());
    }

    /// The stored peers for `info_hash`, capped at [`MAX_PEERS_RETURNED`].
    pub fn find(&self, info_hash: &InfoHash) -> Vec<SocketAddrV4> {
        self.torrents
            .get(info_hash)
            .map(|peers| peers.keys().copied().take(MAX_PEERS_RETURNED).collect())
            .unwrap_or_default()
    }

    /// Evict entries older than the expiry, reporting each eviction.
    pub fn sweep(&mut self, now: u64) -> Vec<(InfoHash, SocketAddrV4)> {
        let mut evicted = Vec::new();

        self.torrents.retain(|info_hash, peers| {
            peers.retain(|addr, stored_at| {
                if now.saturating_sub(*stored_at) >= PEER_EXPIRY_SECS {
                    evicted.push((*info_hash, *addr));
                    false
                } else {
                    true
                }
            });

            !peers.is_empty()
        });

        evicted
    }

    pub fn num_torrents(&self) -> usize {
        self.torrents.len()
    }

    pub fn num_peers(&self) -> usize {
        self.torrents.values().map(|peers| peers.len()).sum()
    }
}

/// A stored BEP44 item. Immutable items carry only `v`; mutable items also
/// carry the key, sequence number and signature they were published with.
#[derive(Clone)]
pub(crate) struct StoredItem {
    pub v: Value,
    pub k: Option<[u8; 32]>,
    pub seq: Option<i64>,
    pub sig: Option<Vec<u8>>,
    stored_at: u64,
}

impl StoredItem {
    pub fn immutable(v: Value) -> Self {
        Self {
            v,
            k: None,
            seq: None,
            sig: None,
            stored_at: unix_seconds(),
        }
    }

    pub fn mutable(v: Value, k: [u8; 32], seq: i64, sig: Vec<u8>) -> Self {
        Self {
            v,
            k: Some(k),
            seq: Some(seq),
            sig: Some(sig),
            stored_at: unix_seconds(),
        }
    }
}

/// BEP44 items other nodes put to us, by target.
pub(crate) struct DataStore {
    items: HashMap<InfoHash, StoredItem>,
}

impl DataStore {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
        }
    }

    pub fn get(&self, target: &InfoHash) -> Option<&StoredItem> {
        self.items.get(target)
    }

    pub fn insert(&mut self, target: InfoHash, item: StoredItem) {
        self.items.insert(target, item);
    }

    /// Evict items older than the expiry, reporting the evicted targets.
    pub fn sweep(&mut self, now: u64) -> Vec<InfoHash> {
        let mut evicted = Vec::new();

        self.items.retain(|target, item| {
            if now.saturating_sub(item.stored_at) >= DATA_EXPIRY_SECS {
                evicted.push(*target);
                false
            } else {
                true
            }
        });

        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn peers_survive_until_expiry() {
        let mut store = PeerStore::new();
        let info_hash = InfoHash::sha1(b"foo");
        let addr = test::dummy_socket_addr_v4();

        store.insert(info_hash, addr);

        let now = unix_seconds();
        assert!(store.sweep(now + PEER_EXPIRY_SECS - 1).is_empty());
        assert_eq!(store.find(&info_hash), vec![addr]);

        let evicted = store.sweep(now + PEER_EXPIRY_SECS);
        assert_eq!(evicted, vec![(info_hash, addr)]);
        assert!(store.find(&info_hash).is_empty());
        assert_eq!(store.num_torrents(), 0);
    }

    #[test]
    fn peer_retrieval_is_capped() {
        let mut store = PeerStore::new();
        let info_hash = InfoHash::sha1(b"foo");

        for index in 0..MAX_PEERS_RETURNED as u16 + 10 {
            store.insert(
                info_hash,
                SocketAddrV4::new([127, 0, 0, 1].into(), 1000 + index),
            );
        }

        assert_eq!(store.find(&info_hash).len(), MAX_PEERS_RETURNED);
        assert_eq!(store.num_peers(), MAX_PEERS_RETURNED + 10);
    }

    #[test]
    fn reannounce_refreshes_timestamp() {
        let mut store = PeerStore::new();
        let info_hash = InfoHash::sha1(b"foo");
        let addr = test::dummy_socket_addr_v4();

        store.insert(info_hash, addr);

        // Age the entry to the brink of expiry, then re-announce.
        *store
            .torrents
            .get_mut(&info_hash)
            .unwrap()
            .get_mut(&addr)
            .unwrap() = unix_seconds() - PEER_EXPIRY_SECS + 1;
        store.insert(info_hash, addr);

        assert!(store.sweep(unix_seconds() + 1).is_empty());
    }

    #[test]
    fn data_survives_until_expiry() {
        let mut store = DataStore::new();
        let target = InfoHash::sha1(b"bar");

        store.insert(target, StoredItem::immutable(Value::from("Hello")));

        let now = unix_seconds();
        assert!(store.sweep(now + DATA_EXPIRY_SECS - 1).is_empty());
        assert!(store.get(&target).is_some());

        let evicted = store.sweep(now + DATA_EXPIRY_SECS);
        assert_eq!(evicted, vec![target]);
        assert!(store.get(&target).is_none());
        assert_eq!(store.len(), 0);
    }
}
