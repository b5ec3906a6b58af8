pub(crate) use self::handler::DhtHandler;

use crate::{
    bencode::{Value, MAX_SALT_LEN},
    contact::Contact,
    id::InfoHash,
};
use std::net::SocketAddrV4;
use tokio::sync::mpsc;

pub(crate) mod handler;
mod lookup;

/// Task that our DHT will execute immediately.
pub(crate) enum Command {
    /// Find peers for the info hash and announce ourselves to the closest
    /// nodes.
    Announce {
        info_hash: InfoHash,
        implied_port: bool,
        tx: mpsc::UnboundedSender<OpEvent>,
    },
    /// Find peers for the info hash.
    GetPeers {
        info_hash: InfoHash,
        tx: mpsc::UnboundedSender<OpEvent>,
    },
    /// Store a BEP44 value on the closest nodes.
    PutData {
        value: Value,
        mutability: Mutability,
        reset_target: Option<InfoHash>,
        tx: mpsc::UnboundedSender<OpEvent>,
    },
    /// Retrieve a BEP44 value.
    GetData {
        target: InfoHash,
        mutability: Mutability,
        tx: mpsc::UnboundedSender<OpEvent>,
    },
    /// Stop the DHT: fail whatever is in flight and close the socket.
    Shutdown,
}

/// Whether a BEP44 item is immutable (addressed by its content) or mutable
/// (addressed by the publisher's key, optionally salted).
#[derive(Clone, Debug)]
pub enum Mutability {
    Immutable,
    Mutable(Option<Vec<u8>>),
}

impl Mutability {
    pub(crate) fn is_mutable(&self) -> bool {
        matches!(self, Self::Mutable(_))
    }

    /// The effective salt: trimmed to [`MAX_SALT_LEN`] bytes, empty treated
    /// as absent.
    pub(crate) fn salt(&self) -> Option<Vec<u8>> {
        match self {
            Self::Immutable => None,
            Self::Mutable(salt) => salt
                .as_deref()
                .filter(|salt| !salt.is_empty())
                .map(|salt| salt[..salt.len().min(MAX_SALT_LEN)].to_vec()),
        }
    }
}

/// Event that occured within the DHT which clients may be interested in.
#[derive(Clone, Debug)]
pub enum DhtEvent {
    /// The node id this instance runs under.
    Id(InfoHash),
    /// The Ed25519 public key mutable puts are signed with.
    PublicKey([u8; 32]),
    /// The UDP socket is bound.
    Listening(SocketAddrV4),
    /// The bootstrap populate finished after visiting this many nodes.
    Ready { num_visited: usize },
    /// A query arrived.
    Incoming {
        query: &'static str,
        from: SocketAddrV4,
    },
    /// A node answered one of our queries with an error.
    Error {
        code: u16,
        message: String,
        from: SocketAddrV4,
    },
    /// Routing table snapshot (all contacts).
    Nodes(Vec<Contact>),
    /// Routing table snapshot (closest contacts).
    Closest(Vec<Contact>),
    /// Peer store totals after a housekeeping sweep.
    Peers { torrents: usize, peers: usize },
    /// Data store total after a housekeeping sweep.
    Data { items: usize },
    /// A source crossed the spam threshold; its datagrams are now dropped
    /// until the window ends. Reported once per window.
    Spam(SocketAddrV4),
    /// A contact was dropped after failing its refresh ping.
    DropNode(Contact),
    /// An announced peer expired.
    DropPeer {
        info_hash: InfoHash,
        addr: SocketAddrV4,
    },
    /// A stored BEP44 item expired.
    DropData(InfoHash),
    /// Binding the UDP socket failed; the DHT is dead.
    UdpFail(u16),
}

/// Progress of a single public operation, delivered through its
/// [`OpStream`](crate::OpStream).
#[derive(Clone, Debug)]
pub enum OpEvent {
    /// A node handed us peers for the info hash.
    Peers {
        info_hash: InfoHash,
        values: Vec<SocketAddrV4>,
        from: SocketAddrV4,
    },
    /// A node handed us a valid BEP44 value.
    Data {
        target: InfoHash,
        value: Value,
        from: SocketAddrV4,
    },
    /// The operation finished. Always the last event.
    Done(LookupSummary),
}

/// Aggregate outcome of a public operation. Fields inapplicable to the
/// operation are `None`.
#[derive(Clone, Debug, Default)]
pub struct LookupSummary {
    /// What the operation was keyed on: info hash or BEP44 target.
    pub target: Option<InfoHash>,
    /// Unique locations the iterative lookup contacted.
    pub num_visited: usize,
    /// Peers found, or value replicas seen.
    pub num_found: Option<usize>,
    /// Storage acknowledgements received.
    pub num_stored: Option<usize>,
    /// Deduplicated peers, in discovery order.
    pub peers: Option<Vec<SocketAddrV4>>,
    /// The retrieved (or stored) value.
    pub value: Option<Value>,
    pub seq: Option<i64>,
    pub public_key: Option<[u8; 32]>,
    pub signature: Option<Vec<u8>>,
    pub salt: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salt_is_trimmed_and_normalized() {
        assert_eq!(Mutability::Immutable.salt(), None);
        assert_eq!(Mutability::Mutable(None).salt(), None);
        assert_eq!(Mutability::Mutable(Some(Vec::new())).salt(), None);
        assert_eq!(
            Mutability::Mutable(Some(b"salt".to_vec())).salt(),
            Some(b"salt".to_vec())
        );

        let long = vec![b'x'; 100];
        assert_eq!(
            Mutability::Mutable(Some(long)).salt(),
            Some(vec![b'x'; MAX_SALT_LEN])
        );
    }
}
