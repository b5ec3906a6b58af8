use crate::id::{check_bep42, NodeId, NODE_ID_LEN};
use std::{
    net::SocketAddrV4,
    time::{SystemTime, UNIX_EPOCH},
};

/// Length of a node in compact form: id followed by a packed location.
pub(crate) const CONTACT_INFO_LEN: usize = NODE_ID_LEN + 6;

/// Node id + its socket address, as exchanged on the wire.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ContactInfo {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

impl ContactInfo {
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        Self { id, addr }
    }

    /// The 26-byte wire form `id ∥ ip ∥ port`. Also the input tokens are
    /// minted over.
    pub(crate) fn packed(&self) -> [u8; CONTACT_INFO_LEN] {
        let mut buffer = [0; CONTACT_INFO_LEN];
        buffer[..NODE_ID_LEN].copy_from_slice(self.id.as_bytes());
        buffer[NODE_ID_LEN..NODE_ID_LEN + 4].copy_from_slice(&self.addr.ip().octets());
        buffer[NODE_ID_LEN + 4..].copy_from_slice(&self.addr.port().to_be_bytes());
        buffer
    }
}

/// Routing table entry.
///
/// `last_seen` is a unix timestamp refreshed whenever the contact responds to
/// us or queries us. The value 0 is a sentinel meaning a refresh ping is
/// outstanding - contacts still at 0 on the next refresh round get dropped.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Contact {
    pub(crate) info: ContactInfo,
    pub(crate) last_seen: u64,
    pub(crate) bep42: bool,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        Self {
            info: ContactInfo::new(id, addr),
            last_seen: unix_seconds(),
            bep42: check_bep42(*addr.ip(), &id),
        }
    }

    pub fn id(&self) -> NodeId {
        self.info.id
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.info.addr
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Whether the contact's id is consistent with its address per BEP42.
    /// Informational only - non-conforming contacts are not rejected.
    pub fn is_bep42(&self) -> bool {
        self.bep42
    }
}

/// Seconds since the unix epoch.
pub(crate) fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
