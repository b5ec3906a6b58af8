//! Compact representation of peers and nodes (BEP5, IPv4 only).

use std::{
    convert::TryInto,
    net::{Ipv4Addr, SocketAddrV4},
};

/// Length of a packed location: 4-byte IPv4 address + 2-byte big-endian port.
pub(crate) const LOCATION_LEN: usize = 6;

/// Serialize/deserialize a `Vec` of peer locations as a list of 6-byte
/// strings (the `values` key of a `get_peers` response). Entries of any other
/// length come from address families we do not speak and are skipped, not
/// treated as an error - the rest of the message is still usable.
pub(crate) mod peers {
    use serde::{
        de::{Deserializer, SeqAccess, Visitor},
        ser::{SerializeSeq, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::{fmt, net::SocketAddrV4};

    pub(crate) fn serialize<S>(addrs: &[SocketAddrV4], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = s.serialize_seq(Some(addrs.len()))?;
        for addr in addrs {
            seq.serialize_element(Bytes::new(&super::encode_location(addr)))?
        }
        seq.end()
    }

    pub(crate) fn deserialize<'de, D>(d: D) -> Result<Vec<SocketAddrV4>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PeersVisitor;

        impl<'de> Visitor<'de> for PeersVisitor {
            type Value = Vec<SocketAddrV4>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "list of byte strings")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut output = Vec::with_capacity(seq.size_hint().unwrap_or(0));

                while let Some(bytes) = seq.next_element::<ByteBuf>()? {
                    if let Some(addr) = super::decode_location(&bytes) {
                        output.push(addr);
                    }
                }

                Ok(output)
            }
        }

        d.deserialize_seq(PeersVisitor)
    }
}

/// Serialize/deserialize a `Vec` of nodes as a single byte string of 26-byte
/// `id ∥ location` entries (the `nodes` key).
pub(crate) mod nodes {
    use crate::{
        contact::{ContactInfo, CONTACT_INFO_LEN},
        id::{NodeId, NODE_ID_LEN},
    };
    use serde::{
        de::{Deserialize, Deserializer, Error as _},
        ser::Serializer,
    };
    use serde_bytes::ByteBuf;
    use std::convert::TryFrom;

    pub(crate) fn serialize<S>(nodes: &[ContactInfo], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut buffer = Vec::with_capacity(nodes.len() * CONTACT_INFO_LEN);

        for node in nodes {
            buffer.extend_from_slice(&node.packed());
        }

        s.serialize_bytes(&buffer)
    }

    pub(crate) fn deserialize<'de, D>(d: D) -> Result<Vec<ContactInfo>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buffer = ByteBuf::deserialize(d)?;
        let chunks = buffer.chunks_exact(CONTACT_INFO_LEN);

        if !chunks.remainder().is_empty() {
            let msg = format!("multiple of {CONTACT_INFO_LEN}");
            return Err(D::Error::invalid_length(buffer.len(), &msg.as_ref()));
        }

        let nodes = chunks
            .filter_map(|chunk| {
                let id = NodeId::try_from(&chunk[..NODE_ID_LEN]).ok()?;
                let addr = super::decode_location(&chunk[NODE_ID_LEN..])?;

                Some(ContactInfo::new(id, addr))
            })
            .collect();

        Ok(nodes)
    }
}

pub(crate) fn encode_location(addr: &SocketAddrV4) -> [u8; LOCATION_LEN] {
    let mut buffer = [0; LOCATION_LEN];
    buffer[..4].copy_from_slice(&addr.ip().octets());
    buffer[4..].copy_from_slice(&addr.port().to_be_bytes());
    buffer
}

pub(crate) fn decode_location(src: &[u8]) -> Option<SocketAddrV4> {
    if src.len() != LOCATION_LEN {
        return None;
    }

    let ip: [u8; 4] = src.get(..4)?.try_into().ok()?;
    let port = u16::from_be_bytes(src.get(4..)?.try_into().ok()?);

    Some(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

/// Parse a packed sequence of 6-byte locations, e.g. a bootstrap list.
/// Trailing bytes that do not form a whole location are ignored.
pub(crate) fn decode_location_list(src: &[u8]) -> Vec<SocketAddrV4> {
    src.chunks_exact(LOCATION_LEN)
        .filter_map(decode_location)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{contact::ContactInfo, id::NodeId};
    use serde::{Deserialize, Serialize};
    use std::fmt::Debug;

    #[test]
    fn encode_decode_peers() {
        #[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        struct Wrapper {
            #[serde(with = "super::peers")]
            values: Vec<SocketAddrV4>,
        }

        // empty
        encode_decode(&Wrapper { values: Vec::new() }, b"le");
        // one
        encode_decode(
            &Wrapper {
                values: vec![SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6789)],
            },
            &[b'l', b'6', b':', 127, 0, 0, 1, 26, 133, b'e'],
        );
        // two
        encode_decode(
            &Wrapper {
                values: vec![
                    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6789),
                    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 2), 1234),
                ],
            },
            &[
                b'l', b'6', b':', 127, 0, 0, 1, 26, 133, b'6', b':', 127, 0, 0, 2, 4, 210, b'e',
            ],
        );
    }

    #[test]
    fn decode_peers_skips_foreign_entries() {
        #[derive(Debug, Eq, PartialEq, Deserialize)]
        #[serde(transparent)]
        struct Wrapper {
            #[serde(with = "super::peers")]
            values: Vec<SocketAddrV4>,
        }

        // A 4-byte entry followed by a valid one.
        let encoded: &[u8] = &[
            b'l', b'4', b':', 1, 2, 3, 4, b'6', b':', 127, 0, 0, 1, 26, 133, b'e',
        ];
        let decoded: Wrapper = serde_bencode::from_bytes(encoded).unwrap();

        assert_eq!(
            decoded.values,
            vec![SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6789)]
        );
    }

    #[test]
    fn encode_decode_nodes() {
        #[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        struct Wrapper {
            #[serde(with = "super::nodes")]
            nodes: Vec<ContactInfo>,
        }

        encode_decode(&Wrapper { nodes: Vec::new() }, b"0:");
        encode_decode(
            &Wrapper {
                nodes: vec![ContactInfo::new(
                    NodeId::from(*b"0123456789abcdefghij"),
                    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6789),
                )],
            },
            &[
                b'2', b'6', b':', b'0', b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'a',
                b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j', 127, 0, 0, 1, 26, 133,
            ],
        );
        encode_decode(
            &Wrapper {
                nodes: vec![
                    ContactInfo::new(
                        NodeId::from(*b"0123456789abcdefghij"),
                        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6789),
                    ),
                    ContactInfo::new(
                        NodeId::from(*b"klmnopqrstuvwxyz0123"),
                        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 2), 1234),
                    ),
                ],
            },
            &[
                b'5', b'2', b':', b'0', b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'a',
                b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j', 127, 0, 0, 1, 26, 133, b'k',
                b'l', b'm', b'n', b'o', b'p', b'q', b'r', b's', b't', b'u', b'v', b'w', b'x', b'y',
                b'z', b'0', b'1', b'2', b'3', 127, 0, 0, 2, 4, 210,
            ],
        );
    }

    #[test]
    fn decode_nodes_rejects_partial_entry() {
        #[derive(Debug, Deserialize)]
        #[serde(transparent)]
        struct Wrapper {
            #[serde(with = "super::nodes")]
            #[allow(unused)]
            nodes: Vec<ContactInfo>,
        }

        assert!(serde_bencode::from_bytes::<Wrapper>(b"3:abc").is_err());
    }

    #[test]
    fn location_list_parses_packed_entries() {
        let packed = [127, 0, 0, 1, 26, 133, 10, 0, 0, 2, 4, 210, 99];

        assert_eq!(
            decode_location_list(&packed),
            vec![
                SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6789),
                SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 1234),
            ]
        );
    }

    fn encode_decode<'de, T>(value: &T, expected_encoded: &'de [u8])
    where
        T: Serialize + Deserialize<'de> + Eq + Debug,
    {
        let actual_encoded = serde_bencode::to_bytes(value).unwrap();
        assert_eq!(actual_encoded, expected_encoded);

        let actual_decoded: T = serde_bencode::from_bytes(expected_encoded).unwrap();
        assert_eq!(actual_decoded, *value);
    }
}
