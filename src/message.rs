use crate::{
    bencode::Value,
    compact,
    contact::ContactInfo,
    id::{InfoHash, NodeId},
};
use serde::{de::Deserializer, ser::Serializer, Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::net::SocketAddrV4;

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub(crate) struct Message {
    #[serde(rename = "t")]
    pub transaction_id: ByteBuf,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    pub fn query(transaction_id: ByteBuf, request: Request) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Request(request),
        }
    }

    pub fn reply(transaction_id: ByteBuf, response: Response) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Response(ResponseEnvelope { r: response }),
        }
    }

    pub fn reject(transaction_id: ByteBuf, code: u16, reason: &str) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Error(ErrorEnvelope {
                e: Error {
                    code,
                    message: reason.to_owned(),
                },
            }),
        }
    }

    /// Decode the message from bencode.
    pub fn decode(input: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(input)
    }

    /// Encode the message into bencode. Our own message types have no
    /// unserializable states and a `Vec` sink cannot error, so a failure here
    /// is a bug worth a loud panic rather than an error to thread through
    /// every send path.
    pub fn encode(&self) -> Vec<u8> {
        serde_bencode::to_bytes(self).expect("failed to serialize message")
    }
}

/// A message is a query, a response or an error, discriminated by `y`. The
/// response and error payloads sit one level down (under `r` and `e`
/// respectively), which the envelope structs model directly: flattening a
/// tagged variant spreads the envelope's single field next to the tag,
/// producing exactly the `{t, y, r}` / `{t, y, e}` wire shape.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "y")]
pub(crate) enum MessageBody {
    #[serde(rename = "q")]
    Request(Request),
    #[serde(rename = "r")]
    Response(ResponseEnvelope),
    #[serde(rename = "e")]
    Error(ErrorEnvelope),
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub(crate) struct ResponseEnvelope {
    pub r: Response,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub e: Error,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "q", content = "a")]
#[serde(rename_all = "snake_case")]
pub(crate) enum Request {
    Ping(PingRequest),
    FindNode(FindNodeRequest),
    GetPeers(GetPeersRequest),
    AnnouncePeer(AnnouncePeerRequest),
    Get(GetRequest),
    Put(PutRequest),
}

impl Request {
    /// The querying node's id.
    pub fn node_id(&self) -> NodeId {
        match self {
            Self::Ping(request) => request.id,
            Self::FindNode(request) => request.id,
            Self::GetPeers(request) => request.id,
            Self::AnnouncePeer(request) => request.id,
            Self::Get(request) => request.id,
            Self::Put(request) => request.id,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Self::Ping(_) => "ping",
            Self::FindNode(_) => "find_node",
            Self::GetPeers(_) => "get_peers",
            Self::AnnouncePeer(_) => "announce_peer",
            Self::Get(_) => "get",
            Self::Put(_) => "put",
        }
    }
}

/// Verbs we answer. Anything else gets error 204.
pub(crate) const KNOWN_VERBS: &[&str] = &[
    "ping",
    "find_node",
    "get_peers",
    "announce_peer",
    "get",
    "put",
];

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub(crate) struct PingRequest {
    pub id: NodeId,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub(crate) struct FindNodeRequest {
    pub id: NodeId,
    pub target: NodeId,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub(crate) struct GetPeersRequest {
    pub id: NodeId,
    pub info_hash: InfoHash,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub(crate) struct AnnouncePeerRequest {
    pub id: NodeId,

    /// Non-zero when the UDP source port of the announce itself should be
    /// recorded instead of `port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implied_port: Option<u8>,

    pub info_hash: InfoHash,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    pub token: ByteBuf,
}

impl AnnouncePeerRequest {
    /// The location this announce asks us to record, given the socket it came
    /// from. `None` when the port is neither implied nor given, which callers
    /// must answer with a protocol error.
    pub fn peer_addr(&self, from: SocketAddrV4) -> Option<SocketAddrV4> {
        if self.implied_port.unwrap_or(0) != 0 {
            Some(from)
        } else {
            self.port.map(|port| SocketAddrV4::new(*from.ip(), port))
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub(crate) struct GetRequest {
    pub id: NodeId,

    /// Sequence number the querier already holds - values not newer than this
    /// are omitted from the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,

    pub target: InfoHash,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub(crate) struct PutRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cas: Option<i64>,

    pub id: NodeId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<ByteBuf>,

    pub token: ByteBuf,

    pub v: Value,
}

/// A `y=r` payload. BEP5/BEP44 responses are only distinguishable by which
/// keys they carry (and by the transaction they answer), so this is a single
/// struct with the optional parts left out of the encoding when unset.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub(crate) struct Response {
    pub id: NodeId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<ByteBuf>,

    #[serde(with = "compact::nodes", default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<ContactInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<Value>,

    #[serde(with = "compact::peers", default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<SocketAddrV4>,
}

impl Response {
    /// An acknowledgement carrying nothing but our id.
    pub fn with_id(id: NodeId) -> Self {
        Self {
            id,
            k: None,
            nodes: Vec::new(),
            seq: None,
            sig: None,
            token: None,
            v: None,
            values: Vec::new(),
        }
    }
}

/// A coded rejection. Travels as the two-element list `[code, message]`,
/// which maps onto a tuple.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct Error {
    pub code: u16,
    pub message: String,
}

impl Serialize for Error {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        (self.code, &self.message).serialize(s)
    }
}

impl<'de> Deserialize<'de> for Error {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let (code, message) = <(u16, String)>::deserialize(d)?;
        Ok(Self { code, message })
    }
}

/// The barest shape of a message: enough to answer a malformed query with a
/// coded error when its transaction id is recoverable.
#[derive(Deserialize)]
pub(crate) struct RawMessage {
    #[serde(rename = "t", default)]
    pub transaction_id: ByteBuf,
    #[serde(default)]
    pub y: Option<ByteBuf>,
    #[serde(default)]
    pub q: Option<ByteBuf>,
}

pub mod error_code {
    // some of these codes are not used in this crate but we still list them here for completeness.
    #![allow(unused)]

    pub const GENERIC_ERROR: u16 = 201;
    pub const SERVER_ERROR: u16 = 202;
    pub const PROTOCOL_ERROR: u16 = 203;
    pub const METHOD_UNKNOWN: u16 = 204;
    pub const MESSAGE_TOO_BIG: u16 = 205;
    pub const INVALID_SIGNATURE: u16 = 206;
    pub const SALT_TOO_BIG: u16 = 207;
    pub const CAS_MISMATCH: u16 = 301;
    pub const SEQ_TOO_SMALL: u16 = 302;
}
