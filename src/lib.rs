//! Implementation of the Bittorrent Mainline Distributed Hash Table.
//!
//! Speaks BEP5 (the base protocol) over IPv4, plus the BEP42 security
//! extension (node ids tied to external addresses via CRC32C) and BEP44
//! (immutable and mutable value storage with Ed25519 signatures).
//!
//! A node is created through [`Dht::builder`] and drives all observable
//! output through a single stream of [`DhtEvent`]s. Peer discovery and value
//! storage run as compound operations ([`Dht::get_peers`],
//! [`Dht::announce_peer`], [`Dht::get_data`], [`Dht::put_data`]) that stream
//! discoveries as they arrive and finish with one aggregate
//! [`LookupSummary`].

mod bencode;
mod builder;
mod compact;
mod contact;
mod id;
mod message;
mod socket;
mod storage;
mod table;
mod token;
mod transaction;
mod worker;

pub use crate::bencode::{
    make_immutable_target, make_mutable_target, signing_buffer, Value, MAX_SALT_LEN, MAX_VALUE_LEN,
};
pub use crate::builder::{Dht, DhtBuilder, OpStream};
pub use crate::contact::{Contact, ContactInfo};
pub use crate::id::{check_bep42, InfoHash, LengthError, NodeId, INFO_HASH_LEN, NODE_ID_LEN};
pub use crate::worker::{DhtEvent, LookupSummary, Mutability, OpEvent};
