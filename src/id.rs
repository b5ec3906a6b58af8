use serde::{
    de::{Deserializer, Error as _},
    ser::Serializer,
    Deserialize, Serialize,
};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::{convert::TryFrom, fmt, net::Ipv4Addr};
use thiserror::Error;

/// Length of `InfoHash` in bytes.
pub const INFO_HASH_LEN: usize = 20;

/// Number of id bits.
pub(crate) const ID_BITS: usize = INFO_HASH_LEN * 8;

/// 20-byte long identifier of nodes and objects on the DHT.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; INFO_HASH_LEN]);

impl InfoHash {
    /// Create an id by hashing the given bytes using SHA-1.
    pub fn sha1(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Generate a node id tied to the given external IPv4 address as described
    /// by [BEP42](https://www.bittorrent.org/beps/bep_0042.html).
    pub fn from_ip_v4(ip: Ipv4Addr) -> Self {
        Self::from_ip_v4_with_rand(ip, rand::random())
    }

    pub(crate) fn from_ip_v4_with_rand(ip: Ipv4Addr, rand: u8) -> Self {
        let crc = bep42_crc(ip, rand);

        let mut id: [u8; INFO_HASH_LEN] = rand::random();

        id[0] = (crc >> 24) as u8;
        id[1] = (crc >> 16) as u8;
        id[2] = ((crc >> 8) as u8 & 0xf8) | (rand & 0x7);
        id[19] = rand;

        Self(id)
    }

    /// A uniformly random id.
    pub(crate) fn random() -> Self {
        Self(rand::random())
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8; INFO_HASH_LEN] {
        &self.0
    }

    /// How many leading bits this id has in common with `other`. The result
    /// is [`ID_BITS`] when the ids are identical; otherwise it is the index
    /// of the first differing bit, counting the most significant bit of the
    /// first byte as bit 0.
    pub(crate) fn shared_prefix_bits(&self, other: &InfoHash) -> usize {
        for (index, (ours, theirs)) in self.0.iter().zip(other.0).enumerate() {
            let differing = ours ^ theirs;

            if differing != 0 {
                return index * 8 + differing.leading_zeros() as usize;
            }
        }

        ID_BITS
    }

    /// XOR distance to `other`. The returned bytes compare as a big-endian
    /// 160-bit integer, so they can be used directly as a sort key.
    pub(crate) fn distance_to(&self, other: &InfoHash) -> [u8; INFO_HASH_LEN] {
        let mut distance = self.0;

        for (byte, theirs) in distance.iter_mut().zip(other.0) {
            *byte ^= theirs;
        }

        distance
    }

    /// Whether the first two bytes match. Storage requests whose target fails
    /// this check against the local id are not for us to hold.
    pub(crate) fn same_storage_prefix(&self, other: &InfoHash) -> bool {
        self.0[..2] == other.0[..2]
    }
}

/// Verify that `id` was derived from `ip` as described by BEP42. The last id
/// byte carries the `rand` value the derivation used, so the check recomputes
/// the CRC32C prefix from it and compares the first 21 bits.
pub fn check_bep42(ip: Ipv4Addr, id: &InfoHash) -> bool {
    let rand = id.0[19];
    let crc = bep42_crc(ip, rand);

    id.0[0] == (crc >> 24) as u8
        && id.0[1] == (crc >> 16) as u8
        && id.0[2] & 0xf8 == (crc >> 8) as u8 & 0xf8
}

fn bep42_crc(ip: Ipv4Addr, rand: u8) -> u32 {
    const MASK: [u8; 4] = [0x03, 0x0f, 0x3f, 0xff];

    let mut buffer = ip.octets();
    for (byte, mask) in buffer.iter_mut().zip(MASK) {
        *byte &= mask;
    }
    buffer[0] |= (rand & 0x7) << 5;

    crc32c::crc32c(&buffer)
}

impl From<[u8; INFO_HASH_LEN]> for InfoHash {
    fn from(bytes: [u8; INFO_HASH_LEN]) -> Self {
        Self(bytes)
    }
}

#[derive(Debug, Error)]
#[error("expected {INFO_HASH_LEN} id bytes")]
pub struct LengthError;

impl TryFrom<&[u8]> for InfoHash {
    type Error = LengthError;

    fn try_from(bytes: &[u8]) -> Result<Self, LengthError> {
        match <[u8; INFO_HASH_LEN]>::try_from(bytes) {
            Ok(bytes) => Ok(Self(bytes)),
            Err(_) => Err(LengthError),
        }
    }
}

// On the wire an id is a raw 20-byte bencode string.

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes = ByteBuf::deserialize(d)?;

        Self::try_from(&bytes[..])
            .map_err(|_| D::Error::invalid_length(bytes.len(), &"a 20 byte id"))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

// ----------------------------------------------------------------------------//

/// Bittorrent `NodeId`.
pub type NodeId = InfoHash;

/// Length of a `NodeId`.
pub const NODE_ID_LEN: usize = INFO_HASH_LEN;

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_prefix_counts_leading_matching_bits() {
        let base = InfoHash::from([0u8; INFO_HASH_LEN]);

        assert_eq!(base.shared_prefix_bits(&base), ID_BITS);

        let mut bytes = [0u8; INFO_HASH_LEN];
        bytes[0] = 0x80;
        assert_eq!(base.shared_prefix_bits(&bytes.into()), 0);

        bytes[0] = 0x01;
        assert_eq!(base.shared_prefix_bits(&bytes.into()), 7);

        bytes[0] = 0;
        bytes[2] = 0x10;
        assert_eq!(base.shared_prefix_bits(&bytes.into()), 19);
    }

    #[test]
    fn distance_is_xor_and_orders_big_endian() {
        let origin = InfoHash::from([0u8; INFO_HASH_LEN]);

        let mut near = [0u8; INFO_HASH_LEN];
        near[19] = 1;
        let mut far = [0u8; INFO_HASH_LEN];
        far[0] = 1;

        assert_eq!(origin.distance_to(&origin), [0u8; INFO_HASH_LEN]);
        assert_eq!(origin.distance_to(&near.into()), near);
        assert!(origin.distance_to(&near.into()) < origin.distance_to(&far.into()));
    }

    #[test]
    fn serde_as_raw_byte_string() {
        let id = InfoHash::sha1(b"ripe");

        let encoded = serde_bencode::to_bytes(&id).unwrap();
        assert_eq!(encoded[..3], *b"20:");
        assert_eq!(serde_bencode::from_bytes::<InfoHash>(&encoded).unwrap(), id);

        assert!(serde_bencode::from_bytes::<InfoHash>(b"3:abc").is_err());
    }

    #[test]
    fn try_from_enforces_length() {
        assert!(InfoHash::try_from(&b"short"[..]).is_err());
        assert!(InfoHash::try_from(&b"swarm-of-interest-01"[..]).is_ok());
    }

    #[test]
    fn bep42_derived_id_passes_check() {
        let ip = Ipv4Addr::new(192, 168, 1, 1);
        let id = InfoHash::from_ip_v4_with_rand(ip, 0x17);

        assert_eq!(id.as_bytes()[19], 0x17);
        assert!(check_bep42(ip, &id));
    }

    #[test]
    fn bep42_check_rejects_foreign_address() {
        let id = InfoHash::from_ip_v4_with_rand(Ipv4Addr::new(192, 168, 1, 1), 0x17);

        assert!(!check_bep42(Ipv4Addr::new(88, 11, 2, 7), &id));
    }

    #[test]
    fn storage_prefix_compares_first_two_bytes() {
        let a = InfoHash::from(*b"abcdefghij0123456789");
        let b = InfoHash::from(*b"abXXXXXXXXXXXXXXXXXX");
        let c = InfoHash::from(*b"aXcdefghij0123456789");

        assert!(a.same_storage_prefix(&b));
        assert!(!a.same_storage_prefix(&c));
    }
}
