//! Dynamic bencode values.
//!
//! Protocol messages are (de)serialized through `serde_bencode` directly (see
//! `message`). BEP44 payloads however are arbitrary bencode, so they are
//! modeled by the [`Value`] sum type below. `serde_bencode` emits dictionary
//! keys sorted by raw bytes, which makes every encoding produced here
//! canonical - a property both the signing buffer and the stored-value
//! equality checks rely on.

use crate::id::InfoHash;
use serde::{
    de::{Deserializer, MapAccess, SeqAccess, Visitor},
    ser::{SerializeMap, SerializeSeq, Serializer},
    Deserialize, Serialize,
};
use serde_bytes::{ByteBuf, Bytes};
use std::{collections::BTreeMap, fmt};

pub type Error = serde_bencode::Error;

/// Maximum encoded length of a BEP44 value.
pub const MAX_VALUE_LEN: usize = 1000;

/// Maximum salt length accepted in a mutable put.
pub const MAX_SALT_LEN: usize = 64;

#[inline]
pub(crate) fn encode<T>(value: &T) -> Result<Vec<u8>, Error>
where
    T: Serialize,
{
    serde_bencode::to_bytes(value)
}

#[inline]
pub(crate) fn decode<'de, T>(bytes: &'de [u8]) -> Result<T, Error>
where
    T: Deserialize<'de>,
{
    serde_bencode::from_bytes(bytes)
}

/// Any bencode value: byte string, integer, list or dictionary.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Canonical encoding of the value.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Every `Value` variant maps onto bencode and the sink is a `Vec`,
        // so this cannot fail short of a bug.
        encode(self).expect("failed to serialize bencode value")
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Bytes(bytes) => s.serialize_bytes(bytes),
            Self::Int(int) => s.serialize_i64(*int),
            Self::List(list) => {
                let mut seq = s.serialize_seq(Some(list.len()))?;
                for item in list {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Dict(dict) => {
                let mut map = s.serialize_map(Some(dict.len()))?;
                for (key, value) in dict {
                    map.serialize_entry(Bytes::new(key), value)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a bencode value")
            }

            fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<Self::Value, E> {
                Ok(Value::Int(value))
            }

            fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<Self::Value, E> {
                i64::try_from(value)
                    .map(Value::Int)
                    .map_err(|_| E::custom("integer out of range"))
            }

            fn visit_bytes<E: serde::de::Error>(self, value: &[u8]) -> Result<Self::Value, E> {
                Ok(Value::Bytes(value.to_vec()))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, value: Vec<u8>) -> Result<Self::Value, E> {
                Ok(Value::Bytes(value))
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(Value::Bytes(value.as_bytes().to_vec()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut list = Vec::with_capacity(seq.size_hint().unwrap_or(0));

                while let Some(item) = seq.next_element()? {
                    list.push(item);
                }

                Ok(Value::List(list))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut dict = BTreeMap::new();

                while let Some((key, value)) = map.next_entry::<ByteBuf, Value>()? {
                    dict.insert(key.into_vec(), value);
                }

                Ok(Value::Dict(dict))
            }
        }

        d.deserialize_any(ValueVisitor)
    }
}

// ----------------------------------------------------------------------------//

/// The canonical byte sequence an Ed25519 signature of a mutable item covers,
/// as defined by BEP44: the bencode fragments of the singleton dictionaries
/// `{salt}`, `{seq}` and `{v}`, each stripped of its leading `d` and trailing
/// `e`, concatenated in that order. The salt fragment is omitted when the salt
/// is empty.
pub fn signing_buffer(seq: i64, value: &Value, salt: Option<&[u8]>) -> Vec<u8> {
    let mut buffer = Vec::new();

    if let Some(salt) = salt.filter(|salt| !salt.is_empty()) {
        buffer.extend_from_slice(b"4:salt");
        buffer.extend_from_slice(format!("{}:", salt.len()).as_bytes());
        buffer.extend_from_slice(salt);
    }

    buffer.extend_from_slice(format!("3:seqi{seq}e").as_bytes());
    buffer.extend_from_slice(b"1:v");
    buffer.extend_from_slice(&value.to_bytes());

    buffer
}

/// Target of an immutable item: the SHA-1 of its canonical encoding.
pub fn make_immutable_target(value: &Value) -> InfoHash {
    InfoHash::sha1(&value.to_bytes())
}

/// Target of a mutable item: the SHA-1 of the public key, with the salt (if
/// any, truncated to [`MAX_SALT_LEN`] bytes) appended.
pub fn make_mutable_target(public_key: &[u8; 32], salt: Option<&[u8]>) -> InfoHash {
    match salt.filter(|salt| !salt.is_empty()) {
        Some(salt) => {
            let salt = &salt[..salt.len().min(MAX_SALT_LEN)];
            let mut buffer = Vec::with_capacity(public_key.len() + salt.len());
            buffer.extend_from_slice(public_key);
            buffer.extend_from_slice(salt);
            InfoHash::sha1(&buffer)
        }
        None => InfoHash::sha1(public_key),
    }
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: &[(&str, Value)]) -> Value {
        Value::Dict(
            entries
                .iter()
                .map(|(key, value)| (key.as_bytes().to_vec(), value.clone()))
                .collect(),
        )
    }

    #[track_caller]
    fn assert_round_trip(value: &Value, expected_encoded: &[u8]) {
        let encoded = value.to_bytes();
        assert_eq!(encoded, expected_encoded);

        let decoded: Value = decode(&encoded).unwrap();
        assert_eq!(decoded, *value);
    }

    #[test]
    fn round_trip_bytes() {
        assert_round_trip(&Value::from("spam"), b"4:spam");
        assert_round_trip(&Value::Bytes(vec![]), b"0:");
        assert_round_trip(&Value::Bytes(vec![0, 255, 1]), b"3:\x00\xff\x01");
    }

    #[test]
    fn round_trip_integers() {
        assert_round_trip(&Value::from(0), b"i0e");
        assert_round_trip(&Value::from(42), b"i42e");
        assert_round_trip(&Value::from(-17), b"i-17e");
        assert_round_trip(&Value::from(i64::MAX), b"i9223372036854775807e");
    }

    #[test]
    fn round_trip_lists() {
        assert_round_trip(&Value::List(vec![]), b"le");
        assert_round_trip(
            &Value::List(vec![Value::from("a"), Value::from(1)]),
            b"l1:ai1ee",
        );
    }

    #[test]
    fn dict_keys_are_emitted_in_byte_order() {
        let value = dict(&[
            ("zz", Value::from(1)),
            ("a", Value::from("x")),
            ("m", Value::List(vec![Value::from(2)])),
        ]);

        assert_round_trip(&value, b"d1:a1:x1:mli2ee2:zzi1ee");
    }

    #[test]
    fn round_trip_nested() {
        let value = dict(&[(
            "outer",
            dict(&[("inner", Value::List(vec![Value::from("deep")]))]),
        )]);

        let encoded = value.to_bytes();
        let decoded: Value = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert!(decode::<Value>(b"").is_err());
        assert!(decode::<Value>(b"d3:key").is_err());
        assert!(decode::<Value>(b"i42").is_err());
    }

    #[test]
    fn signing_buffer_with_salt() {
        let buffer = signing_buffer(1, &Value::from("Hello World!"), Some(b"foobar"));

        assert_eq!(&buffer[..], &b"4:salt6:foobar3:seqi1e1:v12:Hello World!"[..]);
    }

    #[test]
    fn signing_buffer_without_salt() {
        let expected = &b"3:seqi1e1:v12:Hello World!"[..];

        let buffer = signing_buffer(1, &Value::from("Hello World!"), None);
        assert_eq!(&buffer[..], expected);

        // An empty salt must not contribute a fragment.
        let buffer = signing_buffer(1, &Value::from("Hello World!"), Some(b""));
        assert_eq!(&buffer[..], expected);
    }

    #[test]
    fn immutable_target_is_hash_of_encoding() {
        let value = dict(&[("f", Value::from("MLK")), ("m", Value::from("JEB"))]);

        assert_eq!(
            make_immutable_target(&value),
            InfoHash::sha1(&value.to_bytes())
        );
    }

    #[test]
    fn mutable_target_appends_salt() {
        let key = [3u8; 32];

        let mut salted = key.to_vec();
        salted.extend_from_slice(b"salt");

        assert_eq!(make_mutable_target(&key, None), InfoHash::sha1(&key));
        assert_eq!(make_mutable_target(&key, Some(b"")), InfoHash::sha1(&key));
        assert_eq!(
            make_mutable_target(&key, Some(b"salt")),
            InfoHash::sha1(&salted)
        );
    }

    #[test]
    fn mutable_target_truncates_long_salt() {
        let key = [9u8; 32];
        let long_salt = [b'x'; 100];

        let mut truncated = key.to_vec();
        truncated.extend_from_slice(&long_salt[..MAX_SALT_LEN]);

        assert_eq!(
            make_mutable_target(&key, Some(&long_salt)),
            InfoHash::sha1(&truncated)
        );
    }
}
