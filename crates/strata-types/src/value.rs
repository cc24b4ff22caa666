//! Typed attribute values and their byte encoding.
//!
//! The store never interprets encoded cells; it hands bytes to a
//! [`ValueCodec`] and gets a [`Value`] back. Encoding must be deterministic
//! and total for every [`ValueKind`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::timestamp::Timestamp;
use crate::urn::Urn;

/// The declared type of an attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    String,
    Integer,
    Bool,
    Bytes,
    Urn,
    Timestamp,
    List,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Bool => "bool",
            Self::Bytes => "bytes",
            Self::Urn => "urn",
            Self::Timestamp => "timestamp",
            Self::List => "list",
        };
        f.write_str(name)
    }
}

/// A typed attribute value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Integer(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Urn(Urn),
    Timestamp(Timestamp),
    List(Vec<String>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::String(_) => ValueKind::String,
            Self::Integer(_) => ValueKind::Integer,
            Self::Bool(_) => ValueKind::Bool,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Urn(_) => ValueKind::Urn,
            Self::Timestamp(_) => ValueKind::Timestamp,
            Self::List(_) => ValueKind::List,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_urn(&self) -> Option<&Urn> {
        match self {
            Self::Urn(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<Urn> for Value {
    fn from(u: Urn) -> Self {
        Self::Urn(u)
    }
}

impl From<Timestamp> for Value {
    fn from(t: Timestamp) -> Self {
        Self::Timestamp(t)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Urn(u) => write!(f, "{u}"),
            Self::Timestamp(t) => write!(f, "{t}"),
            Self::List(l) => write!(f, "[{}]", l.join(", ")),
        }
    }
}

/// A value together with the timestamp it was written at (its age).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimedValue {
    pub value: Value,
    pub timestamp: Timestamp,
}

impl TimedValue {
    pub fn new(value: Value, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }
}

/// Encode/decode contract between typed values and substrate cells.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, TypeError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, TypeError>;
}

/// Default codec: bincode over the serde representation of [`Value`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeCodec;

impl ValueCodec for BincodeCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, TypeError> {
        bincode::serialize(value).map_err(|e| TypeError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, TypeError> {
        bincode::deserialize(bytes).map_err(|e| TypeError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Value::from("x").kind(), ValueKind::String);
        assert_eq!(Value::from(3i64).kind(), ValueKind::Integer);
        assert_eq!(Value::from(vec![1u8]).kind(), ValueKind::Bytes);
        assert_eq!(Value::List(vec![]).kind(), ValueKind::List);
    }

    #[test]
    fn accessors_reject_other_variants() {
        let v = Value::from("hello");
        assert_eq!(v.as_str(), Some("hello"));
        assert_eq!(v.as_i64(), None);
        assert_eq!(v.as_bytes(), None);
    }

    #[test]
    fn codec_is_deterministic() {
        let codec = BincodeCodec;
        let value = Value::Urn(Urn::parse("/C.1/fs").unwrap());
        assert_eq!(codec.encode(&value).unwrap(), codec.encode(&value).unwrap());
        assert_eq!(codec.decode(&codec.encode(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn codec_rejects_garbage() {
        let err = BincodeCodec.decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, TypeError::Serialization(_)));
    }

    #[test]
    fn display_formats() {
        assert_eq!(Value::from(42i64).to_string(), "42");
        assert_eq!(Value::Bytes(vec![0; 3]).to_string(), "<3 bytes>");
        assert_eq!(
            Value::List(vec!["a".into(), "b".into()]).to_string(),
            "[a, b]"
        );
    }
}
