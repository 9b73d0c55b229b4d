//! Store-native dump format (magic + crc32c + CBOR body).

use std::collections::BTreeSet;
use std::fmt;

use crc32c::crc32c;
use minicbor::{Decoder, Encoder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::{FieldMap, SortedSet, StoredValue, ValueType};

const DUMP_MAGIC: u32 = 0x4b53_4456; // "KSDV"
const DUMP_HEADER_LEN: usize = 8;
const DUMP_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("dump blob too short ({len} bytes)")]
    TooShort { len: usize },
    #[error("dump magic mismatch: got {got:#010x}")]
    MagicMismatch { got: u32 },
    #[error("dump crc mismatch: expected {expected:#010x}, got {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },
    #[error("dump version {got} unsupported")]
    Version { got: u8 },
    #[error("dump body encode failed: {0}")]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("dump body decode failed: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("dump body invalid: {0}")]
    Invalid(String),
    #[error("dump hex invalid: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Opaque serialized value, as produced by [`crate::store::Store::dump`].
#[derive(Clone, PartialEq, Eq)]
pub struct DumpBlob(Vec<u8>);

impl DumpBlob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_hex(raw: &str) -> Result<Self, DumpError> {
        Ok(Self(hex::decode(raw)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn encode(value: &StoredValue) -> Result<Self, DumpError> {
        let body = encode_body(value)?;
        let mut buf = Vec::with_capacity(DUMP_HEADER_LEN + body.len());
        buf.extend_from_slice(&DUMP_MAGIC.to_le_bytes());
        buf.extend_from_slice(&crc32c(&body).to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(Self(buf))
    }

    pub fn decode(&self) -> Result<StoredValue, DumpError> {
        let bytes = &self.0;
        if bytes.len() <= DUMP_HEADER_LEN {
            return Err(DumpError::TooShort { len: bytes.len() });
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != DUMP_MAGIC {
            return Err(DumpError::MagicMismatch { got: magic });
        }
        let expected = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let body = &bytes[DUMP_HEADER_LEN..];
        let got = crc32c(body);
        if got != expected {
            return Err(DumpError::CrcMismatch { expected, got });
        }
        decode_body(body)
    }

    /// Value type recorded in the blob, without a full decode of the payload.
    pub fn value_type(&self) -> Result<ValueType, DumpError> {
        Ok(self.decode()?.value_type())
    }
}

impl fmt::Debug for DumpBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DumpBlob({} bytes)", self.0.len())
    }
}

impl Serialize for DumpBlob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DumpBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DumpBlob::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

fn encode_body(value: &StoredValue) -> Result<Vec<u8>, DumpError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.array(3)?;
    enc.u8(DUMP_VERSION)?;
    enc.str(value.value_type().as_str())?;
    match value {
        StoredValue::String(s) => {
            enc.str(s)?;
        }
        StoredValue::Hash(fields) => {
            enc.map(fields.len() as u64)?;
            for (field, value) in fields {
                enc.str(field)?;
                enc.str(value)?;
            }
        }
        StoredValue::Zset(set) => {
            let ordered = set.ordered();
            enc.array(ordered.len() as u64)?;
            for (member, score) in &ordered {
                enc.array(2)?;
                enc.str(member)?;
                enc.f64(*score)?;
            }
        }
        StoredValue::Set(members) => {
            enc.array(members.len() as u64)?;
            for member in members {
                enc.str(member)?;
            }
        }
    }
    Ok(buf)
}

fn decode_body(body: &[u8]) -> Result<StoredValue, DumpError> {
    let mut dec = Decoder::new(body);
    let len = definite(dec.array()?, "envelope")?;
    if len != 3 {
        return Err(DumpError::Invalid(format!(
            "envelope must have 3 items, got {len}"
        )));
    }
    let version = dec.u8()?;
    if version != DUMP_VERSION {
        return Err(DumpError::Version { got: version });
    }
    let value_type: ValueType = dec.str()?.parse().map_err(DumpError::Invalid)?;
    let value = match value_type {
        ValueType::String => StoredValue::String(dec.str()?.to_string()),
        ValueType::Hash => {
            let len = definite(dec.map()?, "hash")?;
            let mut fields = FieldMap::new();
            for _ in 0..len {
                let field = dec.str()?.to_string();
                let value = dec.str()?.to_string();
                fields.insert(field, value);
            }
            StoredValue::Hash(fields)
        }
        ValueType::Zset => {
            let len = definite(dec.array()?, "zset")?;
            let mut set = SortedSet::new();
            for _ in 0..len {
                if definite(dec.array()?, "zset entry")? != 2 {
                    return Err(DumpError::Invalid("zset entry must be a pair".into()));
                }
                let member = dec.str()?.to_string();
                let score = dec.f64()?;
                set.insert(&member, score);
            }
            StoredValue::Zset(set)
        }
        ValueType::Set => {
            let len = definite(dec.array()?, "set")?;
            let mut members = BTreeSet::new();
            for _ in 0..len {
                members.insert(dec.str()?.to_string());
            }
            StoredValue::Set(members)
        }
    };
    Ok(value)
}

fn definite(len: Option<u64>, what: &str) -> Result<u64, DumpError> {
    len.ok_or_else(|| DumpError::Invalid(format!("{what} must be definite-length")))
}
