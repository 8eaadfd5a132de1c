//! Serde helpers for byte fields in the JSON codec
//!
//! Payload and blob bytes are base64-encoded in JSON frames so that the text
//! codec stays valid UTF-8. Binary frames never go through these helpers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serializer};

/// Serde module for `Bytes` fields, base64 in JSON.
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S>(val: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(&val[..]))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let v = STANDARD.decode(s).map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(v))
    }
}

/// Serde module for `Option<Bytes>` fields, base64 in JSON.
pub mod option_base64_bytes {
    use super::*;

    pub fn serialize<S>(val: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match val {
            Some(v) => serializer.serialize_some(&STANDARD.encode(&v[..])),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Bytes>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Deserialize::deserialize(deserializer)?;
        match s {
            Some(s) => {
                let v = STANDARD.decode(s).map_err(serde::de::Error::custom)?;
                Ok(Some(Bytes::from(v)))
            }
            None => Ok(None),
        }
    }
}
