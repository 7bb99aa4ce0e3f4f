//! Wire types shared by the query service and its clients.

use crate::identity::DebugIdentity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Location of a structure member.
///
/// `bitfield_offset` is the bit position inside the storage unit at `offset`
/// for bitfield members and `0` otherwise, so "bit 0" and "not a bitfield"
/// share a representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub offset: i64,
    pub bitfield_offset: i64,
}

impl FieldInfo {
    pub fn new(offset: i64, bitfield_offset: i64) -> Self {
        FieldInfo {
            offset,
            bitfield_offset,
        }
    }
}

/// Names requested per structure or enum.
pub type NestedQuery = BTreeMap<String, BTreeSet<String>>;

/// `symbol -> RVA`.
pub type SymbolMap = BTreeMap<String, i64>;
/// `struct -> field -> location`.
pub type StructMap = BTreeMap<String, BTreeMap<String, FieldInfo>>;
/// `enum -> enumerator -> value`.
pub type EnumMap = BTreeMap<String, BTreeMap<String, i64>>;

/// Request body for `POST /symbol`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRequest {
    #[serde(flatten)]
    pub identity: DebugIdentity,
    pub query: BTreeSet<String>,
}

/// Request body for `POST /struct` and `POST /enum`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NestedRequest {
    #[serde(flatten)]
    pub identity: DebugIdentity,
    pub query: NestedQuery,
}

/// GUIDs are case-insensitive on input; archive paths always use uppercase.
pub fn deserialize_unique_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(String::deserialize(deserializer)?.to_ascii_uppercase())
}

/// Deserialize an age that may arrive as a JSON number, a decimal string, or a
/// `0x`-prefixed hex string.
pub fn deserialize_age<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    let val = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| de::Error::custom("age must be an unsigned 32-bit integer")),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u32::from_str_radix(hex, 16).map_err(de::Error::custom)
            } else {
                s.parse::<u32>().map_err(de::Error::custom)
            }
        }
        _ => Err(de::Error::custom("expected number or string for age")),
    }
}
