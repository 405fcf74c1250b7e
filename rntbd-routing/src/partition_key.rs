//! Partition key values and effective partition key computation.
//!
//! Every component has two encodings: a hashing encoding fed to MurmurHash3
//! for hash-partitioned collections, and an order-preserving binary
//! encoding whose uppercase hex form sorts, under ordinal comparison, in
//! the same order as the components themselves (type marker first, then
//! value). Both encodings must stay byte-for-byte compatible with the
//! server fleet.

use crate::error::RoutingError;
use crate::murmur::{murmur3_128, murmur3_32};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;

/// Lowest effective partition key.
pub const MIN_INCLUSIVE_EFFECTIVE_PARTITION_KEY: &str = "";

/// Upper bound (exclusive) of the effective partition key space.
pub const MAX_EXCLUSIVE_EFFECTIVE_PARTITION_KEY: &str = "FF";

/// Strings longer than this many UTF-16 units are truncated before v1 hashing.
const MAX_STRING_CHARS: usize = 100;

/// Strings longer than this many UTF-8 bytes are cut (without terminator)
/// in the binary encoding.
const MAX_STRING_BYTES_TO_APPEND: usize = 100;

/// Type markers, in sort order.
pub mod marker {
    pub const UNDEFINED: u8 = 0x00;
    pub const NULL: u8 = 0x01;
    pub const FALSE: u8 = 0x02;
    pub const TRUE: u8 = 0x03;
    pub const MIN_NUMBER: u8 = 0x04;
    pub const NUMBER: u8 = 0x05;
    pub const MAX_NUMBER: u8 = 0x06;
    pub const MIN_STRING: u8 = 0x07;
    pub const STRING: u8 = 0x08;
    pub const MAX_STRING: u8 = 0x09;
    pub const INFINITY: u8 = 0xFF;
}

/// One value of a (possibly hierarchical) partition key.
#[derive(Debug, Clone)]
pub enum PartitionKeyComponent {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    MinNumber,
    MaxNumber,
    MinString,
    MaxString,
    Infinity,
}

impl PartitionKeyComponent {
    pub fn type_marker(&self) -> u8 {
        match self {
            PartitionKeyComponent::Undefined => marker::UNDEFINED,
            PartitionKeyComponent::Null => marker::NULL,
            PartitionKeyComponent::Bool(false) => marker::FALSE,
            PartitionKeyComponent::Bool(true) => marker::TRUE,
            PartitionKeyComponent::MinNumber => marker::MIN_NUMBER,
            PartitionKeyComponent::Number(_) => marker::NUMBER,
            PartitionKeyComponent::MaxNumber => marker::MAX_NUMBER,
            PartitionKeyComponent::MinString => marker::MIN_STRING,
            PartitionKeyComponent::String(_) => marker::STRING,
            PartitionKeyComponent::MaxString => marker::MAX_STRING,
            PartitionKeyComponent::Infinity => marker::INFINITY,
        }
    }

    fn sentinel_name(&self) -> Option<&'static str> {
        match self {
            PartitionKeyComponent::MinNumber => Some("MinNumber"),
            PartitionKeyComponent::MaxNumber => Some("MaxNumber"),
            PartitionKeyComponent::MinString => Some("MinString"),
            PartitionKeyComponent::MaxString => Some("MaxString"),
            PartitionKeyComponent::Infinity => Some("Infinity"),
            _ => None,
        }
    }

    /// v1 hashing encoding. Strings are NUL-terminated.
    pub fn write_for_hashing(&self, out: &mut Vec<u8>) -> Result<(), RoutingError> {
        self.write_hash_bytes(out, 0x00)
    }

    /// v2 hashing encoding. Strings are terminated with 0xFF.
    pub fn write_for_hashing_v2(&self, out: &mut Vec<u8>) -> Result<(), RoutingError> {
        self.write_hash_bytes(out, 0xFF)
    }

    fn write_hash_bytes(&self, out: &mut Vec<u8>, string_terminator: u8) -> Result<(), RoutingError> {
        match self {
            PartitionKeyComponent::Undefined
            | PartitionKeyComponent::Null
            | PartitionKeyComponent::Bool(_) => out.push(self.type_marker()),
            PartitionKeyComponent::Number(value) => {
                out.push(marker::NUMBER);
                out.extend_from_slice(&value.to_le_bytes());
            }
            PartitionKeyComponent::String(value) => {
                out.push(marker::STRING);
                out.extend_from_slice(value.as_bytes());
                out.push(string_terminator);
            }
            other => {
                return Err(RoutingError::UnhashableComponent(
                    other.sentinel_name().unwrap_or("sentinel"),
                ))
            }
        }
        Ok(())
    }

    /// Order-preserving binary encoding.
    pub fn write_for_binary_encoding(&self, out: &mut Vec<u8>) {
        match self {
            PartitionKeyComponent::Number(value) => write_number_binary(*value, out),
            PartitionKeyComponent::String(value) => {
                out.push(marker::STRING);
                let bytes = value.as_bytes();
                let short = bytes.len() <= MAX_STRING_BYTES_TO_APPEND;
                let take = if short {
                    bytes.len()
                } else {
                    MAX_STRING_BYTES_TO_APPEND + 1
                };
                out.extend(bytes[..take].iter().map(|b| b.saturating_add(1)));
                if short {
                    out.push(0x00);
                }
            }
            other => out.push(other.type_marker()),
        }
    }

    /// Copy with strings cut to the v1 hashing limit.
    pub fn truncate(&self) -> Self {
        match self {
            PartitionKeyComponent::String(value) => {
                PartitionKeyComponent::String(truncate_utf16(value, MAX_STRING_CHARS))
            }
            other => other.clone(),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            PartitionKeyComponent::Undefined => json!({}),
            PartitionKeyComponent::Null => Value::Null,
            PartitionKeyComponent::Bool(b) => Value::Bool(*b),
            PartitionKeyComponent::Number(n) => json!(n),
            PartitionKeyComponent::String(s) => Value::String(s.clone()),
            other => json!({ "type": other.sentinel_name().unwrap_or_default() }),
        }
    }

    fn from_json(value: &Value) -> Result<Self, RoutingError> {
        let component = match value {
            Value::Null => PartitionKeyComponent::Null,
            Value::Bool(b) => PartitionKeyComponent::Bool(*b),
            Value::Number(n) => PartitionKeyComponent::Number(n.as_f64().ok_or_else(|| {
                RoutingError::InvalidPartitionKey(format!("number {n} is not representable"))
            })?),
            Value::String(s) => PartitionKeyComponent::String(s.clone()),
            Value::Object(map) if map.is_empty() => PartitionKeyComponent::Undefined,
            Value::Object(map) => match map.get("type").and_then(Value::as_str) {
                Some("MinNumber") => PartitionKeyComponent::MinNumber,
                Some("MaxNumber") => PartitionKeyComponent::MaxNumber,
                Some("MinString") => PartitionKeyComponent::MinString,
                Some("MaxString") => PartitionKeyComponent::MaxString,
                Some("Infinity") => PartitionKeyComponent::Infinity,
                _ => {
                    return Err(RoutingError::InvalidPartitionKey(format!(
                        "unsupported component {value}"
                    )))
                }
            },
            Value::Array(_) => {
                return Err(RoutingError::InvalidPartitionKey(
                    "nested arrays are not partition key components".to_string(),
                ))
            }
        };
        Ok(component)
    }
}

impl PartialEq for PartitionKeyComponent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PartitionKeyComponent {}

impl PartialOrd for PartitionKeyComponent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PartitionKeyComponent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.type_marker()
            .cmp(&other.type_marker())
            .then_with(|| match (self, other) {
                (PartitionKeyComponent::Number(a), PartitionKeyComponent::Number(b)) => {
                    if a == b {
                        Ordering::Equal
                    } else {
                        a.total_cmp(b)
                    }
                }
                (PartitionKeyComponent::String(a), PartitionKeyComponent::String(b)) => a.cmp(b),
                _ => Ordering::Equal,
            })
    }
}

/// Keeps the first `max_units` UTF-16 code units. A surrogate pair cut in
/// half leaves its high surrogate behind, which hashes as U+FFFD once the
/// string is UTF-8 encoded.
fn truncate_utf16(value: &str, max_units: usize) -> String {
    let mut units = 0;
    for (idx, ch) in value.char_indices() {
        let width = ch.len_utf16();
        if units + width > max_units {
            let mut truncated = value[..idx].to_string();
            if units < max_units {
                truncated.push(char::REPLACEMENT_CHARACTER);
            }
            return truncated;
        }
        units += width;
    }
    value.to_string()
}

/// Maps a double onto a u64 whose unsigned order matches numeric order.
fn encode_double_as_u64(value: f64) -> u64 {
    const SIGN: u64 = 0x8000_0000_0000_0000;
    let bits = value.to_bits();
    if bits < SIGN {
        bits ^ SIGN
    } else {
        (!bits).wrapping_add(1)
    }
}

/// Writes a number as its marker, the top byte of the order-preserving
/// payload, then 7-bit groups where every byte but the last has its low bit
/// set.
fn write_number_binary(value: f64, out: &mut Vec<u8>) {
    out.push(marker::NUMBER);
    let mut payload = encode_double_as_u64(value);
    out.push((payload >> 56) as u8);
    payload <<= 8;

    let mut byte = ((payload >> 56) as u8) | 0x01;
    payload <<= 7;
    while payload != 0 {
        out.push(byte);
        byte = ((payload >> 56) as u8) | 0x01;
        payload <<= 7;
    }
    out.push(byte & 0xFE);
}

/// Partitioning scheme of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartitionKind {
    #[default]
    Hash,
    Range,
    MultiHash,
}

/// Hash layout of a hash-partitioned collection. Serialized as `1` or `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PartitionKeyDefinitionVersion {
    #[default]
    V1,
    V2,
}

impl TryFrom<u8> for PartitionKeyDefinitionVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PartitionKeyDefinitionVersion::V1),
            2 => Ok(PartitionKeyDefinitionVersion::V2),
            other => Err(format!("unsupported partition key version {other}")),
        }
    }
}

impl From<PartitionKeyDefinitionVersion> for u8 {
    fn from(version: PartitionKeyDefinitionVersion) -> Self {
        match version {
            PartitionKeyDefinitionVersion::V1 => 1,
            PartitionKeyDefinitionVersion::V2 => 2,
        }
    }
}

/// Collection partitioning metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKeyDefinition {
    pub paths: Vec<String>,
    #[serde(default)]
    pub kind: PartitionKind,
    #[serde(default)]
    pub version: PartitionKeyDefinitionVersion,
}

impl PartitionKeyDefinition {
    pub fn hash(path: impl Into<String>, version: PartitionKeyDefinitionVersion) -> Self {
        Self {
            paths: vec![path.into()],
            kind: PartitionKind::Hash,
            version,
        }
    }

    pub fn multi_hash(paths: Vec<String>) -> Self {
        Self {
            paths,
            kind: PartitionKind::MultiHash,
            version: PartitionKeyDefinitionVersion::V2,
        }
    }

    pub fn range(path: impl Into<String>) -> Self {
        Self {
            paths: vec![path.into()],
            kind: PartitionKind::Range,
            version: PartitionKeyDefinitionVersion::V1,
        }
    }
}

/// An ordered tuple of partition key components.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartitionKeyInternal {
    components: Vec<PartitionKeyComponent>,
}

impl PartitionKeyInternal {
    pub fn new(components: Vec<PartitionKeyComponent>) -> Self {
        Self { components }
    }

    /// The key with no components; maps to the start of the key space.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// The key past every other key; maps to the end of the key space.
    pub fn infinity() -> Self {
        Self::new(vec![PartitionKeyComponent::Infinity])
    }

    pub fn components(&self) -> &[PartitionKeyComponent] {
        &self.components
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn is_infinity(&self) -> bool {
        matches!(self.components.as_slice(), [PartitionKeyComponent::Infinity])
    }

    /// Parses the JSON form: an array of components, or the string
    /// `"Infinity"`.
    pub fn from_json(text: &str) -> Result<Self, RoutingError> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Array(items) => items
                .iter()
                .map(PartitionKeyComponent::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::new),
            Value::String(s) if s == "Infinity" => Ok(Self::infinity()),
            other => Err(RoutingError::InvalidPartitionKey(format!(
                "expected an array, got {other}"
            ))),
        }
    }

    pub fn to_json(&self) -> String {
        if self.is_infinity() {
            return Value::String("Infinity".to_string()).to_string();
        }
        Value::Array(self.components.iter().map(PartitionKeyComponent::to_json).collect())
            .to_string()
    }

    /// Uppercase hex of the concatenated binary encodings.
    pub fn to_hex_encoded_binary_string(&self) -> String {
        hex_encoded_binary(&self.components)
    }

    /// Effective partition key under `definition`.
    pub fn effective_partition_key(
        &self,
        definition: &PartitionKeyDefinition,
    ) -> Result<String, RoutingError> {
        if self.is_empty() {
            return Ok(MIN_INCLUSIVE_EFFECTIVE_PARTITION_KEY.to_string());
        }
        if self.is_infinity() {
            return Ok(MAX_EXCLUSIVE_EFFECTIVE_PARTITION_KEY.to_string());
        }
        if self.components.len() > definition.paths.len() {
            return Err(RoutingError::TooManyComponents {
                components: self.components.len(),
                paths: definition.paths.len(),
            });
        }
        let partial = self.components.len() < definition.paths.len();
        if partial && definition.kind != PartitionKind::MultiHash {
            return Ok(self.to_hex_encoded_binary_string());
        }

        match definition.kind {
            PartitionKind::Hash => match definition.version {
                PartitionKeyDefinitionVersion::V1 => self.effective_partition_key_v1(),
                PartitionKeyDefinitionVersion::V2 => self.effective_partition_key_v2(),
            },
            PartitionKind::MultiHash => self.effective_partition_key_multi_hash(),
            PartitionKind::Range => Ok(self.to_hex_encoded_binary_string()),
        }
    }

    fn effective_partition_key_v1(&self) -> Result<String, RoutingError> {
        let truncated: Vec<_> = self.components.iter().map(|c| c.truncate()).collect();
        let mut bytes = Vec::new();
        for component in &truncated {
            component.write_for_hashing(&mut bytes)?;
        }
        let hash = murmur3_32(&bytes, 0);

        let mut prefixed = Vec::with_capacity(truncated.len() + 1);
        prefixed.push(PartitionKeyComponent::Number(f64::from(hash)));
        prefixed.extend(truncated);
        Ok(hex_encoded_binary(&prefixed))
    }

    fn effective_partition_key_v2(&self) -> Result<String, RoutingError> {
        let mut bytes = Vec::new();
        for component in &self.components {
            component.write_for_hashing_v2(&mut bytes)?;
        }
        Ok(v2_hash_hex(&bytes))
    }

    fn effective_partition_key_multi_hash(&self) -> Result<String, RoutingError> {
        let mut epk = String::with_capacity(self.components.len() * 32);
        for component in &self.components {
            let mut bytes = Vec::new();
            component.write_for_hashing_v2(&mut bytes)?;
            epk.push_str(&v2_hash_hex(&bytes));
        }
        Ok(epk)
    }
}

fn hex_encoded_binary(components: &[PartitionKeyComponent]) -> String {
    let mut bytes = Vec::new();
    for component in components {
        component.write_for_binary_encoding(&mut bytes);
    }
    hex::encode_upper(bytes)
}

/// 128-bit hash as big-endian h2 then h1, with the top two bits cleared so
/// the value stays below the reserved upper key space.
fn v2_hash_hex(bytes: &[u8]) -> String {
    let mut hash = murmur3_128(bytes, 0).to_be_bytes();
    hash[0] &= 0x3F;
    hex::encode_upper(hash)
}
