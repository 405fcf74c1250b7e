//! Tagged header tokens.
//!
//! Every header travels as a token:
//!
//! ```text
//! +---------+---------+------------------------------+
//! | id      | type    | value                        |
//! | u16 LE  | u8      | fixed width or length-prefix |
//! +---------+---------+------------------------------+
//! ```
//!
//! Absent headers are not written at all; there is no padding.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Size of the `id` + `type` prefix of every token.
pub const TOKEN_PREFIX_SIZE: usize = 3;

/// Wire type of a token value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    Byte = 0x00,
    UShort = 0x01,
    ULong = 0x02,
    Long = 0x03,
    ULongLong = 0x04,
    LongLong = 0x05,
    Guid = 0x06,
    SmallString = 0x07,
    String = 0x08,
    ULongString = 0x09,
    SmallBytes = 0x0A,
    Bytes = 0x0B,
    ULongBytes = 0x0C,
    Float = 0x0D,
    Double = 0x0E,
}

impl TokenType {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        let token_type = match value {
            0x00 => TokenType::Byte,
            0x01 => TokenType::UShort,
            0x02 => TokenType::ULong,
            0x03 => TokenType::Long,
            0x04 => TokenType::ULongLong,
            0x05 => TokenType::LongLong,
            0x06 => TokenType::Guid,
            0x07 => TokenType::SmallString,
            0x08 => TokenType::String,
            0x09 => TokenType::ULongString,
            0x0A => TokenType::SmallBytes,
            0x0B => TokenType::Bytes,
            0x0C => TokenType::ULongBytes,
            0x0D => TokenType::Float,
            0x0E => TokenType::Double,
            other => return Err(ProtocolError::UnknownTokenType(other)),
        };
        Ok(token_type)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Maximum payload length for length-prefixed types.
    fn max_len(self) -> Option<usize> {
        match self {
            TokenType::SmallString | TokenType::SmallBytes => Some(u8::MAX as usize),
            TokenType::String | TokenType::Bytes => Some(u16::MAX as usize),
            TokenType::ULongString | TokenType::ULongBytes => Some(u32::MAX as usize),
            _ => None,
        }
    }
}

/// A typed token value.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    Byte(u8),
    UShort(u16),
    ULong(u32),
    Long(i32),
    ULongLong(u64),
    LongLong(i64),
    Guid(Uuid),
    SmallString(String),
    String(String),
    ULongString(String),
    SmallBytes(Bytes),
    Bytes(Bytes),
    ULongBytes(Bytes),
    Float(f32),
    Double(f64),
}

impl TokenValue {
    pub fn token_type(&self) -> TokenType {
        match self {
            TokenValue::Byte(_) => TokenType::Byte,
            TokenValue::UShort(_) => TokenType::UShort,
            TokenValue::ULong(_) => TokenType::ULong,
            TokenValue::Long(_) => TokenType::Long,
            TokenValue::ULongLong(_) => TokenType::ULongLong,
            TokenValue::LongLong(_) => TokenType::LongLong,
            TokenValue::Guid(_) => TokenType::Guid,
            TokenValue::SmallString(_) => TokenType::SmallString,
            TokenValue::String(_) => TokenType::String,
            TokenValue::ULongString(_) => TokenType::ULongString,
            TokenValue::SmallBytes(_) => TokenType::SmallBytes,
            TokenValue::Bytes(_) => TokenType::Bytes,
            TokenValue::ULongBytes(_) => TokenType::ULongBytes,
            TokenValue::Float(_) => TokenType::Float,
            TokenValue::Double(_) => TokenType::Double,
        }
    }

    /// Builds a string token of the given string type.
    pub fn string(token_type: TokenType, value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        match token_type {
            TokenType::SmallString => Some(TokenValue::SmallString(value)),
            TokenType::String => Some(TokenValue::String(value)),
            TokenType::ULongString => Some(TokenValue::ULongString(value)),
            _ => None,
        }
    }

    /// Parses a header's textual value as the given token type.
    ///
    /// Byte-array types accept hex. Returns `None` when the text does not
    /// parse as the requested type.
    pub fn parse(token_type: TokenType, text: &str) -> Option<Self> {
        let value = match token_type {
            TokenType::Byte => TokenValue::Byte(text.parse().ok()?),
            TokenType::UShort => TokenValue::UShort(text.parse().ok()?),
            TokenType::ULong => TokenValue::ULong(text.parse().ok()?),
            TokenType::Long => TokenValue::Long(text.parse().ok()?),
            TokenType::ULongLong => TokenValue::ULongLong(text.parse().ok()?),
            TokenType::LongLong => TokenValue::LongLong(text.parse().ok()?),
            TokenType::Guid => TokenValue::Guid(Uuid::parse_str(text).ok()?),
            TokenType::SmallString | TokenType::String | TokenType::ULongString => {
                return TokenValue::string(token_type, text)
            }
            TokenType::SmallBytes => TokenValue::SmallBytes(hex::decode(text).ok()?.into()),
            TokenType::Bytes => TokenValue::Bytes(hex::decode(text).ok()?.into()),
            TokenType::ULongBytes => TokenValue::ULongBytes(hex::decode(text).ok()?.into()),
            TokenType::Float => TokenValue::Float(text.parse().ok()?),
            TokenType::Double => TokenValue::Double(text.parse().ok()?),
        };
        Some(value)
    }

    /// Renders the value as a header string (inverse of [`TokenValue::parse`]).
    pub fn to_header_string(&self) -> String {
        match self {
            TokenValue::Byte(v) => v.to_string(),
            TokenValue::UShort(v) => v.to_string(),
            TokenValue::ULong(v) => v.to_string(),
            TokenValue::Long(v) => v.to_string(),
            TokenValue::ULongLong(v) => v.to_string(),
            TokenValue::LongLong(v) => v.to_string(),
            TokenValue::Guid(v) => v.hyphenated().to_string(),
            TokenValue::SmallString(v) | TokenValue::String(v) | TokenValue::ULongString(v) => {
                v.clone()
            }
            TokenValue::SmallBytes(v) | TokenValue::Bytes(v) | TokenValue::ULongBytes(v) => {
                hex::encode_upper(v)
            }
            TokenValue::Float(v) => v.to_string(),
            TokenValue::Double(v) => v.to_string(),
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            TokenValue::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            TokenValue::ULong(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TokenValue::SmallString(v) | TokenValue::String(v) | TokenValue::ULongString(v) => {
                Some(v)
            }
            _ => None,
        }
    }

    /// Number of bytes the value occupies on the wire, including any length prefix.
    pub fn encoded_len(&self) -> usize {
        match self {
            TokenValue::Byte(_) => 1,
            TokenValue::UShort(_) => 2,
            TokenValue::ULong(_) | TokenValue::Long(_) | TokenValue::Float(_) => 4,
            TokenValue::ULongLong(_) | TokenValue::LongLong(_) | TokenValue::Double(_) => 8,
            TokenValue::Guid(_) => 16,
            TokenValue::SmallString(v) => 1 + v.len(),
            TokenValue::String(v) => 2 + v.len(),
            TokenValue::ULongString(v) => 4 + v.len(),
            TokenValue::SmallBytes(v) => 1 + v.len(),
            TokenValue::Bytes(v) => 2 + v.len(),
            TokenValue::ULongBytes(v) => 4 + v.len(),
        }
    }

    fn encode(&self, id: u16, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            TokenValue::Byte(v) => buf.put_u8(*v),
            TokenValue::UShort(v) => buf.put_u16_le(*v),
            TokenValue::ULong(v) => buf.put_u32_le(*v),
            TokenValue::Long(v) => buf.put_i32_le(*v),
            TokenValue::ULongLong(v) => buf.put_u64_le(*v),
            TokenValue::LongLong(v) => buf.put_i64_le(*v),
            TokenValue::Guid(v) => buf.put_slice(&v.to_bytes_le()),
            TokenValue::SmallString(v) | TokenValue::String(v) | TokenValue::ULongString(v) => {
                put_length_prefixed(self.token_type(), id, v.as_bytes(), buf)?
            }
            TokenValue::SmallBytes(v) | TokenValue::Bytes(v) | TokenValue::ULongBytes(v) => {
                put_length_prefixed(self.token_type(), id, v, buf)?
            }
            TokenValue::Float(v) => buf.put_f32_le(*v),
            TokenValue::Double(v) => buf.put_f64_le(*v),
        }
        Ok(())
    }

    fn decode(token_type: TokenType, id: u16, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let value = match token_type {
            TokenType::Byte => {
                need(buf, 1)?;
                TokenValue::Byte(buf.get_u8())
            }
            TokenType::UShort => {
                need(buf, 2)?;
                TokenValue::UShort(buf.get_u16_le())
            }
            TokenType::ULong => {
                need(buf, 4)?;
                TokenValue::ULong(buf.get_u32_le())
            }
            TokenType::Long => {
                need(buf, 4)?;
                TokenValue::Long(buf.get_i32_le())
            }
            TokenType::ULongLong => {
                need(buf, 8)?;
                TokenValue::ULongLong(buf.get_u64_le())
            }
            TokenType::LongLong => {
                need(buf, 8)?;
                TokenValue::LongLong(buf.get_i64_le())
            }
            TokenType::Guid => {
                need(buf, 16)?;
                let mut raw = [0u8; 16];
                buf.copy_to_slice(&mut raw);
                TokenValue::Guid(Uuid::from_bytes_le(raw))
            }
            TokenType::SmallString => TokenValue::SmallString(get_string(token_type, id, buf)?),
            TokenType::String => TokenValue::String(get_string(token_type, id, buf)?),
            TokenType::ULongString => TokenValue::ULongString(get_string(token_type, id, buf)?),
            TokenType::SmallBytes => TokenValue::SmallBytes(get_length_prefixed(token_type, buf)?),
            TokenType::Bytes => TokenValue::Bytes(get_length_prefixed(token_type, buf)?),
            TokenType::ULongBytes => TokenValue::ULongBytes(get_length_prefixed(token_type, buf)?),
            TokenType::Float => {
                need(buf, 4)?;
                TokenValue::Float(buf.get_f32_le())
            }
            TokenType::Double => {
                need(buf, 8)?;
                TokenValue::Double(buf.get_f64_le())
            }
        };
        Ok(value)
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        return Err(ProtocolError::Truncated {
            what: "token value",
            needed: n - buf.remaining(),
        });
    }
    Ok(())
}

fn put_length_prefixed(
    token_type: TokenType,
    id: u16,
    value: &[u8],
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let max = token_type.max_len().unwrap_or(u32::MAX as usize);
    if value.len() > max {
        return Err(ProtocolError::ValueTooLong {
            id,
            len: value.len(),
            max,
        });
    }
    match token_type {
        TokenType::SmallString | TokenType::SmallBytes => buf.put_u8(value.len() as u8),
        TokenType::String | TokenType::Bytes => buf.put_u16_le(value.len() as u16),
        _ => buf.put_u32_le(value.len() as u32),
    }
    buf.put_slice(value);
    Ok(())
}

fn get_length_prefixed(token_type: TokenType, buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = match token_type {
        TokenType::SmallString | TokenType::SmallBytes => {
            need(buf, 1)?;
            buf.get_u8() as usize
        }
        TokenType::String | TokenType::Bytes => {
            need(buf, 2)?;
            buf.get_u16_le() as usize
        }
        _ => {
            need(buf, 4)?;
            buf.get_u32_le() as usize
        }
    };
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_string(token_type: TokenType, id: u16, buf: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = get_length_prefixed(token_type, buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(id))
}

/// A single token: id plus typed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub id: u16,
    pub value: TokenValue,
}

/// An ordered block of tokens keyed by id.
///
/// Tokens are written in ascending id order, which is the declared order of
/// the header tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenStream {
    tokens: BTreeMap<u16, TokenValue>,
}

impl TokenStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a token, returning the previous value for the id.
    pub fn insert(&mut self, id: u16, value: TokenValue) -> Option<TokenValue> {
        self.tokens.insert(id, value)
    }

    pub fn get(&self, id: u16) -> Option<&TokenValue> {
        self.tokens.get(&id)
    }

    pub fn remove(&mut self, id: u16) -> Option<TokenValue> {
        self.tokens.remove(&id)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.tokens.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Token> + '_ {
        self.tokens.iter().map(|(id, value)| Token {
            id: *id,
            value: value.clone(),
        })
    }

    pub fn get_u8(&self, id: u16) -> Option<u8> {
        self.get(id).and_then(TokenValue::as_u8)
    }

    pub fn get_u32(&self, id: u16) -> Option<u32> {
        self.get(id).and_then(TokenValue::as_u32)
    }

    pub fn get_str(&self, id: u16) -> Option<&str> {
        self.get(id).and_then(TokenValue::as_str)
    }

    /// Total encoded size of the block.
    pub fn encoded_len(&self) -> usize {
        self.tokens
            .values()
            .map(|value| TOKEN_PREFIX_SIZE + value.encoded_len())
            .sum()
    }

    /// Appends the encoded block to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.reserve(self.encoded_len());
        for (id, value) in &self.tokens {
            buf.put_u16_le(*id);
            buf.put_u8(value.token_type().as_u8());
            value.encode(*id, buf)?;
        }
        Ok(())
    }

    /// Decodes tokens until `buf` is exhausted.
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let mut stream = TokenStream::new();
        while buf.has_remaining() {
            if buf.remaining() < TOKEN_PREFIX_SIZE {
                return Err(ProtocolError::Truncated {
                    what: "token header",
                    needed: TOKEN_PREFIX_SIZE - buf.remaining(),
                });
            }
            let id = buf.get_u16_le();
            let token_type = TokenType::from_u8(buf.get_u8())?;
            let value = TokenValue::decode(token_type, id, &mut buf)?;
            stream.insert(id, value);
        }
        Ok(stream)
    }
}
