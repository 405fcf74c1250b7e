//! Declared header tables.
//!
//! Each logical header (an HTTP-style lowercase name) maps to exactly one
//! token id and wire type. Tables are declared in ascending id order, which
//! is also the order tokens are written. Headers not present in a table are
//! not transmitted.

use crate::error::ProtocolError;
use crate::token::{TokenStream, TokenType, TokenValue};
use std::collections::HashMap;

/// How a logical header value is converted to its token value.
#[derive(Debug, Clone, Copy)]
pub enum HeaderEncoding {
    /// Parsed directly as the token type.
    Value,
    /// `true`/`false` carried as a byte.
    Bool,
    /// Closed set of names carried as a byte code.
    Enum(&'static [(&'static str, u8)]),
    /// Page size where `-1` means "server decides".
    PageSize,
}

/// Declaration of one header.
#[derive(Debug, Clone, Copy)]
pub struct HeaderSpec {
    pub id: u16,
    pub name: &'static str,
    pub token_type: TokenType,
    pub encoding: HeaderEncoding,
}

impl HeaderSpec {
    const fn value(id: u16, name: &'static str, token_type: TokenType) -> Self {
        Self {
            id,
            name,
            token_type,
            encoding: HeaderEncoding::Value,
        }
    }

    const fn flag(id: u16, name: &'static str) -> Self {
        Self {
            id,
            name,
            token_type: TokenType::Byte,
            encoding: HeaderEncoding::Bool,
        }
    }

    const fn enumeration(
        id: u16,
        name: &'static str,
        values: &'static [(&'static str, u8)],
    ) -> Self {
        Self {
            id,
            name,
            token_type: TokenType::Byte,
            encoding: HeaderEncoding::Enum(values),
        }
    }

    /// Converts a logical header value into its token value.
    pub fn to_token(&self, value: &str) -> Result<TokenValue, ProtocolError> {
        match self.encoding {
            HeaderEncoding::Value => TokenValue::parse(self.token_type, value).ok_or_else(|| {
                ProtocolError::InvalidHeaderValue {
                    name: self.name.to_string(),
                    value: value.to_string(),
                    expected: self.token_type,
                }
            }),
            HeaderEncoding::Bool => {
                if value.eq_ignore_ascii_case("true") {
                    Ok(TokenValue::Byte(1))
                } else if value.eq_ignore_ascii_case("false") {
                    Ok(TokenValue::Byte(0))
                } else {
                    Err(ProtocolError::InvalidHeaderValue {
                        name: self.name.to_string(),
                        value: value.to_string(),
                        expected: self.token_type,
                    })
                }
            }
            HeaderEncoding::Enum(values) => values
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(value))
                .map(|(_, code)| TokenValue::Byte(*code))
                .ok_or_else(|| ProtocolError::UnsupportedEnumValue {
                    name: self.name.to_string(),
                    value: value.to_string(),
                }),
            HeaderEncoding::PageSize => {
                if value == "-1" {
                    return Ok(TokenValue::ULong(u32::MAX));
                }
                TokenValue::parse(TokenType::ULong, value).ok_or_else(|| {
                    ProtocolError::InvalidHeaderValue {
                        name: self.name.to_string(),
                        value: value.to_string(),
                        expected: TokenType::ULong,
                    }
                })
            }
        }
    }

    /// Converts a token value back into its logical header value.
    ///
    /// Returns `None` if the token's wire type does not match the
    /// declaration or the code is unknown.
    pub fn to_header(&self, value: &TokenValue) -> Option<String> {
        if value.token_type() != self.token_type {
            return None;
        }
        match self.encoding {
            HeaderEncoding::Value => Some(value.to_header_string()),
            HeaderEncoding::Bool => match value.as_u8()? {
                0 => Some("false".to_string()),
                _ => Some("true".to_string()),
            },
            HeaderEncoding::Enum(values) => {
                let code = value.as_u8()?;
                values
                    .iter()
                    .find(|(_, c)| *c == code)
                    .map(|(name, _)| name.to_string())
            }
            HeaderEncoding::PageSize => match value.as_u32()? {
                u32::MAX => Some("-1".to_string()),
                n => Some(n.to_string()),
            },
        }
    }
}

pub const CONSISTENCY_LEVELS: &[(&str, u8)] = &[
    ("Strong", 0x00),
    ("BoundedStaleness", 0x01),
    ("Session", 0x02),
    ("Eventual", 0x03),
    ("ConsistentPrefix", 0x04),
];

pub const INDEXING_DIRECTIVES: &[(&str, u8)] =
    &[("Default", 0x00), ("Exclude", 0x01), ("Include", 0x02)];

/// Request token ids.
pub mod request_token {
    pub const AUTHORIZATION: u16 = 0x0001;
    pub const PAYLOAD_PRESENT: u16 = 0x0002;
    pub const DATE: u16 = 0x0003;
    pub const PAGE_SIZE: u16 = 0x0004;
    pub const SESSION_TOKEN: u16 = 0x0005;
    pub const CONTINUATION: u16 = 0x0006;
    pub const INDEXING_DIRECTIVE: u16 = 0x0007;
    pub const MATCH: u16 = 0x0008;
    pub const CONSISTENCY_LEVEL: u16 = 0x0010;
    pub const REPLICA_PATH: u16 = 0x0013;
    pub const CLIENT_VERSION: u16 = 0x0028;
    pub const PARTITION_KEY: u16 = 0x002B;
    pub const PARTITION_KEY_RANGE_ID: u16 = 0x002C;
    pub const TIME_TO_LIVE: u16 = 0x0047;
    pub const TARGET_LSN: u16 = 0x004A;
    pub const TARGET_GLOBAL_COMMITTED_LSN: u16 = 0x004B;
    pub const TRANSPORT_REQUEST_ID: u16 = 0x0052;
    pub const THROUGHPUT_FRACTION: u16 = 0x0062;
}

/// Response token ids.
pub mod response_token {
    pub const PAYLOAD_PRESENT: u16 = 0x0000;
    pub const LAST_MODIFIED: u16 = 0x0002;
    pub const ETAG: u16 = 0x0003;
    pub const CONTINUATION: u16 = 0x0006;
    pub const RETRY_AFTER_MS: u16 = 0x0008;
    pub const ITEM_COUNT: u16 = 0x0009;
    pub const REQUEST_CHARGE: u16 = 0x000A;
    pub const LSN: u16 = 0x0013;
    pub const SUB_STATUS: u16 = 0x001C;
    pub const GLOBAL_COMMITTED_LSN: u16 = 0x0020;
    pub const SESSION_TOKEN: u16 = 0x0023;
    pub const PARTITION_KEY_RANGE_ID: u16 = 0x0024;
    pub const ITEM_LSN: u16 = 0x0029;
    pub const TRANSPORT_REQUEST_ID: u16 = 0x0035;
    pub const REQUEST_DURATION_MS: u16 = 0x003E;
    pub const QUORUM_ACKED_LSN: u16 = 0x0040;
    pub const CURRENT_WRITE_QUORUM: u16 = 0x0041;
    pub const CURRENT_REPLICA_SET_SIZE: u16 = 0x0042;
}

/// Logical request headers, in id order. Framing tokens (payload presence,
/// replica path, transport request id) are set by the encoder and are not
/// listed here.
pub static REQUEST_HEADERS: &[HeaderSpec] = &[
    HeaderSpec::value(request_token::AUTHORIZATION, "authorization", TokenType::String),
    HeaderSpec::value(request_token::DATE, "x-ms-date", TokenType::SmallString),
    HeaderSpec {
        id: request_token::PAGE_SIZE,
        name: "x-ms-max-item-count",
        token_type: TokenType::ULong,
        encoding: HeaderEncoding::PageSize,
    },
    HeaderSpec::value(request_token::SESSION_TOKEN, "x-ms-session-token", TokenType::String),
    HeaderSpec::value(request_token::CONTINUATION, "x-ms-continuation", TokenType::String),
    HeaderSpec::enumeration(
        request_token::INDEXING_DIRECTIVE,
        "x-ms-indexing-directive",
        INDEXING_DIRECTIVES,
    ),
    HeaderSpec::value(request_token::MATCH, "if-match", TokenType::String),
    HeaderSpec::value(0x0009, "x-ms-documentdb-pre-trigger-include", TokenType::String),
    HeaderSpec::value(0x000A, "x-ms-documentdb-post-trigger-include", TokenType::String),
    HeaderSpec::flag(0x000B, "x-ms-is-fanout-request"),
    HeaderSpec::value(0x000C, "x-ms-collection-partition-index", TokenType::ULong),
    HeaderSpec::value(0x000D, "x-ms-collection-service-index", TokenType::ULong),
    HeaderSpec::enumeration(
        request_token::CONSISTENCY_LEVEL,
        "x-ms-consistency-level",
        CONSISTENCY_LEVELS,
    ),
    HeaderSpec::value(0x0014, "x-ms-documentdb-expiry-seconds", TokenType::ULong),
    HeaderSpec::flag(0x001E, "x-ms-documentdb-query-enable-scan"),
    HeaderSpec::flag(0x001F, "x-ms-documentdb-query-emit-traces"),
    HeaderSpec::flag(0x0026, "x-ms-profile-request"),
    HeaderSpec::value(
        request_token::CLIENT_VERSION,
        "x-ms-client-version",
        TokenType::SmallString,
    ),
    HeaderSpec::flag(0x0029, "x-ms-cancharge"),
    HeaderSpec::flag(0x002A, "x-ms-canthrottle"),
    HeaderSpec::value(
        request_token::PARTITION_KEY,
        "x-ms-documentdb-partitionkey",
        TokenType::String,
    ),
    HeaderSpec::value(
        request_token::PARTITION_KEY_RANGE_ID,
        "x-ms-documentdb-partitionkeyrangeid",
        TokenType::String,
    ),
    HeaderSpec::value(0x003F, "a-im", TokenType::String),
    HeaderSpec::flag(0x0040, "x-ms-documentdb-populatequotainfo"),
    HeaderSpec::value(request_token::TIME_TO_LIVE, "x-ms-time-to-live", TokenType::Long),
    HeaderSpec::value(request_token::TARGET_LSN, "x-ms-target-lsn", TokenType::LongLong),
    HeaderSpec::value(
        request_token::TARGET_GLOBAL_COMMITTED_LSN,
        "x-ms-target-global-committed-lsn",
        TokenType::LongLong,
    ),
    HeaderSpec::value(
        request_token::THROUGHPUT_FRACTION,
        "x-ms-offer-throughput-fraction",
        TokenType::Double,
    ),
];

/// Logical response headers, in id order.
pub static RESPONSE_HEADERS: &[HeaderSpec] = &[
    HeaderSpec::value(response_token::LAST_MODIFIED, "last-modified", TokenType::SmallString),
    HeaderSpec::value(response_token::ETAG, "etag", TokenType::SmallString),
    HeaderSpec::value(0x0004, "x-ms-resource-quota", TokenType::String),
    HeaderSpec::value(0x0005, "x-ms-resource-usage", TokenType::String),
    HeaderSpec::value(response_token::CONTINUATION, "x-ms-continuation", TokenType::String),
    HeaderSpec::value(0x0007, "x-ms-schemaversion", TokenType::SmallString),
    HeaderSpec::value(response_token::RETRY_AFTER_MS, "x-ms-retry-after-ms", TokenType::ULong),
    HeaderSpec::value(response_token::ITEM_COUNT, "x-ms-item-count", TokenType::ULong),
    HeaderSpec::value(
        response_token::REQUEST_CHARGE,
        "x-ms-request-charge",
        TokenType::Double,
    ),
    HeaderSpec::value(response_token::LSN, "lsn", TokenType::LongLong),
    HeaderSpec::value(response_token::SUB_STATUS, "x-ms-substatus", TokenType::ULong),
    HeaderSpec::value(
        response_token::GLOBAL_COMMITTED_LSN,
        "x-ms-global-committed-lsn",
        TokenType::LongLong,
    ),
    HeaderSpec::value(0x0021, "x-ms-number-of-read-regions", TokenType::ULong),
    HeaderSpec::value(
        response_token::SESSION_TOKEN,
        "x-ms-session-token",
        TokenType::String,
    ),
    HeaderSpec::value(
        response_token::PARTITION_KEY_RANGE_ID,
        "x-ms-documentdb-partitionkeyrangeid",
        TokenType::String,
    ),
    HeaderSpec::value(response_token::ITEM_LSN, "x-ms-item-lsn", TokenType::LongLong),
    HeaderSpec::value(
        response_token::REQUEST_DURATION_MS,
        "x-ms-request-duration-ms",
        TokenType::Double,
    ),
    HeaderSpec::value(
        response_token::QUORUM_ACKED_LSN,
        "x-ms-quorum-acked-lsn",
        TokenType::LongLong,
    ),
    HeaderSpec::value(
        response_token::CURRENT_WRITE_QUORUM,
        "x-ms-current-write-quorum",
        TokenType::ULong,
    ),
    HeaderSpec::value(
        response_token::CURRENT_REPLICA_SET_SIZE,
        "x-ms-current-replica-set-size",
        TokenType::ULong,
    ),
];

fn encode_headers(
    table: &[HeaderSpec],
    headers: &HashMap<String, String>,
) -> Result<TokenStream, ProtocolError> {
    let mut tokens = TokenStream::new();
    for spec in table {
        if let Some(value) = headers.get(spec.name) {
            tokens.insert(spec.id, spec.to_token(value)?);
        }
    }
    Ok(tokens)
}

fn decode_headers(table: &[HeaderSpec], tokens: &TokenStream) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for spec in table {
        if let Some(value) = tokens.get(spec.id).and_then(|v| spec.to_header(v)) {
            headers.insert(spec.name.to_string(), value);
        }
    }
    headers
}

/// Converts logical request headers into tokens, in declared order.
pub fn encode_request_headers(
    headers: &HashMap<String, String>,
) -> Result<TokenStream, ProtocolError> {
    encode_headers(REQUEST_HEADERS, headers)
}

/// Converts request tokens back into logical headers.
pub fn decode_request_headers(tokens: &TokenStream) -> HashMap<String, String> {
    decode_headers(REQUEST_HEADERS, tokens)
}

/// Converts logical response headers into tokens, in declared order.
pub fn encode_response_headers(
    headers: &HashMap<String, String>,
) -> Result<TokenStream, ProtocolError> {
    encode_headers(RESPONSE_HEADERS, headers)
}

/// Converts response tokens back into logical headers.
pub fn decode_response_headers(tokens: &TokenStream) -> HashMap<String, String> {
    decode_headers(RESPONSE_HEADERS, tokens)
}

/// Looks up a request header declaration by name.
pub fn request_header(name: &str) -> Option<&'static HeaderSpec> {
    REQUEST_HEADERS.iter().find(|spec| spec.name == name)
}
