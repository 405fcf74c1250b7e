//! Protocol error types and response status codes.

use crate::token::TokenType;
use std::fmt;
use thiserror::Error;

/// Protocol-level errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated {what}: need {needed} more bytes")]
    Truncated { what: &'static str, needed: usize },

    #[error("unknown token type {0:#04x}")]
    UnknownTokenType(u8),

    #[error("invalid value {value:?} for header '{name}': expected {expected:?}")]
    InvalidHeaderValue {
        name: String,
        value: String,
        expected: TokenType,
    },

    #[error("unsupported value {value:?} for header '{name}'")]
    UnsupportedEnumValue { name: String, value: String },

    #[error("token {id:#06x} value is {len} bytes (max {max})")]
    ValueTooLong { id: u16, len: usize, max: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("invalid frame length {length} (minimum {minimum})")]
    InvalidFrameLength { length: u32, minimum: u32 },

    #[error("unknown resource type {0:#06x}")]
    UnknownResourceType(u16),

    #[error("unknown operation type {0:#06x}")]
    UnknownOperationType(u16),

    #[error("missing required token: {0}")]
    MissingToken(&'static str),

    #[error("invalid UTF-8 in token {0:#06x}")]
    InvalidUtf8(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether this error was raised while validating caller input,
    /// before anything reached the wire.
    pub fn is_local_validation(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidHeaderValue { .. }
                | ProtocolError::UnsupportedEnumValue { .. }
                | ProtocolError::ValueTooLong { .. }
                | ProtocolError::FrameTooLarge { .. }
        )
    }
}

/// Response status carried in the response preamble.
///
/// Values follow HTTP semantics; the constants below are the ones the
/// transport inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const CONFLICT: StatusCode = StatusCode(409);
    pub const GONE: StatusCode = StatusCode(410);
    pub const PRECONDITION_FAILED: StatusCode = StatusCode(412);
    pub const ENTITY_TOO_LARGE: StatusCode = StatusCode(413);
    pub const TOO_MANY_REQUESTS: StatusCode = StatusCode(429);
    pub const RETRY_WITH: StatusCode = StatusCode(449);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    /// 2xx or 3xx; the acceptance range for context negotiation.
    pub fn is_success_or_redirect(&self) -> bool {
        (200..400).contains(&self.0)
    }

    /// Returns whether the server signalled a transient condition.
    pub fn is_retryable(&self) -> bool {
        matches!(self.0, 408 | 410 | 429 | 449 | 503)
    }

    /// Canonical name for the well-known codes.
    pub fn name(&self) -> Option<&'static str> {
        let name = match self.0 {
            200 => "OK",
            201 => "CREATED",
            204 => "NO_CONTENT",
            304 => "NOT_MODIFIED",
            400 => "BAD_REQUEST",
            401 => "UNAUTHORIZED",
            403 => "FORBIDDEN",
            404 => "NOT_FOUND",
            408 => "REQUEST_TIMEOUT",
            409 => "CONFLICT",
            410 => "GONE",
            412 => "PRECONDITION_FAILED",
            413 => "ENTITY_TOO_LARGE",
            429 => "TOO_MANY_REQUESTS",
            449 => "RETRY_WITH",
            500 => "INTERNAL_SERVER_ERROR",
            503 => "SERVICE_UNAVAILABLE",
            _ => return None,
        };
        Some(name)
    }
}

impl From<u32> for StatusCode {
    fn from(value: u32) -> Self {
        StatusCode(value)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} {}", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(StatusCode::OK.is_success());
        assert!(StatusCode::NO_CONTENT.is_success());
        assert!(!StatusCode::NOT_MODIFIED.is_success());
        assert!(StatusCode::NOT_MODIFIED.is_success_or_redirect());
        assert!(!StatusCode::BAD_REQUEST.is_success_or_redirect());

        assert!(StatusCode::GONE.is_retryable());
        assert!(StatusCode::TOO_MANY_REQUESTS.is_retryable());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_retryable());
        assert!(!StatusCode::NOT_FOUND.is_retryable());
        assert!(!StatusCode::CONFLICT.is_retryable());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StatusCode::GONE.to_string(), "410 GONE");
        assert_eq!(StatusCode(299).to_string(), "299");
        assert_eq!(StatusCode::from(449), StatusCode::RETRY_WITH);
    }

    #[test]
    fn test_local_validation_classification() {
        let err = ProtocolError::InvalidHeaderValue {
            name: "x-ms-max-item-count".to_string(),
            value: "ten".to_string(),
            expected: TokenType::ULong,
        };
        assert!(err.is_local_validation());
        assert!(err.to_string().contains("x-ms-max-item-count"));

        let err = ProtocolError::UnsupportedEnumValue {
            name: "x-ms-consistency-level".to_string(),
            value: "Linearizable".to_string(),
        };
        assert!(err.is_local_validation());

        let err = ProtocolError::Truncated {
            what: "token value",
            needed: 3,
        };
        assert!(!err.is_local_validation());
        assert!(err.to_string().contains('3'));

        let err = ProtocolError::InvalidFrameLength {
            length: 10,
            minimum: 24,
        };
        assert!(!err.is_local_validation());
        assert!(err.to_string().contains("24"));
    }
}
