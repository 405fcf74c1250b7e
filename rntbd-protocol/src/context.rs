//! Context negotiation, the first exchange on every connection.
//!
//! The client sends a request with resource and operation type
//! `Connection`; the server answers with its agent, version and timeouts.
//! A response outside 2xx/3xx carries a JSON error body that is read even
//! though no payload-present token is sent.

use crate::codec::Encoder;
use crate::error::{ProtocolError, StatusCode};
use crate::frame::{RequestFrame, ResponseFrame};
use crate::message::{OperationType, ResourceType};
use crate::token::{TokenStream, TokenValue};
use crate::CURRENT_PROTOCOL_VERSION;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Context request token ids.
pub mod context_request_token {
    pub const PROTOCOL_VERSION: u16 = 0x0000;
    pub const CLIENT_VERSION: u16 = 0x0001;
    pub const USER_AGENT: u16 = 0x0002;
}

/// Context response token ids.
pub mod context_response_token {
    pub const PROTOCOL_VERSION: u16 = 0x0000;
    pub const CLIENT_VERSION: u16 = 0x0001;
    pub const SERVER_AGENT: u16 = 0x0002;
    pub const SERVER_VERSION: u16 = 0x0003;
    pub const IDLE_TIMEOUT: u16 = 0x0004;
    pub const UNAUTHENTICATED_TIMEOUT: u16 = 0x0005;
}

use context_request_token as req;
use context_response_token as resp;

/// Client side of the negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRequest {
    pub protocol_version: u32,
    pub client_version: String,
    pub user_agent: String,
}

impl ContextRequest {
    pub fn new(client_version: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            client_version: client_version.into(),
            user_agent: user_agent.into(),
        }
    }

    /// Encodes the negotiation request frame.
    pub fn encode(&self, activity_id: Uuid) -> Result<BytesMut, ProtocolError> {
        let mut tokens = TokenStream::new();
        tokens.insert(req::PROTOCOL_VERSION, TokenValue::ULong(self.protocol_version));
        tokens.insert(
            req::CLIENT_VERSION,
            TokenValue::SmallString(self.client_version.clone()),
        );
        tokens.insert(
            req::USER_AGENT,
            TokenValue::SmallString(self.user_agent.clone()),
        );
        Encoder::encode_request_frame(
            ResourceType::Connection.as_u16(),
            OperationType::Connection.as_u16(),
            activity_id,
            &tokens,
            None,
        )
    }

    /// Reads a negotiation request received by a server.
    pub fn from_frame(frame: &RequestFrame) -> Result<Self, ProtocolError> {
        if frame.preamble.resource_type != ResourceType::Connection.as_u16()
            || frame.preamble.operation_type != OperationType::Connection.as_u16()
        {
            return Err(ProtocolError::MissingToken("context negotiation request"));
        }
        let protocol_version = frame
            .headers
            .get_u32(req::PROTOCOL_VERSION)
            .ok_or(ProtocolError::MissingToken("protocol version"))?;
        Ok(Self {
            protocol_version,
            client_version: frame
                .headers
                .get_str(req::CLIENT_VERSION)
                .unwrap_or_default()
                .to_string(),
            user_agent: frame
                .headers
                .get_str(req::USER_AGENT)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Error body returned when negotiation is refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextError {
    pub code: String,
    pub message: String,
}

/// Server side of the negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextResponse {
    pub status: StatusCode,
    pub activity_id: Uuid,
    pub protocol_version: Option<u32>,
    pub client_version: Option<String>,
    pub server_agent: Option<String>,
    pub server_version: Option<String>,
    pub idle_timeout: Option<Duration>,
    pub unauthenticated_timeout: Option<Duration>,
    /// Present when the status is outside 2xx/3xx.
    pub error: Option<ContextError>,
    /// Raw error body, kept when it is not valid JSON.
    pub raw_error: Option<Bytes>,
}

impl ContextResponse {
    /// An accepting response.
    pub fn accepted(activity_id: Uuid, server_agent: &str, server_version: &str) -> Self {
        Self {
            status: StatusCode::OK,
            activity_id,
            protocol_version: Some(CURRENT_PROTOCOL_VERSION),
            client_version: None,
            server_agent: Some(server_agent.to_string()),
            server_version: Some(server_version.to_string()),
            idle_timeout: None,
            unauthenticated_timeout: None,
            error: None,
            raw_error: None,
        }
    }

    /// A refusing response carrying a JSON error body.
    pub fn rejected(activity_id: Uuid, status: StatusCode, error: ContextError) -> Self {
        Self {
            status,
            activity_id,
            protocol_version: None,
            client_version: None,
            server_agent: None,
            server_version: None,
            idle_timeout: None,
            unauthenticated_timeout: None,
            error: Some(error),
            raw_error: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status.is_success_or_redirect()
    }

    /// Maps a response frame read with status-driven body detection.
    pub fn from_frame(frame: ResponseFrame) -> Self {
        let headers = &frame.headers;
        let string = |id| headers.get_str(id).map(str::to_string);
        let seconds = |id| headers.get_u32(id).map(|s| Duration::from_secs(u64::from(s)));

        let (error, raw_error) = match frame.body.clone() {
            Some(body) => match serde_json::from_slice::<ContextError>(&body) {
                Ok(error) => (Some(error), None),
                Err(_) => (None, Some(body)),
            },
            None => (None, None),
        };

        Self {
            status: StatusCode(frame.status()),
            activity_id: frame.preamble.activity_id,
            protocol_version: headers.get_u32(resp::PROTOCOL_VERSION),
            client_version: string(resp::CLIENT_VERSION),
            server_agent: string(resp::SERVER_AGENT),
            server_version: string(resp::SERVER_VERSION),
            idle_timeout: seconds(resp::IDLE_TIMEOUT),
            unauthenticated_timeout: seconds(resp::UNAUTHENTICATED_TIMEOUT),
            error,
            raw_error,
        }
    }

    /// Encodes the response. A body is written only when refusing.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut tokens = TokenStream::new();
        if let Some(v) = self.protocol_version {
            tokens.insert(resp::PROTOCOL_VERSION, TokenValue::ULong(v));
        }
        let strings = [
            (resp::CLIENT_VERSION, &self.client_version),
            (resp::SERVER_AGENT, &self.server_agent),
            (resp::SERVER_VERSION, &self.server_version),
        ];
        for (id, value) in strings {
            if let Some(value) = value {
                tokens.insert(id, TokenValue::SmallString(value.clone()));
            }
        }
        let timeouts = [
            (resp::IDLE_TIMEOUT, self.idle_timeout),
            (resp::UNAUTHENTICATED_TIMEOUT, self.unauthenticated_timeout),
        ];
        for (id, timeout) in timeouts {
            if let Some(timeout) = timeout {
                tokens.insert(id, TokenValue::ULong(timeout.as_secs() as u32));
            }
        }

        let body = if self.is_accepted() {
            None
        } else {
            let error = self.error.clone().unwrap_or_else(|| ContextError {
                code: self.status.to_string(),
                message: String::new(),
            });
            Some(serde_json::to_vec(&error)?)
        };

        Encoder::encode_response_frame(
            self.status.as_u32(),
            self.activity_id,
            &tokens,
            body.as_deref(),
        )
    }

    /// Human-readable failure description for a refused negotiation.
    pub fn failure_message(&self) -> String {
        match (&self.error, &self.raw_error) {
            (Some(error), _) => format!("{}: {}", error.code, error.message),
            (None, Some(raw)) => String::from_utf8_lossy(raw).into_owned(),
            (None, None) => self.status.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;

    #[test]
    fn test_context_request_roundtrip() {
        let request = ContextRequest::new("2.11.0", "rntbd-test/0.1");
        let activity_id = Uuid::new_v4();
        let encoded = request.encode(activity_id).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);
        let frame = decoder.decode_request().unwrap().unwrap();
        assert_eq!(frame.resource_type().unwrap(), ResourceType::Connection);
        assert_eq!(frame.operation_type().unwrap(), OperationType::Connection);
        assert_eq!(frame.activity_id(), activity_id);

        let decoded = ContextRequest::from_frame(&frame).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.protocol_version, CURRENT_PROTOCOL_VERSION);
    }

    #[test]
    fn test_non_context_frame_rejected() {
        let tokens = TokenStream::new();
        let encoded = Encoder::encode_request_frame(
            ResourceType::Document.as_u16(),
            OperationType::Read.as_u16(),
            Uuid::nil(),
            &tokens,
            None,
        )
        .unwrap();
        let mut decoder = Decoder::new();
        decoder.extend(&encoded);
        let frame = decoder.decode_request().unwrap().unwrap();
        assert!(ContextRequest::from_frame(&frame).is_err());
    }

    #[test]
    fn test_accepted_response_roundtrip() {
        let mut response = ContextResponse::accepted(Uuid::new_v4(), "fake-server", "1.0");
        response.idle_timeout = Some(Duration::from_secs(600));

        let encoded = response.encode().unwrap();
        let mut decoder = Decoder::new();
        decoder.extend(&encoded);
        let decoded = decoder.decode_context_response().unwrap().unwrap();

        assert!(decoded.is_accepted());
        assert_eq!(decoded, response);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_rejected_response_carries_json_error() {
        let response = ContextResponse::rejected(
            Uuid::new_v4(),
            StatusCode::UNAUTHORIZED,
            ContextError {
                code: "Unauthorized".to_string(),
                message: "client certificate required".to_string(),
            },
        );

        let encoded = response.encode().unwrap();
        let mut decoder = Decoder::new();
        decoder.extend(&encoded);
        let decoded = decoder.decode_context_response().unwrap().unwrap();

        assert!(!decoded.is_accepted());
        assert_eq!(decoded.status, StatusCode::UNAUTHORIZED);
        assert_eq!(decoded.error, response.error);
        assert_eq!(
            decoded.failure_message(),
            "Unauthorized: client certificate required"
        );
    }

    #[test]
    fn test_rejected_response_with_non_json_body() {
        let tokens = TokenStream::new();
        let encoded = Encoder::encode_response_frame(
            503,
            Uuid::nil(),
            &tokens,
            Some(&b"overloaded"[..]),
        )
        .unwrap();
        let mut decoder = Decoder::new();
        decoder.extend(&encoded);
        let decoded = decoder.decode_context_response().unwrap().unwrap();
        assert!(decoded.error.is_none());
        assert_eq!(decoded.failure_message(), "overloaded");
    }
}
