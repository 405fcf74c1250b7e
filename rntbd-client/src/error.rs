//! Client error types.
//!
//! Every I/O failure on the transport path is classified at its origin with
//! a [`TransportErrorCode`] and wrapped in a [`TransportError`] that records
//! where it happened and whether the request bytes reached the wire.

use crate::options::ConfigError;
use rntbd_protocol::{ProtocolError, StatusCode};
use rntbd_routing::RoutingError;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorCode {
    DnsResolutionFailed,
    ConnectFailed,
    SslNegotiationFailed,
    TransportNegotiationFailed,
    ChannelOpenTimeout,
    ChannelClosed,
    SendFailed,
    ReceiveFailed,
    ReceiveStreamClosed,
    RequestTimeout,
    ConnectionBroken,
    DispatcherShutdown,
    InvalidResponse,
}

impl TransportErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorCode::DnsResolutionFailed => "DNS_RESOLUTION_FAILED",
            TransportErrorCode::ConnectFailed => "CONNECT_FAILED",
            TransportErrorCode::SslNegotiationFailed => "SSL_NEGOTIATION_FAILED",
            TransportErrorCode::TransportNegotiationFailed => "TRANSPORT_NEGOTIATION_FAILED",
            TransportErrorCode::ChannelOpenTimeout => "CHANNEL_OPEN_TIMEOUT",
            TransportErrorCode::ChannelClosed => "CHANNEL_CLOSED",
            TransportErrorCode::SendFailed => "SEND_FAILED",
            TransportErrorCode::ReceiveFailed => "RECEIVE_FAILED",
            TransportErrorCode::ReceiveStreamClosed => "RECEIVE_STREAM_CLOSED",
            TransportErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            TransportErrorCode::ConnectionBroken => "CONNECTION_BROKEN",
            TransportErrorCode::DispatcherShutdown => "DISPATCHER_SHUTDOWN",
            TransportErrorCode::InvalidResponse => "INVALID_RESPONSE",
        }
    }

    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            TransportErrorCode::ChannelOpenTimeout | TransportErrorCode::RequestTimeout
        )
    }

    /// Failures raised while the channel was being opened. These are fatal
    /// to the channel.
    pub fn is_open_failure(self) -> bool {
        matches!(
            self,
            TransportErrorCode::DnsResolutionFailed
                | TransportErrorCode::ConnectFailed
                | TransportErrorCode::SslNegotiationFailed
                | TransportErrorCode::TransportNegotiationFailed
                | TransportErrorCode::ChannelOpenTimeout
        )
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details of a refused context negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationFailure {
    pub status: StatusCode,
    pub code: Option<String>,
    pub message: String,
    /// Protocol version the server asked for, when it said.
    pub required_protocol_version: Option<u32>,
    /// Client version the server asked for, when it said.
    pub required_client_version: Option<String>,
}

/// A classified transport failure.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message} (target: {target}, activity: {activity_id}, payload sent: {payload_sent})")]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub activity_id: Uuid,
    /// Server address the operation was aimed at.
    pub target: String,
    /// Local and remote endpoints, once a connection existed.
    pub connection: Option<String>,
    /// Whether request bytes may have reached the server.
    pub payload_sent: bool,
    pub message: String,
    pub negotiation: Option<Box<NegotiationFailure>>,
    #[source]
    pub source: Option<Arc<io::Error>>,
}

impl TransportError {
    pub fn new(code: TransportErrorCode, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            activity_id: Uuid::nil(),
            target: target.into(),
            connection: None,
            payload_sent: false,
            message: message.into(),
            negotiation: None,
            source: None,
        }
    }

    pub fn with_activity_id(mut self, activity_id: Uuid) -> Self {
        self.activity_id = activity_id;
        self
    }

    pub fn with_connection(mut self, description: impl Into<String>) -> Self {
        self.connection = Some(description.into());
        self
    }

    pub fn with_payload_sent(mut self, payload_sent: bool) -> Self {
        self.payload_sent = payload_sent;
        self
    }

    pub fn with_io(mut self, error: io::Error) -> Self {
        self.source = Some(Arc::new(error));
        self
    }

    pub fn with_negotiation(mut self, failure: NegotiationFailure) -> Self {
        self.negotiation = Some(Box::new(failure));
        self
    }
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request was rejected locally before anything was written.
    #[error("bad request: {0}")]
    BadRequest(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("request rate too large: {pending} pending requests exceed the limit of {ceiling}")]
    RequestRateTooLarge { pending: usize, ceiling: usize },

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid server address '{0}'")]
    InvalidAddress(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("authorization failed: {0}")]
    Authorization(String),

    /// Routing or address resolution produced no target.
    #[error("no route: {0}")]
    NoRoute(String),
}

impl ClientError {
    /// Returns whether the caller should back off rather than retry.
    pub fn is_throttled(&self) -> bool {
        matches!(self, ClientError::RequestRateTooLarge { .. })
    }

    /// Returns whether request bytes may have reached the server. Only
    /// transport failures can have sent anything.
    pub fn payload_sent(&self) -> bool {
        match self {
            ClientError::Transport(e) => e.payload_sent,
            _ => false,
        }
    }

    pub fn is_local_validation(&self) -> bool {
        match self {
            ClientError::BadRequest(e) => e.is_local_validation(),
            ClientError::InvalidAddress(_) => true,
            _ => false,
        }
    }

    pub fn transport_code(&self) -> Option<TransportErrorCode> {
        match self {
            ClientError::Transport(e) => Some(e.code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.transport_code().is_some_and(TransportErrorCode::is_timeout)
    }
}
