//! # rntbd-protocol
//!
//! Wire protocol implementation for RNTBD, the binary request/response
//! protocol spoken between clients and storage replicas.
//!
//! This crate provides:
//! - Tagged, little-endian header tokens and the ordered token block
//! - Declared request/response header tables mapping logical names to tokens
//! - Request and response frame preambles
//! - Encoder/decoder for requests, responses and context negotiation
//! - Status codes and protocol error types

pub mod codec;
pub mod context;
pub mod error;
pub mod frame;
pub mod header;
pub mod message;
pub mod token;

pub use codec::{Decoder, Encoder};
pub use context::{ContextError, ContextRequest, ContextResponse};
pub use error::{ProtocolError, StatusCode};
pub use frame::{
    RequestFrame, RequestPreamble, ResponseFrame, ResponsePreamble, REQUEST_PREAMBLE_SIZE,
    RESPONSE_PREAMBLE_SIZE,
};
pub use message::{OperationType, RequestMessage, ResourceType, StoreResponse};
pub use token::{Token, TokenStream, TokenType, TokenValue};

/// Protocol version announced during context negotiation.
pub const CURRENT_PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Header blocks larger than this are logged as oversized (128 KiB).
pub const HEADER_WARN_THRESHOLD: usize = 128 * 1024;

/// Bodies larger than this are logged as oversized (2 MiB).
pub const BODY_WARN_THRESHOLD: usize = 2 * 1024 * 1024;
