//! RNTBD frame layout.
//!
//! Request frame:
//!
//! ```text
//! +--------------+---------------+----------------+-------------+
//! | length       | resource_type | operation_type | activity_id |
//! | u32 LE       | u16 LE        | u16 LE         | 16 bytes    |
//! +--------------+---------------+----------------+-------------+
//! | tokens ...                    | [body_len u32 LE | body]      |
//! +-------------------------------+-----------------------------+
//! ```
//!
//! Response frame:
//!
//! ```text
//! +--------------+---------------+-------------+
//! | length       | status        | activity_id |
//! | u32 LE       | u32 LE        | 16 bytes    |
//! +--------------+---------------+-------------+
//! | tokens ...   | [body_len u32 LE | body]     |
//! +--------------+----------------------------+
//! ```
//!
//! `length` covers the preamble and the token block, not the body. A body
//! follows only when the payload-present token is set.

use crate::error::ProtocolError;
use crate::header::{decode_request_headers, request_token, response_token};
use crate::message::{OperationType, ResourceType};
use crate::token::TokenStream;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use uuid::Uuid;

/// Size of the fixed request preamble (4 + 2 + 2 + 16).
pub const REQUEST_PREAMBLE_SIZE: usize = 24;

/// Size of the fixed response preamble (4 + 4 + 16).
pub const RESPONSE_PREAMBLE_SIZE: usize = 24;

/// Size of the body length prefix.
pub const BODY_LENGTH_SIZE: usize = 4;

fn read_guid(buf: &[u8]) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&buf[..16]);
    Uuid::from_bytes_le(raw)
}

fn check_preamble(buf: &[u8], size: usize) -> Result<(), ProtocolError> {
    if buf.len() < size {
        return Err(ProtocolError::Truncated {
            what: "frame preamble",
            needed: size - buf.len(),
        });
    }
    Ok(())
}

fn metadata_len(length: u32, preamble_size: usize) -> Result<usize, ProtocolError> {
    let length_usize = length as usize;
    if length_usize < preamble_size {
        return Err(ProtocolError::InvalidFrameLength {
            length,
            minimum: preamble_size as u32,
        });
    }
    Ok(length_usize - preamble_size)
}

/// Fixed request preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPreamble {
    pub length: u32,
    pub resource_type: u16,
    pub operation_type: u16,
    pub activity_id: Uuid,
}

impl RequestPreamble {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.length);
        buf.put_u16_le(self.resource_type);
        buf.put_u16_le(self.operation_type);
        buf.put_slice(&self.activity_id.to_bytes_le());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        check_preamble(buf, REQUEST_PREAMBLE_SIZE)?;
        Ok(Self {
            length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            resource_type: u16::from_le_bytes([buf[4], buf[5]]),
            operation_type: u16::from_le_bytes([buf[6], buf[7]]),
            activity_id: read_guid(&buf[8..24]),
        })
    }

    /// Length of the token block that follows the preamble.
    pub fn metadata_len(&self) -> Result<usize, ProtocolError> {
        metadata_len(self.length, REQUEST_PREAMBLE_SIZE)
    }
}

/// Fixed response preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponsePreamble {
    pub length: u32,
    pub status: u32,
    pub activity_id: Uuid,
}

impl ResponsePreamble {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.status);
        buf.put_slice(&self.activity_id.to_bytes_le());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        check_preamble(buf, RESPONSE_PREAMBLE_SIZE)?;
        Ok(Self {
            length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            status: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            activity_id: read_guid(&buf[8..24]),
        })
    }

    /// Length of the token block that follows the preamble.
    pub fn metadata_len(&self) -> Result<usize, ProtocolError> {
        metadata_len(self.length, RESPONSE_PREAMBLE_SIZE)
    }
}

/// Decodes the fixed 24-byte response preamble.
pub fn decode_rntbd_header(buf: &[u8]) -> Result<ResponsePreamble, ProtocolError> {
    ResponsePreamble::decode(buf)
}

/// A fully read request frame.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub preamble: RequestPreamble,
    pub headers: TokenStream,
    pub body: Option<Bytes>,
}

impl RequestFrame {
    pub fn resource_type(&self) -> Result<ResourceType, ProtocolError> {
        ResourceType::from_u16(self.preamble.resource_type)
    }

    pub fn operation_type(&self) -> Result<OperationType, ProtocolError> {
        OperationType::from_u16(self.preamble.operation_type)
    }

    pub fn activity_id(&self) -> Uuid {
        self.preamble.activity_id
    }

    pub fn transport_request_id(&self) -> Option<u32> {
        self.headers.get_u32(request_token::TRANSPORT_REQUEST_ID)
    }

    pub fn replica_path(&self) -> Option<&str> {
        self.headers.get_str(request_token::REPLICA_PATH)
    }

    /// Logical headers carried by the frame.
    pub fn logical_headers(&self) -> HashMap<String, String> {
        decode_request_headers(&self.headers)
    }
}

/// Returns whether a request token block announces a body.
pub fn request_payload_present(headers: &TokenStream) -> bool {
    headers.get_u8(request_token::PAYLOAD_PRESENT).unwrap_or(0) != 0
}

/// A fully read response frame, before mapping to logical headers.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub preamble: ResponsePreamble,
    pub headers: TokenStream,
    pub body: Option<Bytes>,
}

impl ResponseFrame {
    pub fn status(&self) -> u32 {
        self.preamble.status
    }

    pub fn transport_request_id(&self) -> Option<u32> {
        self.headers.get_u32(response_token::TRANSPORT_REQUEST_ID)
    }
}

/// Returns whether a response token block announces a body.
pub fn response_payload_present(headers: &TokenStream) -> bool {
    headers.get_u8(response_token::PAYLOAD_PRESENT).unwrap_or(0) != 0
}
