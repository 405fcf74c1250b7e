//! Encoder and decoder for RNTBD frames.

use crate::context::ContextResponse;
use crate::error::{ProtocolError, StatusCode};
use crate::frame::{
    request_payload_present, response_payload_present, RequestFrame, RequestPreamble,
    ResponseFrame, ResponsePreamble, BODY_LENGTH_SIZE, REQUEST_PREAMBLE_SIZE,
    RESPONSE_PREAMBLE_SIZE,
};
use crate::header::{encode_request_headers, encode_response_headers, request_token, response_token};
use crate::message::RequestMessage;
use crate::token::{TokenStream, TokenValue};
use crate::{BODY_WARN_THRESHOLD, HEADER_WARN_THRESHOLD};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use uuid::Uuid;

const MAX_FRAME_LENGTH: u64 = u32::MAX as u64;

fn checked_length(preamble_size: usize, metadata_len: usize) -> Result<u32, ProtocolError> {
    let length = (preamble_size + metadata_len) as u64;
    if length > MAX_FRAME_LENGTH {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_LENGTH,
        });
    }
    Ok(length as u32)
}

fn put_body(buf: &mut BytesMut, body: &[u8]) -> Result<(), ProtocolError> {
    if body.len() as u64 > MAX_FRAME_LENGTH {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len() as u64,
            max: MAX_FRAME_LENGTH,
        });
    }
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    Ok(())
}

fn warn_if_oversized(metadata_len: usize, body_len: usize, activity_id: &Uuid) {
    if metadata_len > HEADER_WARN_THRESHOLD {
        tracing::warn!(
            %activity_id,
            header_bytes = metadata_len,
            "RNTBD header block exceeds {} bytes",
            HEADER_WARN_THRESHOLD
        );
    }
    if body_len > BODY_WARN_THRESHOLD {
        tracing::warn!(
            %activity_id,
            body_bytes = body_len,
            "RNTBD body exceeds {} bytes",
            BODY_WARN_THRESHOLD
        );
    }
}

/// Encodes requests and responses into frames.
pub struct Encoder;

impl Encoder {
    /// Builds the wire frame for a request.
    ///
    /// Logical headers are converted through the declared request table;
    /// a value that does not parse as its declared type is rejected before
    /// anything is written.
    pub fn build_request(
        request: &RequestMessage,
        replica_path: &str,
        transport_request_id: u32,
    ) -> Result<BytesMut, ProtocolError> {
        let mut tokens = encode_request_headers(&request.headers)?;
        tokens.insert(
            request_token::PAYLOAD_PRESENT,
            TokenValue::Byte(request.body.is_some() as u8),
        );
        tokens.insert(
            request_token::REPLICA_PATH,
            TokenValue::String(replica_path.to_string()),
        );
        tokens.insert(
            request_token::TRANSPORT_REQUEST_ID,
            TokenValue::ULong(transport_request_id),
        );

        Self::encode_request_frame(
            request.resource_type.as_u16(),
            request.operation_type.as_u16(),
            request.activity_id,
            &tokens,
            request.body.as_deref(),
        )
    }

    /// Encodes a request frame from raw parts.
    pub fn encode_request_frame(
        resource_type: u16,
        operation_type: u16,
        activity_id: Uuid,
        tokens: &TokenStream,
        body: Option<&[u8]>,
    ) -> Result<BytesMut, ProtocolError> {
        let metadata_len = tokens.encoded_len();
        let length = checked_length(REQUEST_PREAMBLE_SIZE, metadata_len)?;
        let body_len = body.map_or(0, <[u8]>::len);
        warn_if_oversized(metadata_len, body_len, &activity_id);

        let mut buf = BytesMut::with_capacity(length as usize + BODY_LENGTH_SIZE + body_len);
        RequestPreamble {
            length,
            resource_type,
            operation_type,
            activity_id,
        }
        .encode(&mut buf);
        tokens.encode(&mut buf)?;
        if let Some(body) = body {
            put_body(&mut buf, body)?;
        }
        Ok(buf)
    }

    /// Encodes a response frame. The payload-present token is derived from `body`.
    pub fn encode_response(
        status: u32,
        activity_id: Uuid,
        headers: &TokenStream,
        body: Option<&[u8]>,
    ) -> Result<BytesMut, ProtocolError> {
        let mut tokens = headers.clone();
        tokens.insert(
            response_token::PAYLOAD_PRESENT,
            TokenValue::Byte(body.is_some() as u8),
        );
        Self::encode_response_frame(status, activity_id, &tokens, body)
    }

    /// Encodes a response from logical headers, echoing the transport request id.
    pub fn build_response(
        status: u32,
        activity_id: Uuid,
        transport_request_id: u32,
        headers: &HashMap<String, String>,
        body: Option<&[u8]>,
    ) -> Result<BytesMut, ProtocolError> {
        let mut tokens = encode_response_headers(headers)?;
        tokens.insert(
            response_token::TRANSPORT_REQUEST_ID,
            TokenValue::ULong(transport_request_id),
        );
        Self::encode_response(status, activity_id, &tokens, body)
    }

    /// Encodes a response frame from raw parts without touching the tokens.
    pub fn encode_response_frame(
        status: u32,
        activity_id: Uuid,
        tokens: &TokenStream,
        body: Option<&[u8]>,
    ) -> Result<BytesMut, ProtocolError> {
        let metadata_len = tokens.encoded_len();
        let length = checked_length(RESPONSE_PREAMBLE_SIZE, metadata_len)?;
        let body_len = body.map_or(0, <[u8]>::len);

        let mut buf = BytesMut::with_capacity(length as usize + BODY_LENGTH_SIZE + body_len);
        ResponsePreamble {
            length,
            status,
            activity_id,
        }
        .encode(&mut buf);
        tokens.encode(&mut buf)?;
        if let Some(body) = body {
            put_body(&mut buf, body)?;
        }
        Ok(buf)
    }
}

/// Splits one complete frame off the front of `buffer`, or returns `None`
/// if more data is needed. Nothing is consumed until the frame is complete.
fn split_frame(
    buffer: &mut BytesMut,
    length: u32,
    preamble_size: usize,
    has_body: impl Fn(&TokenStream) -> bool,
) -> Result<Option<(TokenStream, Option<Bytes>)>, ProtocolError> {
    let metadata_end = length as usize;
    if metadata_end < preamble_size {
        return Err(ProtocolError::InvalidFrameLength {
            length,
            minimum: preamble_size as u32,
        });
    }
    if buffer.len() < metadata_end {
        return Ok(None);
    }

    let tokens =
        TokenStream::decode(Bytes::copy_from_slice(&buffer[preamble_size..metadata_end]))?;

    let mut frame_end = metadata_end;
    let body_len = if has_body(&tokens) {
        if buffer.len() < metadata_end + BODY_LENGTH_SIZE {
            return Ok(None);
        }
        let mut len_bytes = &buffer[metadata_end..metadata_end + BODY_LENGTH_SIZE];
        let body_len = len_bytes.get_u32_le() as usize;
        frame_end += BODY_LENGTH_SIZE + body_len;
        if buffer.len() < frame_end {
            return Ok(None);
        }
        Some(body_len)
    } else {
        None
    };

    let mut frame = buffer.split_to(frame_end).freeze();
    frame.advance(metadata_end);
    let body = body_len.map(|len| {
        frame.advance(BODY_LENGTH_SIZE);
        frame.split_to(len)
    });

    Ok(Some((tokens, body)))
}

/// Buffered decoder for request and response frames.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next request frame from the buffer.
    pub fn decode_request(&mut self) -> Result<Option<RequestFrame>, ProtocolError> {
        if self.buffer.len() < REQUEST_PREAMBLE_SIZE {
            return Ok(None);
        }
        let preamble = RequestPreamble::decode(&self.buffer)?;
        let split = split_frame(
            &mut self.buffer,
            preamble.length,
            REQUEST_PREAMBLE_SIZE,
            request_payload_present,
        )?;
        Ok(split.map(|(headers, body)| RequestFrame {
            preamble,
            headers,
            body,
        }))
    }

    /// Attempts to decode the next response frame from the buffer.
    pub fn decode_response(&mut self) -> Result<Option<ResponseFrame>, ProtocolError> {
        self.decode_response_with(response_payload_present)
    }

    /// Attempts to decode a context negotiation response. The body is
    /// present exactly when the status is outside 2xx/3xx.
    pub fn decode_context_response(&mut self) -> Result<Option<ContextResponse>, ProtocolError> {
        if self.buffer.len() < RESPONSE_PREAMBLE_SIZE {
            return Ok(None);
        }
        let preamble = ResponsePreamble::decode(&self.buffer)?;
        let refused = !StatusCode(preamble.status).is_success_or_redirect();
        let frame = self.decode_response_with(|_| refused)?;
        Ok(frame.map(ContextResponse::from_frame))
    }

    fn decode_response_with(
        &mut self,
        has_body: impl Fn(&TokenStream) -> bool,
    ) -> Result<Option<ResponseFrame>, ProtocolError> {
        if self.buffer.len() < RESPONSE_PREAMBLE_SIZE {
            return Ok(None);
        }
        let preamble = ResponsePreamble::decode(&self.buffer)?;
        let split = split_frame(
            &mut self.buffer,
            preamble.length,
            RESPONSE_PREAMBLE_SIZE,
            has_body,
        )?;
        Ok(split.map(|(headers, body)| ResponseFrame {
            preamble,
            headers,
            body,
        }))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
