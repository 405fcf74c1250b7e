//! Logical request and response types.

use crate::error::{ProtocolError, StatusCode};
use crate::frame::ResponseFrame;
use crate::header::decode_response_headers;
use bytes::Bytes;
use std::collections::HashMap;
use uuid::Uuid;

/// Resource kinds addressable over RNTBD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResourceType {
    Connection = 0x0000,
    Database = 0x0001,
    Collection = 0x0002,
    Document = 0x0003,
    Attachment = 0x0004,
    User = 0x0005,
    Permission = 0x0006,
    StoredProcedure = 0x0007,
    Conflict = 0x0008,
    Trigger = 0x0009,
    UserDefinedFunction = 0x000A,
    Offer = 0x000F,
    PartitionKeyRange = 0x0016,
}

impl ResourceType {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Result<Self, ProtocolError> {
        let resource_type = match value {
            0x0000 => ResourceType::Connection,
            0x0001 => ResourceType::Database,
            0x0002 => ResourceType::Collection,
            0x0003 => ResourceType::Document,
            0x0004 => ResourceType::Attachment,
            0x0005 => ResourceType::User,
            0x0006 => ResourceType::Permission,
            0x0007 => ResourceType::StoredProcedure,
            0x0008 => ResourceType::Conflict,
            0x0009 => ResourceType::Trigger,
            0x000A => ResourceType::UserDefinedFunction,
            0x000F => ResourceType::Offer,
            0x0016 => ResourceType::PartitionKeyRange,
            other => return Err(ProtocolError::UnknownResourceType(other)),
        };
        Ok(resource_type)
    }

    /// Path segment naming this resource kind in resource addresses.
    pub fn path_segment(self) -> &'static str {
        match self {
            ResourceType::Connection => "",
            ResourceType::Database => "dbs",
            ResourceType::Collection => "colls",
            ResourceType::Document => "docs",
            ResourceType::Attachment => "attachments",
            ResourceType::User => "users",
            ResourceType::Permission => "permissions",
            ResourceType::StoredProcedure => "sprocs",
            ResourceType::Conflict => "conflicts",
            ResourceType::Trigger => "triggers",
            ResourceType::UserDefinedFunction => "udfs",
            ResourceType::Offer => "offers",
            ResourceType::PartitionKeyRange => "pkranges",
        }
    }
}

/// Operations carried in the request preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OperationType {
    Connection = 0x0000,
    Create = 0x0001,
    Read = 0x0003,
    ReadFeed = 0x0004,
    Delete = 0x0005,
    Replace = 0x0006,
    ExecuteJavaScript = 0x0008,
    SqlQuery = 0x0009,
    Query = 0x000F,
    Head = 0x0011,
    HeadFeed = 0x0012,
    Upsert = 0x0013,
    Batch = 0x0025,
}

impl OperationType {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Result<Self, ProtocolError> {
        let operation_type = match value {
            0x0000 => OperationType::Connection,
            0x0001 => OperationType::Create,
            0x0003 => OperationType::Read,
            0x0004 => OperationType::ReadFeed,
            0x0005 => OperationType::Delete,
            0x0006 => OperationType::Replace,
            0x0008 => OperationType::ExecuteJavaScript,
            0x0009 => OperationType::SqlQuery,
            0x000F => OperationType::Query,
            0x0011 => OperationType::Head,
            0x0012 => OperationType::HeadFeed,
            0x0013 => OperationType::Upsert,
            0x0025 => OperationType::Batch,
            other => return Err(ProtocolError::UnknownOperationType(other)),
        };
        Ok(operation_type)
    }

    /// HTTP verb used when signing the request.
    pub fn http_method(self) -> &'static str {
        match self {
            OperationType::Read | OperationType::ReadFeed => "GET",
            OperationType::Replace => "PUT",
            OperationType::Delete => "DELETE",
            OperationType::Head | OperationType::HeadFeed => "HEAD",
            OperationType::Connection
            | OperationType::Create
            | OperationType::ExecuteJavaScript
            | OperationType::SqlQuery
            | OperationType::Query
            | OperationType::Upsert
            | OperationType::Batch => "POST",
        }
    }

    /// Operations that never mutate server state.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            OperationType::Read
                | OperationType::ReadFeed
                | OperationType::Head
                | OperationType::HeadFeed
                | OperationType::SqlQuery
                | OperationType::Query
        )
    }
}

/// A logical request before framing.
#[derive(Debug, Clone)]
pub struct RequestMessage {
    pub resource_type: ResourceType,
    pub operation_type: OperationType,
    pub activity_id: Uuid,
    /// Resource id or name-based link of the target resource.
    pub resource_address: String,
    /// Logical headers keyed by lowercase name.
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
}

impl RequestMessage {
    pub fn new(resource_type: ResourceType, operation_type: OperationType) -> Self {
        Self {
            resource_type,
            operation_type,
            activity_id: Uuid::new_v4(),
            resource_address: String::new(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_activity_id(mut self, activity_id: Uuid) -> Self {
        self.activity_id = activity_id;
        self
    }

    pub fn with_resource_address(mut self, address: impl Into<String>) -> Self {
        self.resource_address = address.into();
        self
    }

    /// Adds a header. Names are case-insensitive and stored lowercase.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn set_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A decoded response.
#[derive(Debug, Clone)]
pub struct StoreResponse {
    pub status: StatusCode,
    pub activity_id: Uuid,
    /// Transport request id echoed by the server.
    pub transport_request_id: Option<u32>,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl StoreResponse {
    /// Maps a raw response frame onto logical headers.
    pub fn from_frame(frame: ResponseFrame) -> Self {
        let transport_request_id = frame.transport_request_id();
        Self {
            status: StatusCode(frame.preamble.status),
            activity_id: frame.preamble.activity_id,
            transport_request_id,
            headers: decode_response_headers(&frame.headers),
            body: frame.body.unwrap_or_default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn request_charge(&self) -> Option<f64> {
        self.header("x-ms-request-charge")?.parse().ok()
    }

    pub fn sub_status(&self) -> Option<u32> {
        self.header("x-ms-substatus")?.parse().ok()
    }
}
