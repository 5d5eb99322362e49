//! Frame definitions for the session core protocol
//!
//! Every message exchanged with the core is a frame with a fixed header and a
//! JSON payload.
//!
//! # Frame Header Format (10 bytes)
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! |  Magic (2 bytes) |Version|  Type  | Reserved (2B)   |       Payload Length (4B)         |
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! - Magic: 0x5350 (2 bytes) - Protocol identifier
//! - Version: 0x01 (1 byte) - Protocol version
//! - Type: Frame type identifier (1 byte)
//! - Reserved: zero (2 bytes)
//! - Payload Length: Length of the payload in bytes (4 bytes, big-endian)

pub(crate) use crate::codec::errors::FrameError;
use crate::proxy::status::StatusFilter;
use crate::rpc::CoreEvent;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Frame type identifiers
pub(crate) enum FrameType {
    /// Client request (Type 1)
    Request = 1,
    /// Core response to a request (Type 2)
    Response = 2,
    /// Core event notification (Type 3)
    Event = 3,
    /// Connection keep-alive ping (Type 4)
    KeepAlive = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(FrameType::Request),
            0x02 => Ok(FrameType::Response),
            0x03 => Ok(FrameType::Event),
            0x04 => Ok(FrameType::KeepAlive),
            _ => Err(FrameError::Invalid),
        }
    }
}

pub(crate) const MAGIC: u16 = 0x5350;

pub(crate) const VERSION: u8 = 0x01;

/// Frame header length in bytes
///
/// Header format: Magic(2) + Version(1) + Type(1) + Reserved(2) + PayloadLen(4) = 10 bytes
pub(crate) const HDR_LEN: usize = 10;

/// Largest payload accepted from the wire
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Protocol frame enum
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Event(EventFrame),
    KeepAlive(KeepAliveFrame),
}

impl Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frame::Request(frame) => write!(f, "request #{} {}", frame.id, frame.call.method()),
            Frame::Response(frame) => {
                if frame.error.is_some() {
                    write!(f, "error response #{}", frame.id)
                } else {
                    write!(f, "response #{}", frame.id)
                }
            }
            Frame::Event(frame) => write!(f, "event {}", frame.event.kind()),
            Frame::KeepAlive(_) => write!(f, "keepalive"),
        }
    }
}

/// Remote call carried by a request frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Call {
    /// Ids of every session in the core
    GetSessionIds,

    /// Status of every session matching the filter
    GetStatus {
        filter: StatusFilter,
        fields: Vec<String>,
        diff: bool,
    },

    /// Status of one session
    GetEntityStatus {
        id: String,
        fields: Vec<String>,
        diff: bool,
    },
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Call::GetSessionIds => "get_session_ids",
            Call::GetStatus { .. } => "get_status",
            Call::GetEntityStatus { .. } => "get_entity_status",
        }
    }
}

/// Request sent by the client
///
/// `id` is chosen by the client and echoed in the matching response, so
/// several requests can be outstanding on one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub call: Call,
}

/// Core reply to a request
///
/// Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFrame {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Event pushed by the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: CoreEvent,
}

/// Keep-alive frame for connection health monitoring
///
/// This frame has no payload data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeepAliveFrame {}
