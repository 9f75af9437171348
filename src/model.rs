//! Core data model for request/response channels.
//!
//! A request is an opaque payload stored under its correlation id; the id,
//! not the payload, travels through the request queue.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request ID
// ---------------------------------------------------------------------------

/// Correlation id linking a request to its response queue.
///
/// Hex SHA-256 over the channel name, an arrival ordinal and the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Ids come back from the store as raw bytes.
    pub fn from_bytes(raw: &[u8]) -> Self {
        Self(String::from_utf8_lossy(raw).into_owned())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A request claimed by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Request State
// ---------------------------------------------------------------------------

/// Where a request is in its round trip.
///
/// Nothing stores this; it names the steps for spans and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Payload written under its id.
    Sent,
    /// Id pushed onto the request queue.
    Enqueued,
    /// Id moved to the request in-flight list by a server.
    Claimed,
    /// Request acked and payload deleted.
    Processed,
    /// Response pushed onto the per-request queue.
    ResponsePushed,
    /// Response moved to the response in-flight list by the client.
    ResponseClaimed,
    /// Response acked. Terminal.
    ResponseAcked,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        self == RequestState::ResponseAcked
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestState::Sent => "sent",
            RequestState::Enqueued => "enqueued",
            RequestState::Claimed => "claimed",
            RequestState::Processed => "processed",
            RequestState::ResponsePushed => "response_pushed",
            RequestState::ResponseClaimed => "response_claimed",
            RequestState::ResponseAcked => "response_acked",
        };
        write!(f, "{s}")
    }
}
