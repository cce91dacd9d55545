//! # Wire Protocol
//!
//! Frames exchanged with the remote service over the session socket.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Session Protocol Frames                            │
//! │                                                                         │
//! │  HANDSHAKE                                                             │
//! │  ─────────                                                             │
//! │  client ───► Authenticate { secret }                                   │
//! │  remote ◄─── Authenticated { identity }   or   Error { code: 401 }     │
//! │                                                                         │
//! │  REQUEST / RESPONSE (single round trip, correlated by id)              │
//! │  ────────────────────────────────────────────────────────              │
//! │  client ───► Request  { id, method, path, headers, params }            │
//! │  remote ◄─── Response { id, status, body }                             │
//! │                                                                         │
//! │  SUBSCRIPTIONS                                                         │
//! │  ─────────────                                                         │
//! │  client ───► Subscribe { event, room }                                 │
//! │  remote ◄─── Event { event, room, seq?, data }   (any number, later)   │
//! │                                                                         │
//! │  ERROR                                                                 │
//! │  ─────                                                                 │
//! │  remote ◄─── Error { code, message }                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON:
//! ```json
//! { "type": "Request", "payload": { "id": 1, "method": "GET", ... } }
//! ```
//!
//! Keepalive uses native WebSocket ping/pong frames and never appears here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code the remote uses for rejected credentials.
pub const FORBIDDEN_CODE: u16 = 401;

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

/// All session protocol frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WireMessage {
    // =========================================================================
    // Handshake
    // =========================================================================
    /// First frame on every (re)connection.
    Authenticate { secret: String },

    /// The remote accepted the secret.
    Authenticated { identity: String },

    // =========================================================================
    // Request / Response
    // =========================================================================
    /// A single request routed over the socket.
    Request(RequestFrame),

    /// The answer to a [`RequestFrame`] with the same id.
    Response(ResponseFrame),

    // =========================================================================
    // Subscriptions
    // =========================================================================
    /// Join a room to receive a named event.
    Subscribe { event: String, room: String },

    /// A push from the remote.
    Event(PushFrame),

    // =========================================================================
    // Errors
    // =========================================================================
    Error { code: u16, message: String },
}

/// A request sent over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlation id, unique per connection handle.
    pub id: u64,

    /// HTTP-style method (`GET`, `POST`, ...).
    pub method: String,

    /// Path on the remote API.
    pub path: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub params: Value,
}

/// The remote's answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub status: u16,
    #[serde(default)]
    pub body: Value,
}

impl ResponseFrame {
    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A pushed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    /// Event name, e.g. `pack:changed`.
    pub event: String,

    /// Room the event was broadcast to (the project id).
    pub room: String,

    /// Monotonic sequence number, when the remote provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,

    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

// =============================================================================
// Helpers
// =============================================================================

impl WireMessage {
    /// Returns the message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::Authenticate { .. } => "Authenticate",
            WireMessage::Authenticated { .. } => "Authenticated",
            WireMessage::Request(_) => "Request",
            WireMessage::Response(_) => "Response",
            WireMessage::Subscribe { .. } => "Subscribe",
            WireMessage::Event(_) => "Event",
            WireMessage::Error { .. } => "Error",
        }
    }

    /// Creates an authentication frame.
    pub fn authenticate(secret: &str) -> Self {
        WireMessage::Authenticate {
            secret: secret.to_string(),
        }
    }

    /// Creates a subscribe frame.
    pub fn subscribe(event: &str, room: &str) -> Self {
        WireMessage::Subscribe {
            event: event.to_string(),
            room: room.to_string(),
        }
    }

    /// Serializes to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
