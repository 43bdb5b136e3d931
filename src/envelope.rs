//! Envelope — the wire message type for room sockets.
//!
//! ARCHITECTURE
//! ============
//! Every message in either direction is `{type, requestId?, payload}`. The
//! socket handler routes on `type` and decodes `payload` into a typed struct
//! per message kind. Replies to a client request echo its `requestId` so the
//! client can correlate them; pushes (presence, assignments) carry none.
//!
//! DESIGN
//! ======
//! - Payload is always a JSON object, never a bare value.
//! - Error replies are ordinary envelopes of type `error` carrying
//!   `message`, `code` and `retryable`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// =============================================================================
// MESSAGE KINDS
// =============================================================================

pub mod kinds {
    pub const ROOM_JOIN: &str = "room:join";
    pub const HOST_START_ROUND: &str = "host:start_round";
    pub const HOST_END_ROUND: &str = "host:end_round";
    pub const HOST_SCORE_ADD: &str = "host:score_add";
    pub const CLIENT_PING: &str = "client:ping";

    pub const ROOM_JOINED: &str = "room:joined";
    pub const ROOM_PRESENCE: &str = "room:presence";
    pub const ROUND_ASSIGNED: &str = "round:assigned";
    pub const HOST_ROUND_STARTED: &str = "host:round_started";
    pub const HOST_ROUND_ENDED: &str = "host:round_ended";
    pub const HOST_SCORE_ADDED: &str = "host:score_added";
    pub const SERVER_PONG: &str = "server:pong";
    pub const ERROR: &str = "error";
}

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Payload key for error messages.
pub const FIELD_MESSAGE: &str = "message";

/// Payload key for grepable error codes.
pub const FIELD_CODE: &str = "code";

/// Payload key for the retryable flag on error envelopes.
pub const FIELD_RETRYABLE: &str = "retryable";

// =============================================================================
// TYPES
// =============================================================================

/// Object payload. Alias to reduce noise in signatures.
pub type Data = serde_json::Map<String, serde_json::Value>;

/// The universal message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub payload: Data,
}

/// `"payload": null` decodes the same as an absent payload.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Data, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Data>::deserialize(deserializer)?.unwrap_or_default())
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error envelopes.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Envelope {
    /// Create a server push with no correlation id.
    pub fn new(kind: impl Into<String>, payload: Data) -> Self {
        Self { kind: kind.into(), request_id: None, payload }
    }

    /// Create an uncorrelated error envelope, used when the inbound message
    /// could not be decoded at all.
    pub fn error_message(message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert(FIELD_MESSAGE.into(), serde_json::Value::String(message.into()));
        Self::new(kinds::ERROR, data)
    }

    /// Create a reply to this request. Inherits `request_id`.
    #[must_use]
    pub fn reply(&self, kind: impl Into<String>, payload: Data) -> Self {
        Self { kind: kind.into(), request_id: self.request_id.clone(), payload }
    }

    /// Create a structured error reply from a typed error.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(FIELD_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(FIELD_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(FIELD_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        self.reply(kinds::ERROR, data)
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

#[cfg(test)]
impl Envelope {
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Look up a string field in the payload.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(serde_json::Value::as_str)
    }
}

// =============================================================================
// DECODING
// =============================================================================

impl Envelope {
    /// Decode the payload into a typed message body.
    ///
    /// # Errors
    ///
    /// Returns the serde error if the payload does not match `T`.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.payload.clone()))
    }

    /// Serialize for the socket.
    ///
    /// # Errors
    ///
    /// Returns the serde error if a payload value cannot be encoded.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "envelope_test.rs"]
mod tests;
