//! Control-message envelopes.
//!
//! Control traffic travels in WebSocket text frames as JSON objects with a
//! `type` discriminator. Terminal bytes travel in binary frames and never pass
//! through this module.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::session::SessionSummary;

/// Client → server control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ControlRequest {
    #[serde(rename = "auth")]
    Auth {
        #[serde(default)]
        token: Option<String>,
    },
    #[serde(rename = "session:create")]
    CreateSession {
        #[serde(default)]
        cwd: Option<String>,
    },
    #[serde(rename = "session:list")]
    ListSessions {},
    #[serde(rename = "session:attach")]
    AttachSession { session_id: String },
    #[serde(rename = "resize")]
    Resize {
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    #[serde(rename = "session:destroy")]
    DestroySession { session_id: String },
}

const KNOWN_TYPES: [&str; 6] = [
    "auth",
    "session:create",
    "session:list",
    "session:attach",
    "resize",
    "session:destroy",
];

/// Server → client control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "auth:success")]
    AuthSuccess {},
    #[serde(rename = "auth:failed")]
    AuthFailed { error: String },
    #[serde(rename = "session:created")]
    SessionCreated { session: SessionSummary },
    #[serde(rename = "session:list")]
    SessionList { sessions: Vec<SessionSummary> },
    #[serde(rename = "session:attached")]
    SessionAttached { session: SessionSummary },
    #[serde(rename = "session:destroyed")]
    SessionDestroyed { session_id: String },
    #[serde(rename = "session:exit")]
    SessionExit { session_id: String, exit_code: i32 },
    #[serde(rename = "error")]
    Error { error: String },
}

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        ServerMessage::Error {
            error: err.to_string(),
        }
    }
}

/// Failures reported back to the offending connection as `error` messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid control message")]
    Malformed,
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Session not found")]
    SessionNotFound,
}

/// A control frame whose `type` is known but whose body is not decoded yet.
///
/// Splitting the two steps lets the connection reject unauthenticated traffic
/// before looking at the message body.
#[derive(Debug)]
pub struct Envelope {
    kind: String,
    body: Value,
}

impl Envelope {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let body: Value = serde_json::from_slice(payload).map_err(|_| ProtocolError::Malformed)?;
        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::Malformed)?
            .to_owned();
        Ok(Self { kind, body })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_auth(&self) -> bool {
        self.kind == "auth"
    }

    pub fn into_request(self) -> Result<ControlRequest, ProtocolError> {
        if !KNOWN_TYPES.contains(&self.kind.as_str()) {
            return Err(ProtocolError::UnknownType(self.kind));
        }
        serde_json::from_value(self.body).map_err(|_| ProtocolError::Malformed)
    }
}
