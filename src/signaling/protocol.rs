//! JSON envelopes exchanged with room and user sockets.
//!
//! Inbound messages are decoded once into a closed enum keyed by `type`.
//! Forwarded payloads keep the client's JSON verbatim, so routing fields are
//! read from the enum while the raw value travels through the group.

use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

/// Messages a client may send on a room socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RoomRequest {
    Authentication {
        #[serde(default)]
        password: String,
        user_id: String,
        username: String,
    },
    NotifyParticipant {
        user_id: String,
        username: String,
    },
    SendSdp {
        sender: String,
        receiver: String,
        sdp: String,
    },
    AnswerSdp {
        sender: String,
        receiver: String,
        sdp: String,
    },
    SendCandidate {
        sender: String,
        receiver: String,
        candidate: Value,
    },
    StreamStatus {
        sender: String,
        media: MediaKind,
        status: bool,
    },
    /// Any other `type`; ignored.
    #[serde(other)]
    Unknown,
}

/// A decoded room message together with the payload it arrived as.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub request: RoomRequest,
    pub raw: Value,
}

/// Decodes a room socket text frame. `None` for anything that is not a JSON
/// object with a known, well-formed shape.
pub fn decode_room_message(text: &str) -> Option<Inbound> {
    let raw: Value = serde_json::from_str(text).ok()?;
    if !raw.is_object() {
        return None;
    }
    let request = RoomRequest::deserialize(&raw).ok()?;
    Some(Inbound { request, raw })
}

/// Extracts the credential from a user socket frame, if any.
pub fn decode_access(text: &str) -> Option<String> {
    let raw: Value = serde_json::from_str(text).ok()?;
    match raw.get("access")? {
        Value::String(access) if !access.is_empty() => Some(access.clone()),
        _ => None,
    }
}

pub fn authentication_reply(result: bool, data: Value) -> Value {
    json!({"type": "authentication", "result": result, "data": data})
}

pub fn user_disconnected(user_id: &str) -> Value {
    json!({"type": "userdisconnected", "user_id": user_id})
}

pub fn error_reply(code: &str, detail: &str) -> Value {
    json!({"type": "error", "code": code, "detail": detail})
}

pub fn authorization_reply(result: bool) -> Value {
    json!({"type": "authorization", "result": result})
}

pub fn message_notice(message: Value) -> Value {
    json!({"type": "message", "message": message})
}

pub fn group_changed_notice(group_id: i64) -> Value {
    json!({"type": "group", "state": "changed", "id": group_id})
}

pub fn notification_notice(notification: Value) -> Value {
    json!({"type": "notification", "notification": notification})
}
