//! The packet envelope and its derived views.
//!
//! A [`Packet`] is the fundamental unit that flows through the system:
//! both dialects decode into it and the dispatcher consumes it.

use serde_json::Value;

use crate::constants::{to_user_id, FcType};
use crate::state::SessionState;

/// Decoded payload of a packet.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// No payload bytes on the wire.
    #[default]
    None,
    /// Payload bytes that did not parse as JSON.
    Raw(String),
    /// Payload parsed as JSON.
    Json(Value),
}

impl Payload {
    /// Parse payload text: JSON when it is JSON, raw otherwise.
    pub fn parse(text: &str) -> Payload {
        if text.is_empty() {
            return Payload::None;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Raw(text.to_string()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&str> {
        match self {
            Payload::Raw(text) => Some(text),
            _ => None,
        }
    }

    /// Payload text for either representation. Login acks, for example,
    /// carry a bare username that may or may not survive JSON parsing.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Payload::None => None,
            Payload::Raw(text) => Some(text.clone()),
            Payload::Json(Value::String(s)) => Some(s.clone()),
            Payload::Json(other) => Some(other.to_string()),
        }
    }
}

/// Immutable packet envelope shared by both wire dialects.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub fc_type: FcType,
    pub n_from: i32,
    pub n_to: i32,
    pub n_arg1: i32,
    pub n_arg2: i32,
    /// Byte length of the encoded payload before decoding.
    pub payload_len: usize,
    pub payload: Payload,
}

impl Packet {
    pub fn new(
        fc_type: FcType,
        n_from: i32,
        n_to: i32,
        n_arg1: i32,
        n_arg2: i32,
        payload_len: usize,
        payload: Payload,
    ) -> Packet {
        Packet { fc_type, n_from, n_to, n_arg1, n_arg2, payload_len, payload }
    }

    /// Session-state view of a JSON payload, when it is an object.
    pub fn payload_state(&self) -> Option<SessionState> {
        self.payload.as_json().and_then(SessionState::from_value)
    }

    /// The user id of the model this packet concerns, if any.
    ///
    /// Room-scoped packets name their subject in an envelope field, which
    /// is normalized out of the room-id bands; state snapshots name it in
    /// the payload (`uid`, with `0` standing for "same as `sid`").
    pub fn about_model_uid(&self) -> Option<i64> {
        match self.fc_type {
            // Room-scoped traffic: the target room identifies the model.
            FcType::CMesg
            | FcType::JoinChan
            | FcType::TokenInc
            | FcType::RoomHelper
            | FcType::ZBan
            | FcType::BanChan
            | FcType::RoomData => positive(to_user_id(self.n_to as i64)),
            // Direct traffic: the peer user identifies the model.
            FcType::PMesg => positive(to_user_id(self.n_from as i64)),
            // Per-user flags: the subject travels in the second argument.
            FcType::AddFriend | FcType::AddIgnore | FcType::MyCamState | FcType::MyWebcam => {
                positive(to_user_id(self.n_arg2 as i64))
            }
            // State snapshots carry identification in the payload.
            FcType::Details
            | FcType::SessionState
            | FcType::TxProfile
            | FcType::UsernameLookup => {
                let state = self.payload_state()?;
                let sid = state.sid();
                match state.uid() {
                    Some(0) | None if sid > 0 => Some(sid),
                    Some(uid) if uid > 0 => Some(uid),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Human-readable rendering for chat, PM and tip packets.
    pub fn chat_string(&self) -> Option<String> {
        let state = self.payload_state()?;
        let name = state.name().unwrap_or("unknown");
        match self.fc_type {
            FcType::CMesg | FcType::PMesg => {
                let msg = state.get("msg").and_then(Value::as_str).unwrap_or_default();
                Some(format!("{}: {}", name, clean_emotes(msg)))
            }
            FcType::TokenInc => {
                let tokens = state.get("tokens").and_then(Value::as_i64).unwrap_or(0);
                let mut line = format!("{name} has tipped {tokens} tokens");
                if let Some(msg) = state.get("msg").and_then(Value::as_str) {
                    if !msg.is_empty() {
                        line.push_str(": ");
                        line.push_str(&clean_emotes(msg));
                    }
                }
                Some(line)
            }
            _ => None,
        }
    }
}

fn positive(id: i64) -> Option<i64> {
    (id > 0).then_some(id)
}

/// Replace inline emote markup of the form `#~ue,<hash>.gif,<code>~#`
/// with the plain `:<code>` form. Malformed markup is left untouched.
pub fn clean_emotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("#~") {
        let Some(end_rel) = rest[start + 2..].find("~#") else {
            break;
        };
        let inner = &rest[start + 2..start + 2 + end_rel];
        out.push_str(&rest[..start]);
        match emote_code(inner) {
            Some(code) => {
                out.push(':');
                out.push_str(code);
            }
            None => {
                out.push_str("#~");
                out.push_str(inner);
                out.push_str("~#");
            }
        }
        rest = &rest[start + 2 + end_rel + 2..];
    }
    out.push_str(rest);
    out
}

fn emote_code(inner: &str) -> Option<&str> {
    let mut parts = inner.splitn(3, ',');
    if parts.next() != Some("ue") {
        return None;
    }
    let image = parts.next()?;
    if !image.ends_with(".gif") {
        return None;
    }
    let code = parts.next()?;
    (!code.is_empty()).then_some(code)
}
