//! Envelope wire model.
//!
//! Every PortLink frame is a JSON object carrying the protocol marker and
//! version. The raw port is shared with arbitrary unrelated traffic, so
//! classification is shape-based and total: anything that does not carry the
//! marker is [`Inbound::Foreign`] and must produce no observable effect
//! downstream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Protocol marker distinguishing PortLink traffic from unrelated messages on
/// the same port.
pub const PROTOCOL_MARKER: &str = "portlink";

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Reserved control message types. Application code cannot register handlers
/// for these; they are intercepted before dispatch.
pub const TYPE_HANDSHAKE_INIT: &str = "__portlink_handshake_init__";
pub const TYPE_HANDSHAKE_ACK: &str = "__portlink_handshake_ack__";
pub const TYPE_HEARTBEAT_PING: &str = "__portlink_ping__";
pub const TYPE_HEARTBEAT_PONG: &str = "__portlink_pong__";
pub const TYPE_DISCONNECT: &str = "__portlink_disconnect__";

/// Control envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    HandshakeInit,
    HandshakeAck,
    HeartbeatPing,
    HeartbeatPong,
    Disconnect,
}

impl ControlKind {
    /// Wire type tag for this control kind.
    pub fn as_type(self) -> &'static str {
        match self {
            ControlKind::HandshakeInit => TYPE_HANDSHAKE_INIT,
            ControlKind::HandshakeAck => TYPE_HANDSHAKE_ACK,
            ControlKind::HeartbeatPing => TYPE_HEARTBEAT_PING,
            ControlKind::HeartbeatPong => TYPE_HEARTBEAT_PONG,
            ControlKind::Disconnect => TYPE_DISCONNECT,
        }
    }

    /// Reverse lookup from a wire type tag.
    pub fn from_type(t: &str) -> Option<Self> {
        match t {
            TYPE_HANDSHAKE_INIT => Some(ControlKind::HandshakeInit),
            TYPE_HANDSHAKE_ACK => Some(ControlKind::HandshakeAck),
            TYPE_HEARTBEAT_PING => Some(ControlKind::HeartbeatPing),
            TYPE_HEARTBEAT_PONG => Some(ControlKind::HeartbeatPong),
            TYPE_DISCONNECT => Some(ControlKind::Disconnect),
            _ => None,
        }
    }
}

/// Error detail carried by failure replies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    /// Stable machine-readable code (see [`crate::ErrorCode`]).
    pub code: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

/// PortLink envelope (message, reply, or control frame).
///
/// Replies reuse the message shape plus `replyTo` and `ok`; both must be
/// present for a frame to classify as a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol marker; always [`PROTOCOL_MARKER`].
    pub proto: String,
    /// Protocol version.
    pub v: u8,
    /// Globally unique message id, fresh per transmission.
    pub id: Uuid,
    /// Message type (field name is `type` in JSON).
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Sender-declared origin.
    pub origin: String,
    /// Creation timestamp, unix epoch milliseconds.
    pub ts: u64,
    /// Whether the sender expects a reply envelope.
    #[serde(rename = "expectsResponse", default)]
    pub expects_response: bool,
    /// Target id this envelope is addressed to, if any.
    #[serde(rename = "targetId", default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Application payload. May be `null`, but the key is always present.
    pub payload: Value,
    /// Back-reference to the originating message id (replies only).
    #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    /// Success/failure discriminator (replies only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// Failure detail (failure replies only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Unix epoch milliseconds. Saturates to 0 on a pre-epoch clock.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Envelope {
    /// Build an application message with a fresh id and current timestamp.
    pub fn message(msg_type: &str, payload: Value, origin: &str, expects_response: bool) -> Self {
        Self {
            proto: PROTOCOL_MARKER.to_string(),
            v: PROTOCOL_VERSION,
            id: Uuid::new_v4(),
            msg_type: msg_type.to_string(),
            origin: origin.to_string(),
            ts: now_ms(),
            expects_response,
            target_id: None,
            payload,
            reply_to: None,
            ok: None,
            error: None,
        }
    }

    /// Build a control envelope (handshake/heartbeat/disconnect).
    pub fn control(kind: ControlKind, origin: &str) -> Self {
        Self::message(kind.as_type(), Value::Null, origin, false)
    }

    /// Build a success reply to `original`.
    pub fn reply_ok(original: &Envelope, payload: Value, origin: &str) -> Self {
        let mut env = Self::message(&original.msg_type, payload, origin, false);
        env.reply_to = Some(original.id);
        env.ok = Some(true);
        env
    }

    /// Build a failure reply to `original`.
    pub fn reply_err(original: &Envelope, code: &str, message: &str, origin: &str) -> Self {
        let mut env = Self::message(&original.msg_type, Value::Null, origin, false);
        env.reply_to = Some(original.id);
        env.ok = Some(false);
        env.error = Some(WireError {
            code: code.to_string(),
            message: message.to_string(),
        });
        env
    }

    /// Address this envelope to a specific target id.
    pub fn with_target(mut self, target_id: &str) -> Self {
        self.target_id = Some(target_id.to_string());
        self
    }

    /// Whether this envelope's shape marks it as a reply.
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some() && self.ok.is_some()
    }

    /// The control kind of this envelope, if its type tag is reserved.
    pub fn control_kind(&self) -> Option<ControlKind> {
        ControlKind::from_type(&self.msg_type)
    }

    /// Serialize to the wire string.
    pub fn encode(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::PortLinkError::Serialization(e.to_string()))
    }
}

/// Classified inbound frame.
#[derive(Debug)]
pub enum Inbound {
    /// Application message.
    Message(Envelope),
    /// Reply to a previously sent message.
    Reply(Envelope),
    /// Protocol control frame.
    Control(ControlKind, Envelope),
    /// Not PortLink traffic. Must be dropped with no observable effect.
    Foreign,
}

/// Cheap marker probe: whether a raw string even claims to be PortLink
/// traffic. Never errors.
pub fn is_protocol_traffic(raw: &str) -> bool {
    !matches!(classify(raw), Inbound::Foreign)
}

/// Classify a raw inbound string. Total: malformed or unrelated input is
/// [`Inbound::Foreign`], never an error.
pub fn classify(raw: &str) -> Inbound {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Inbound::Foreign,
    };
    if value.get("proto").and_then(Value::as_str) != Some(PROTOCOL_MARKER) {
        return Inbound::Foreign;
    }
    if value.get("v").and_then(Value::as_u64) != Some(PROTOCOL_VERSION as u64) {
        return Inbound::Foreign;
    }
    // The payload key must be present even when null.
    if value.get("payload").is_none() {
        return Inbound::Foreign;
    }
    let env: Envelope = match serde_json::from_value(value) {
        Ok(e) => e,
        Err(_) => return Inbound::Foreign,
    };
    if let Some(kind) = env.control_kind() {
        // Heartbeat pongs travel as replies to the ping id; classify control
        // by type tag first so they are never dispatched as application traffic.
        return Inbound::Control(kind, env);
    }
    if env.is_reply() {
        return Inbound::Reply(env);
    }
    Inbound::Message(env)
}
