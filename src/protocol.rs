//! Wire framing: ordered 5-tuples rendered as JSON arrays.
//!
//! A frame is `[join_seq, seq, topic, event, payload]`. The two leading
//! elements are nullable strings: a non-null `seq` marks a request that
//! expects a reply (or the reply referencing it); null `seq` marks a
//! fire-and-forget notification. `payload` is an arbitrary JSON value whose
//! shape is fixed by `event`.
//!
//! Decode failures are drop-frame signals. They never abort the link.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Reserved topic for transport-level messages (heartbeats and their replies).
pub const SYSTEM_TOPIC: &str = "$system";

/// Event literals recognized by the router.
pub mod event {
    pub const JOIN: &str = "chan:join";
    pub const LEAVE: &str = "chan:leave";
    pub const REPLY: &str = "chan:reply";
    pub const CLOSE: &str = "chan:close";
    pub const ERROR: &str = "chan:error";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const BROADCAST: &str = "broadcast";
    pub const PRESENCE: &str = "presence";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
    pub const HEARTBEAT: &str = "heartbeat";
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("frame is not a JSON array")]
    NotArray,
    #[error("frame has {0} elements, expected 5")]
    WrongArity(usize),
    #[error("frame element `{0}` has the wrong type")]
    BadElement(&'static str),
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub join_seq: Option<String>,
    pub seq: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Frame {
    /// Fire-and-forget notification: both sequence slots null.
    pub fn notify(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_seq: None,
            seq: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Request expecting a reply correlated by `seq`.
    pub fn request(
        join_seq: Option<String>,
        seq: impl Into<String>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            join_seq,
            seq: Some(seq.into()),
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Ok reply referencing the request with sequence `seq`.
    pub fn reply_ok(seq: impl Into<String>, topic: impl Into<String>, response: Value) -> Self {
        Self {
            join_seq: None,
            seq: Some(seq.into()),
            topic: topic.into(),
            event: event::REPLY.to_owned(),
            payload: json!({"status": "ok", "response": response}),
        }
    }

    /// Error reply carrying a machine-readable code and a reason.
    pub fn reply_error(
        seq: impl Into<String>,
        topic: impl Into<String>,
        code: &str,
        reason: &str,
    ) -> Self {
        Self {
            join_seq: None,
            seq: Some(seq.into()),
            topic: topic.into(),
            event: event::REPLY.to_owned(),
            payload: json!({"status": "error", "response": {"code": code, "reason": reason}}),
        }
    }

    /// Error reply with extra response fields merged in (e.g. `retry_after`).
    pub fn reply_error_with(
        seq: impl Into<String>,
        topic: impl Into<String>,
        code: &str,
        reason: &str,
        extra: Value,
    ) -> Self {
        let mut response = json!({"code": code, "reason": reason});
        if let (Some(dst), Some(src)) = (response.as_object_mut(), extra.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
        Self {
            join_seq: None,
            seq: Some(seq.into()),
            topic: topic.into(),
            event: event::REPLY.to_owned(),
            payload: json!({"status": "error", "response": response}),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.event == event::REPLY
    }

    /// Serialize to the wire form. Fails only if the payload is not
    /// JSON-serializable (non-finite floats and the like).
    pub fn encode(&self) -> Result<String, FrameError> {
        let arr = Value::Array(vec![
            self.join_seq
                .as_deref()
                .map_or(Value::Null, |s| Value::String(s.to_owned())),
            self.seq
                .as_deref()
                .map_or(Value::Null, |s| Value::String(s.to_owned())),
            Value::String(self.topic.clone()),
            Value::String(self.event.clone()),
            self.payload.clone(),
        ]);
        Ok(serde_json::to_string(&arr)?)
    }

    /// Parse a wire frame. Any failure means "drop this frame".
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(mut elems) = value else {
            return Err(FrameError::NotArray);
        };
        if elems.len() != 5 {
            return Err(FrameError::WrongArity(elems.len()));
        }
        let payload = elems.pop().expect("arity checked");
        let event = elems.pop().expect("arity checked");
        let topic = elems.pop().expect("arity checked");
        let seq = elems.pop().expect("arity checked");
        let join_seq = elems.pop().expect("arity checked");

        let join_seq = match join_seq {
            Value::Null => None,
            Value::String(s) => Some(s),
            _ => return Err(FrameError::BadElement("join_seq")),
        };
        let seq = match seq {
            Value::Null => None,
            Value::String(s) => Some(s),
            _ => return Err(FrameError::BadElement("seq")),
        };
        let Value::String(topic) = topic else {
            return Err(FrameError::BadElement("topic"));
        };
        let Value::String(event) = event else {
            return Err(FrameError::BadElement("event"));
        };

        Ok(Self {
            join_seq,
            seq,
            topic,
            event,
            payload,
        })
    }
}

/// Parsed reply payload: `{status: "ok"|"error", response: {...}}`.
#[derive(Debug, Clone)]
pub struct Reply {
    pub ok: bool,
    pub response: Value,
}

impl Reply {
    pub fn parse(payload: &Value) -> Option<Self> {
        let status = payload.get("status")?.as_str()?;
        let response = payload.get("response").cloned().unwrap_or(Value::Null);
        match status {
            "ok" => Some(Self { ok: true, response }),
            "error" => Some(Self {
                ok: false,
                response,
            }),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.response.get("code").and_then(Value::as_str)
    }

    pub fn reason(&self) -> Option<&str> {
        self.response.get("reason").and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Channel configuration (carried in chan:join payloads)
// ---------------------------------------------------------------------------

/// Per-subscription broadcast options.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BroadcastConfig {
    /// Deliver the member's own broadcasts back to it.
    #[serde(rename = "self", default)]
    pub include_self: bool,
    /// Acknowledge the member's broadcasts with a reply.
    #[serde(default)]
    pub ack: bool,
}

/// Per-subscription presence options.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PresenceConfig {
    /// Application-chosen presence key (user id, device id, ...).
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub enabled: bool,
}

/// Effective channel configuration negotiated at join.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChannelConfig {
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
}

impl ChannelConfig {
    /// A non-empty key enables presence even when the flag is unset.
    pub fn presence_enabled(&self) -> bool {
        self.presence.enabled || !self.presence.key.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
