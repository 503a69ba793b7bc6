//! Wire types for the Codex `proto` protocol.
//!
//! Both directions are newline-delimited JSON, one object per line.
//!
//! Outbound (we write to the agent's stdin):
//! ```json
//! {"id": "c1", "op": {"type": "user_input", "items": [{"type": "text", "text": "hi"}]}}
//! ```
//!
//! Inbound (the agent writes to stdout):
//! ```json
//! {"id": "c1", "msg": {"type": "agent_message", "message": "Hello!"}}
//! ```
//!
//! The `id` is the correlation id: every event produced while servicing a
//! request carries the id of that request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::SessionOptions;

/// A request line sent to the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub id: String,
    pub op: Op,
}

impl Submission {
    pub fn new(id: impl Into<String>, op: Op) -> Self {
        Self { id: id.into(), op }
    }

    /// Serialize as a single line (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Operations the agent understands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    ConfigureSession {
        #[serde(flatten)]
        options: SessionOptions,
        cwd: String,
    },
    UserInput {
        items: Vec<InputItem>,
    },
    ExecApproval {
        call_id: String,
        decision: ReviewDecision,
        scope: ApprovalScope,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

/// One piece of user input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Text { text: String },
}

/// The user's answer to an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Deny,
}

/// How far an approval decision reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalScope {
    /// This call only.
    Once,
    /// Every similar call for the rest of the session.
    Session,
    /// Every call touching the given path prefix.
    Path,
}

/// An inbound event before interpretation.
///
/// `payload` is the `msg` object without its `type` field.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub correlation_id: String,
    pub event_type: String,
    pub payload: Map<String, Value>,
}

impl RawEvent {
    /// Build an event from a parsed line.
    ///
    /// Returns `None` for values that are not protocol events: non-objects,
    /// objects without a `msg` object, or a `msg` without a string `type`.
    /// A missing or non-string `id` becomes an empty (or stringified) id.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut object) = value else {
            return None;
        };
        let Some(Value::Object(mut payload)) = object.remove("msg") else {
            return None;
        };
        let event_type = match payload.remove("type") {
            Some(Value::String(t)) => t,
            _ => return None,
        };
        let correlation_id = match object.remove("id") {
            Some(Value::String(id)) => id,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Some(Self {
            correlation_id,
            event_type,
            payload,
        })
    }

    /// Interpret the payload.
    pub fn msg(&self) -> EventMsg {
        EventMsg::from_raw(&self.event_type, &self.payload)
    }
}

/// A single file change inside an approval request.
///
/// The agent sends these as tagged objects (`add`, `delete`, `update`); the
/// bridge only displays them, so they stay as JSON.
pub type FileChange = Value;

/// Event types this crate interprets.
///
/// Anything else decodes to [`EventMsg::Unknown`]: it still counts as activity
/// for its run but has no other effect.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMsg {
    SessionConfigured,
    AgentMessage {
        message: String,
    },
    AgentMessageDelta {
        delta: String,
    },
    TaskComplete {
        #[serde(default)]
        last_agent_message: Option<String>,
    },
    Error {
        message: String,
    },
    ApplyPatchApprovalRequest {
        call_id: String,
        #[serde(default)]
        changes: BTreeMap<String, FileChange>,
        #[serde(default)]
        justification: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl EventMsg {
    /// Decode a payload of the given type. Known types with malformed fields
    /// degrade to `Unknown`.
    pub fn from_raw(event_type: &str, payload: &Map<String, Value>) -> Self {
        let mut tagged = payload.clone();
        tagged.insert("type".to_string(), Value::String(event_type.to_string()));
        serde_json::from_value(Value::Object(tagged)).unwrap_or(EventMsg::Unknown)
    }

    /// True for events that end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventMsg::TaskComplete { .. } | EventMsg::Error { .. })
    }
}

/// An inbound event with both its raw and interpreted forms, as published on
/// the client's event bus.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub raw: RawEvent,
    pub msg: EventMsg,
}

impl InboundEvent {
    pub fn new(raw: RawEvent) -> Self {
        let msg = raw.msg();
        Self { raw, msg }
    }

    pub fn correlation_id(&self) -> &str {
        &self.raw.correlation_id
    }
}

// ============================================================================
// TESTS
// ============================================================================
