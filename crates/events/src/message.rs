//! Bus messages and handler replies.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use relay_core::{DomainError, MessageId};

use crate::handler::HandlerError;

/// The two message families carried by the bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Command,
    Event,
}

impl MessageKind {
    /// Short wire tag (`"cmd"` / `"evt"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "cmd",
            MessageKind::Event => "evt",
        }
    }
}

impl core::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cmd" | "command" => Ok(MessageKind::Command),
            "evt" | "event" => Ok(MessageKind::Event),
            other => Err(DomainError::validation(format!(
                "unknown message kind '{other}' (expected 'cmd' or 'evt')"
            ))),
        }
    }
}

/// A message on the bus.
///
/// `context` names the bounded context the message belongs to; `None` means
/// the local context. Routing buses use it to pick a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub payload: JsonValue,
}

impl Message {
    pub fn new(kind: MessageKind, payload: JsonValue) -> Self {
        Self {
            id: MessageId::new(),
            kind,
            context: None,
            payload,
        }
    }

    pub fn command(payload: JsonValue) -> Self {
        Self::new(MessageKind::Command, payload)
    }

    pub fn event(payload: JsonValue) -> Self {
        Self::new(MessageKind::Event, payload)
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// A successful reply from one handler to one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResponse {
    pub handler: String,
    pub message_id: MessageId,
    pub payload: JsonValue,
}

/// A failed handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler: String,
    pub message_id: MessageId,
    pub error: HandlerError,
}

/// What a handler sends back over a reply sink.
pub type Reply = Result<HandlerResponse, HandlerFailure>;
