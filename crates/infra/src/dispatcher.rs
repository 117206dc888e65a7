//! Message dispatch pipeline for the inbound edge.
//!
//! ```text
//! kind + payload
//!   ↓
//! 1. Validate the payload (must be a JSON object)
//!   ↓
//! 2. Publish on the bus with a reply sink
//!   ↓
//! 3a. fire-and-forget: forward later handler failures to the error handler
//! 3b. aggregating: collect responses until the bus has been quiet for the
//!     debounce window, then deliver them once
//! ```
//!
//! The debounce window opens with the first response and restarts on every
//! later one, so a slow first handler is still waited for. Once every handler
//! has finished the reply channel closes: with no response collected the
//! empty list is delivered right away, otherwise the open window runs out.
//! Handler failures never end an aggregation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use relay_core::MessageId;
use relay_events::{
    BusError, HandlerError, HandlerFailure, HandlerResponse, Message, MessageBus, MessageKind, Reply,
};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Caller-contract violation.
    #[error("payload must be a JSON object, got {0}")]
    InvalidPayload(String),

    #[error("publish failed: {0}")]
    Bus(#[from] BusError),

    #[error("handler '{handler}' failed: {error}")]
    Handler {
        handler: String,
        message_id: MessageId,
        error: HandlerError,
    },
}

impl From<HandlerFailure> for DispatchError {
    fn from(f: HandlerFailure) -> Self {
        DispatchError::Handler {
            handler: f.handler,
            message_id: f.message_id,
            error: f.error,
        }
    }
}

pub type ErrorHandler = Arc<dyn Fn(DispatchError) + Send + Sync>;
pub type ResponseHandler = Box<dyn FnOnce(Vec<HandlerResponse>) + Send>;

/// Callbacks for one dispatch.
///
/// Without a `response_handler` the dispatch is fire-and-forget.
pub struct DispatchHandlers {
    pub error_handler: ErrorHandler,
    pub response_handler: Option<ResponseHandler>,
}

impl DispatchHandlers {
    pub fn fire_and_forget(error_handler: impl Fn(DispatchError) + Send + Sync + 'static) -> Self {
        Self {
            error_handler: Arc::new(error_handler),
            response_handler: None,
        }
    }

    pub fn aggregating(
        error_handler: impl Fn(DispatchError) + Send + Sync + 'static,
        response_handler: impl FnOnce(Vec<HandlerResponse>) + Send + 'static,
    ) -> Self {
        Self {
            error_handler: Arc::new(error_handler),
            response_handler: Some(Box::new(response_handler)),
        }
    }
}

#[derive(Clone)]
pub struct MessageDispatcher {
    bus: Arc<dyn MessageBus>,
    debounce: Duration,
}

impl core::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

impl MessageDispatcher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Publish `payload` as a `kind` message.
    ///
    /// Returns the task that follows up on handler replies, or `None` when the
    /// message never made it onto the bus (the error handler has been told).
    pub async fn dispatch(
        &self,
        kind: MessageKind,
        payload: JsonValue,
        handlers: DispatchHandlers,
    ) -> Option<JoinHandle<()>> {
        let DispatchHandlers {
            error_handler,
            response_handler,
        } = handlers;

        if !payload.is_object() {
            error_handler(DispatchError::InvalidPayload(json_type(&payload).to_string()));
            return None;
        }

        let message = Message::new(kind, payload);
        let message_id = message.id;
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        if let Err(e) = self.bus.publish(message, Some(replies_tx)).await {
            warn!(%message_id, %kind, error = %e, "dispatch publish failed");
            error_handler(DispatchError::Bus(e));
            return None;
        }
        debug!(%message_id, %kind, aggregating = response_handler.is_some(), "message dispatched");

        let task = match response_handler {
            None => tokio::spawn(forward_failures(replies_rx, error_handler)),
            Some(respond) => tokio::spawn(aggregate(replies_rx, self.debounce, error_handler, respond)),
        };
        Some(task)
    }
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

async fn forward_failures(mut replies: mpsc::UnboundedReceiver<Reply>, error_handler: ErrorHandler) {
    while let Some(reply) = replies.recv().await {
        if let Err(failure) = reply {
            error_handler(failure.into());
        }
    }
}

async fn aggregate(
    mut replies: mpsc::UnboundedReceiver<Reply>,
    window: Duration,
    error_handler: ErrorHandler,
    respond: ResponseHandler,
) {
    let mut responses = Vec::new();
    // Unset until the first response arrives.
    let mut deadline: Option<Instant> = None;
    let mut open = true;

    loop {
        let quiet = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            reply = replies.recv(), if open => match reply {
                Some(Ok(response)) => {
                    responses.push(response);
                    deadline = Some(Instant::now() + window);
                }
                Some(Err(failure)) => error_handler(failure.into()),
                None if responses.is_empty() => break,
                None => open = false,
            },
            _ = quiet => break,
        }
    }

    debug!(responses = responses.len(), "aggregation window closed");
    respond(responses);
}
