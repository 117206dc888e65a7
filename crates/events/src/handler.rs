use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;

use crate::message::Message;

#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// The handler refused the message (validation, business rule).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The handler failed while processing the message.
    #[error("handler failed: {0}")]
    Failed(String),
}

/// Handles one message and optionally replies.
///
/// Returning `Ok(None)` means "handled, nothing to say"; no reply is sent.
/// Handlers run under at-least-once delivery and must tolerate duplicates.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> Result<Option<JsonValue>, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Message) -> Result<Option<JsonValue>, HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, message: &Message) -> Result<Option<JsonValue>, HandlerError> {
        (self.0)(message)
    }
}

/// Wrap a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&Message) -> Result<Option<JsonValue>, HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}
