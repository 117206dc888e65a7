//! In-memory message bus for tests/dev.

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::{BusError, MessageBus, ReplySink, Subscription};
use crate::handler::MessageHandler;
use crate::message::{HandlerFailure, HandlerResponse, Message, MessageKind};

struct Registration {
    name: String,
    kind: MessageKind,
    handler: Arc<dyn MessageHandler>,
}

/// In-memory pub/sub bus with registered handlers.
///
/// - Subscribers receive a copy of every message (best-effort fan-out)
/// - Each matching handler runs on its own task; outcomes go to the reply sink
/// - At-least-once acceptable (handlers must be idempotent)
pub struct InMemoryMessageBus {
    namespace: String,
    handlers: RwLock<Vec<Registration>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
}

impl core::fmt::Debug for InMemoryMessageBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryMessageBus")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl InMemoryMessageBus {
    /// `namespace` is the bus's logical name, e.g. `"example-app.sale"`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            handlers: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Register a handler for one message kind.
    pub fn register(
        &self,
        name: impl Into<String>,
        kind: MessageKind,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| BusError::Transport("handler registry lock poisoned".to_string()))?;
        handlers.push(Registration {
            name: name.into(),
            kind,
            handler,
        });
        Ok(())
    }

    fn handlers_for(&self, kind: MessageKind) -> Result<Vec<(String, Arc<dyn MessageHandler>)>, BusError> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| BusError::Transport("handler registry lock poisoned".to_string()))?;
        Ok(handlers
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| (r.name.clone(), r.handler.clone()))
            .collect())
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, message: Message, replies: Option<ReplySink>) -> Result<(), BusError> {
        {
            let mut subs = self
                .subscribers
                .lock()
                .map_err(|_| BusError::Transport("subscriber lock poisoned".to_string()))?;
            // Drop any dead subscribers while publishing.
            subs.retain(|tx| tx.send(message.clone()).is_ok());
        }

        let handlers = self.handlers_for(message.kind)?;
        debug!(
            bus = %self.namespace,
            kind = %message.kind,
            message_id = %message.id,
            handlers = handlers.len(),
            "message published"
        );

        let message = Arc::new(message);
        for (name, handler) in handlers {
            let message = message.clone();
            let replies = replies.clone();
            tokio::spawn(async move {
                let outcome = handler.handle(&message).await;
                let Some(replies) = replies else {
                    return;
                };
                let reply = match outcome {
                    Ok(Some(payload)) => Ok(HandlerResponse {
                        handler: name,
                        message_id: message.id,
                        payload,
                    }),
                    Ok(None) => return,
                    Err(error) => Err(HandlerFailure {
                        handler: name,
                        message_id: message.id,
                        error,
                    }),
                };
                // Publisher may have stopped listening; that is fine.
                let _ = replies.send(reply);
            });
        }

        Ok(())
    }

    fn subscribe(&self) -> Subscription<Message> {
        let (tx, rx) = mpsc::unbounded_channel();

        // If the lock is poisoned we still return a subscription;
        // it just won't receive messages.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}
