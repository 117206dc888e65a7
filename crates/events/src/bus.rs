//! Message publishing/subscription abstraction (mechanics only).
//!
//! The bus carries commands and events between the inbound edge, the bridge,
//! the saga scheduler and the handlers. It makes minimal assumptions:
//!
//! - **Transport-agnostic**: in-memory channels here, brokers elsewhere
//! - **At-least-once delivery**: consumers must tolerate duplicates
//! - **No persistence**: the event store is the source of truth
//!
//! Handler replies are optional. A publisher that wants them passes a
//! [`ReplySink`]; each handler that produces an outcome sends one [`Reply`]
//! through it. The sink closes once every handler invocation has finished
//! and the publisher has dropped its own sender.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{Message, Reply};

/// Channel on which handler outcomes for one published message are delivered.
pub type ReplySink = mpsc::UnboundedSender<Reply>;

#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("no route for context '{0}'")]
    NoRoute(String),

    #[error("bus transport error: {0}")]
    Transport(String),
}

/// A subscription to every message published on a bus (broadcast semantics).
///
/// Subscriptions are meant for a single consuming task.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// A subscription that never yields anything.
    pub fn closed() -> Self {
        let (_tx, rx) = mpsc::unbounded_channel();
        Self { receiver: rx }
    }

    /// Wait for the next message; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait up to `timeout` for a message. `Ok(None)` means the bus is gone.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<M>, tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, self.receiver.recv()).await
    }
}

/// Domain-agnostic message bus.
///
/// `publish` returns once the transport has accepted the message. It does
/// not wait for handlers; their outcomes arrive on `replies`, if given.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: Message, replies: Option<ReplySink>) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<Message>;
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn publish(&self, message: Message, replies: Option<ReplySink>) -> Result<(), BusError> {
        (**self).publish(message, replies).await
    }

    fn subscribe(&self) -> Subscription<Message> {
        (**self).subscribe()
    }
}
