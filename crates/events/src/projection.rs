use async_trait::async_trait;
use thiserror::Error;

use crate::event::DomainEvent;

#[derive(Debug, Clone, Error)]
pub enum ProjectionError {
    /// The event is recognized but its payload is malformed.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The read model store rejected the update.
    #[error("read model store error: {0}")]
    Store(String),
}

/// A projection builds a read model from an append-only event stream.
///
/// Projections must be **idempotent**: applying the same event twice leaves
/// the read model as if it had been applied once. Replays and the bus both
/// deliver at-least-once.
///
/// Events the projection does not recognize are ignored (`Ok(())`).
/// Read models are disposable and can be rebuilt by replaying the stream.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Stable name, used in logs and replay job metadata.
    fn name(&self) -> &str;

    async fn apply(&self, event: &DomainEvent) -> Result<(), ProjectionError>;
}

#[async_trait]
impl<P> Projection for std::sync::Arc<P>
where
    P: Projection + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn apply(&self, event: &DomainEvent) -> Result<(), ProjectionError> {
        (**self).apply(event).await
    }
}
