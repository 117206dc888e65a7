use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use relay_events::DomainEvent;

use super::page::{PageLimit, StreamPage};

/// An event persisted in a stream, with its position.
///
/// Positions are 1-based, monotonically increasing and gapless within a
/// stream. The bridge uses them as checkpoint indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub position: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: DomainEvent,
}

#[derive(Debug, Clone, Error)]
pub enum EventStoreError {
    /// The store could not be reached.
    #[error("event store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid read: {0}")]
    InvalidRead(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),
}

/// A positioned, append-only event stream.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events at the end of the stream, assigning positions.
    async fn append(&self, events: Vec<DomainEvent>) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Read at most `limit` events starting at offset `skip` (0-based).
    async fn read_page(&self, skip: u64, limit: PageLimit) -> Result<StreamPage, EventStoreError>;

    /// Read at most `limit` events whose position is greater than `position`.
    async fn read_after(&self, position: u64, limit: u32) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(&self, events: Vec<DomainEvent>) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events).await
    }

    async fn read_page(&self, skip: u64, limit: PageLimit) -> Result<StreamPage, EventStoreError> {
        (**self).read_page(skip, limit).await
    }

    async fn read_after(&self, position: u64, limit: u32) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).read_after(position, limit).await
    }

    async fn ping(&self) -> Result<(), EventStoreError> {
        (**self).ping().await
    }
}
