use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use relay_events::DomainEvent;

use super::page::{PageLimit, StreamPage};
use super::r#trait::{EventStore, EventStoreError, StoredEvent};

/// In-memory positioned event stream.
///
/// Intended for tests/dev. Counts page reads so replay behaviour can be
/// asserted.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<StoredEvent>>,
    page_reads: AtomicUsize,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `read_page` calls served so far.
    pub fn page_reads(&self) -> usize {
        self.page_reads.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_poisoned() -> EventStoreError {
        EventStoreError::Unavailable("lock poisoned".to_string())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<DomainEvent>) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut stream = self.events.write().map_err(|_| Self::lock_poisoned())?;

        let mut next = stream.len() as u64 + 1;
        let mut committed = Vec::with_capacity(events.len());
        for event in events {
            let stored = StoredEvent {
                position: next,
                recorded_at: Utc::now(),
                event,
            };
            next += 1;
            stream.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }

    async fn read_page(&self, skip: u64, limit: PageLimit) -> Result<StreamPage, EventStoreError> {
        let limit = limit.validate()?;
        self.page_reads.fetch_add(1, Ordering::SeqCst);

        let stream = self.events.read().map_err(|_| Self::lock_poisoned())?;
        let start = (skip as usize).min(stream.len());
        let end = match limit {
            PageLimit::Bounded(n) => start.saturating_add(n as usize).min(stream.len()),
            PageLimit::Unbounded => stream.len(),
        };

        Ok(StreamPage {
            events: stream[start..end].to_vec(),
            skip,
            limit,
            exhausted: end >= stream.len(),
        })
    }

    async fn read_after(&self, position: u64, limit: u32) -> Result<Vec<StoredEvent>, EventStoreError> {
        let stream = self.events.read().map_err(|_| Self::lock_poisoned())?;
        // Positions are 1-based and gapless, so position p lives at index p - 1.
        let start = (position as usize).min(stream.len());
        let end = start.saturating_add(limit as usize).min(stream.len());
        Ok(stream[start..end].to_vec())
    }

    async fn ping(&self) -> Result<(), EventStoreError> {
        self.events.read().map(|_| ()).map_err(|_| Self::lock_poisoned())
    }
}
