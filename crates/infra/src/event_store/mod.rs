//! Read side of the event stream.
//!
//! The coordination layer pages through a stream for replays and tails it for
//! the cross-context bridge. It only appends to record the events it handles
//! locally and to accept events pushed into a source feed.

pub mod in_memory;
pub mod page;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use page::{PageLimit, StreamPage};
pub use r#trait::{EventStore, EventStoreError, StoredEvent};
