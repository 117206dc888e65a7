//! Saga infrastructure: storage with optimistic versions and the timeout
//! scheduler.

pub mod in_memory;
pub mod timeout_scheduler;

pub use in_memory::{InMemorySagaRepository, SagaRecord, StoredSaga};
pub use timeout_scheduler::{
    DEFAULT_TIMEOUT_PERIOD, SagaTimeoutScheduler, SchedulerConfig, TickOverlap, TickReport, TickStatus,
};
