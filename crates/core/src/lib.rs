//! `relay-core`: shared building blocks for the coordination layer.
//!
//! Pure primitives only: identifiers, the domain error model, optimistic
//! version expectations and the injected failure policy.

pub mod error;
pub mod failure;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use failure::{ExitProcess, FailurePolicy, RecordingFailurePolicy};
pub use id::{AggregateId, MessageId, SagaId};
pub use version::ExpectedVersion;
