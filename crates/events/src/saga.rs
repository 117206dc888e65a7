//! Saga timeout mechanics (framework only, no business rules).
//!
//! A saga is a long-running process coordinating several aggregates. Sagas
//! may arm a timeout; once it elapses, a scheduler in infra asks the saga for
//! its timeout commands, queues them, clears the timeout and commits.
//!
//! - Queued commands are dispatched by the repository on commit
//! - Commits use optimistic concurrency; a stale saga is rejected
//! - Dispatch is at-least-once; command handlers must tolerate duplicates

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use relay_core::SagaId;

use crate::message::Message;

/// A command a saga wants sent once it commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCommand {
    /// Target context; `None` sends to the local context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub payload: JsonValue,
}

impl SagaCommand {
    pub fn new(payload: JsonValue) -> Self {
        Self {
            context: None,
            payload,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn into_message(self) -> Message {
        let message = Message::command(self.payload);
        match self.context {
            Some(context) => message.with_context(context),
            None => message,
        }
    }
}

/// What a successful commit did to the saga.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Updated,
    Removed,
}

#[derive(Debug, Clone, Error)]
pub enum SagaError {
    #[error("saga {id} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict { id: SagaId, expected: u64, actual: u64 },

    #[error("saga {0} not found")]
    NotFound(SagaId),

    #[error("command dispatch failed: {0}")]
    Dispatch(String),

    #[error("saga storage error: {0}")]
    Storage(String),
}

/// A saga loaded from a repository, able to resolve its own timeout.
#[async_trait]
pub trait TimeoutSaga: Send {
    fn id(&self) -> SagaId;

    fn timeout_at(&self) -> Option<DateTime<Utc>>;

    /// Commands to send when the timeout fires. `None` means none.
    fn timeout_commands(&self) -> Option<Vec<SagaCommand>>;

    fn add_command_to_send(&mut self, command: SagaCommand);

    fn remove_timeout(&mut self);

    /// Whether the saga should be destroyed once its timeout is resolved.
    fn remove_after_timeout(&self) -> bool {
        false
    }

    /// Mark the saga for removal on the next commit.
    fn destroy(&mut self);

    /// Persist the saga's changes and dispatch its queued commands.
    async fn commit(&mut self) -> Result<CommitOutcome, SagaError>;
}

#[async_trait]
pub trait SagaRepository: Send + Sync {
    type Saga: TimeoutSaga;

    /// Every saga whose timeout is at or before `now`.
    async fn timed_out_sagas(&self, now: DateTime<Utc>) -> Result<Vec<Self::Saga>, SagaError>;
}
