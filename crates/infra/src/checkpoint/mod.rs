//! Last-processed-index persistence for external event feeds.
//!
//! The bridge reads a feed's checkpoint once at startup and writes it after
//! every fully published batch. Stores never let a checkpoint go backwards.

pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use in_memory::InMemoryCheckpointStore;
pub use postgres::PostgresCheckpointStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCheckpointStore;

/// Identifies one external feed consumed by one local context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedKey {
    pub app: String,
    pub context: String,
    pub source_context: String,
}

impl FeedKey {
    pub fn new(
        app: impl Into<String>,
        context: impl Into<String>,
        source_context: impl Into<String>,
    ) -> Self {
        Self {
            app: app.into(),
            context: context.into(),
            source_context: source_context.into(),
        }
    }
}

impl core::fmt::Display for FeedKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}-{}-ext-{}:LAST_INDEX",
            self.app, self.context, self.source_context
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt checkpoint for '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last stored index for `key`, if any.
    async fn get(&self, key: &FeedKey) -> Result<Option<u64>, CheckpointError>;

    /// Store `index` for `key`. A lower value than the stored one is ignored.
    async fn set(&self, key: &FeedKey, index: u64) -> Result<(), CheckpointError>;

    async fn ping(&self) -> Result<(), CheckpointError>;
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn get(&self, key: &FeedKey) -> Result<Option<u64>, CheckpointError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &FeedKey, index: u64) -> Result<(), CheckpointError> {
        (**self).set(key, index).await
    }

    async fn ping(&self) -> Result<(), CheckpointError> {
        (**self).ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_key_format() {
        let key = FeedKey::new("example-app", "routemanagement", "sale");
        assert_eq!(key.to_string(), "example-app-routemanagement-ext-sale:LAST_INDEX");
    }
}
