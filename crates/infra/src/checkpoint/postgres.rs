//! Postgres-backed checkpoint store.
//!
//! One row per feed in `bridge_checkpoints`. Writes are upserts that keep
//! the greater of the stored and the new index.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use super::{CheckpointError, CheckpointStore, FeedKey};

#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
}

fn map_sqlx(e: sqlx::Error) -> CheckpointError {
    CheckpointError::Unavailable(e.to_string())
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the checkpoint table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_checkpoints (
                feed_key TEXT PRIMARY KEY,
                last_index BIGINT NOT NULL CHECK (last_index >= 0),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self, key), fields(feed = %key))]
    async fn get(&self, key: &FeedKey) -> Result<Option<u64>, CheckpointError> {
        let row = sqlx::query(
            r#"
            SELECT last_index
            FROM bridge_checkpoints
            WHERE feed_key = $1
            "#,
        )
        .bind(key.to_string())
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw: i64 = row.try_get("last_index").map_err(map_sqlx)?;
        u64::try_from(raw).map(Some).map_err(|_| CheckpointError::Corrupt {
            key: key.to_string(),
            reason: format!("negative index {raw}"),
        })
    }

    #[instrument(skip(self, key), fields(feed = %key))]
    async fn set(&self, key: &FeedKey, index: u64) -> Result<(), CheckpointError> {
        let index = i64::try_from(index).map_err(|_| CheckpointError::Corrupt {
            key: key.to_string(),
            reason: format!("index {index} out of range"),
        })?;

        sqlx::query(
            r#"
            INSERT INTO bridge_checkpoints (feed_key, last_index)
            VALUES ($1, $2)
            ON CONFLICT (feed_key)
            DO UPDATE SET
                last_index = GREATEST(bridge_checkpoints.last_index, EXCLUDED.last_index),
                updated_at = NOW()
            "#,
        )
        .bind(key.to_string())
        .bind(index)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), CheckpointError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}
