//! Postgres-backed event stream.
//!
//! All streams share the `event_streams` table; a store instance is scoped to
//! one stream name. Positions are assigned on append under a per-stream
//! advisory lock, so they stay gapless and 1-based, and the primary key on
//! `(stream, position)` rejects any writer that bypasses the lock.
//!
//! Another service can feed a stream by inserting rows with the next
//! position directly; the bridge tails the table with `read_after`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `InvalidAppend` |
//! | Database (check constraint violation) | `23514` | `InvalidAppend` |
//! | Database (other) | Any other | `Unavailable` |
//! | Anything else | N/A | `Unavailable` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use relay_core::AggregateId;
use relay_events::DomainEvent;

use super::page::{PageLimit, StreamPage};
use super::r#trait::{EventStore, EventStoreError, StoredEvent};

#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    stream: String,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool, stream: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Create the stream table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_streams (
                stream TEXT NOT NULL,
                position BIGINT NOT NULL CHECK (position > 0),
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                name TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                revision BIGINT NOT NULL CHECK (revision >= 0),
                payload JSONB NOT NULL DEFAULT '{}'::jsonb,
                PRIMARY KEY (stream, position)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, events), fields(stream = %self.stream, event_count = events.len()), err)]
    async fn append(&self, events: Vec<DomainEvent>) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Serializes appenders of this stream until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.stream)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_stream", e))?;

        let head: i64 = sqlx::query(
            r#"
            SELECT COALESCE(MAX(position), 0) AS head
            FROM event_streams
            WHERE stream = $1
            "#,
        )
        .bind(&self.stream)
        .fetch_one(&mut *tx)
        .await
        .and_then(|row| row.try_get("head"))
        .map_err(|e| map_sqlx_error("stream_head", e))?;

        let mut stored_events = Vec::with_capacity(events.len());
        let mut next = head + 1;

        for event in events {
            let revision = i64::try_from(event.revision())
                .map_err(|_| EventStoreError::InvalidAppend(format!("revision {} out of range", event.revision())))?;

            let recorded_at: DateTime<Utc> = sqlx::query(
                r#"
                INSERT INTO event_streams (stream, position, name, aggregate_id, revision, payload)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING recorded_at
                "#,
            )
            .bind(&self.stream)
            .bind(next)
            .bind(&event.name)
            .bind(event.aggregate_id().as_str())
            .bind(revision)
            .bind(JsonValue::Object(event.payload.clone()))
            .fetch_one(&mut *tx)
            .await
            .and_then(|row| row.try_get("recorded_at"))
            .map_err(|e| map_sqlx_error("insert_event", e))?;

            stored_events.push(StoredEvent {
                position: next as u64,
                recorded_at,
                event,
            });
            next += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(stored_events)
    }

    #[instrument(skip(self), fields(stream = %self.stream), err)]
    async fn read_page(&self, skip: u64, limit: PageLimit) -> Result<StreamPage, EventStoreError> {
        let limit = limit.validate()?;
        let offset = i64::try_from(skip)
            .map_err(|_| EventStoreError::InvalidRead(format!("offset {skip} out of range")))?;

        // `LIMIT NULL` reads to the end of the stream.
        let rows = sqlx::query(
            r#"
            SELECT position, recorded_at, name, aggregate_id, revision, payload
            FROM event_streams
            WHERE stream = $1
            ORDER BY position ASC
            OFFSET $2
            LIMIT $3
            "#,
        )
        .bind(&self.stream)
        .bind(offset)
        .bind(fetch_size(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_page", e))?;

        let (events, exhausted) = trim_page(decode_rows(rows)?, limit);
        Ok(StreamPage {
            events,
            skip,
            limit,
            exhausted,
        })
    }

    #[instrument(skip(self), fields(stream = %self.stream), err)]
    async fn read_after(&self, position: u64, limit: u32) -> Result<Vec<StoredEvent>, EventStoreError> {
        let position = i64::try_from(position)
            .map_err(|_| EventStoreError::InvalidRead(format!("position {position} out of range")))?;

        let rows = sqlx::query(
            r#"
            SELECT position, recorded_at, name, aggregate_id, revision, payload
            FROM event_streams
            WHERE stream = $1 AND position > $2
            ORDER BY position ASC
            LIMIT $3
            "#,
        )
        .bind(&self.stream)
        .bind(position)
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_after", e))?;

        decode_rows(rows)
    }

    async fn ping(&self) -> Result<(), EventStoreError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}

/// Rows to request for a page: one extra for a bounded page, so a full page
/// can tell whether anything follows it.
fn fetch_size(limit: PageLimit) -> Option<i64> {
    match limit {
        PageLimit::Bounded(n) => Some(i64::from(n) + 1),
        PageLimit::Unbounded => None,
    }
}

fn trim_page(mut events: Vec<StoredEvent>, limit: PageLimit) -> (Vec<StoredEvent>, bool) {
    match limit {
        PageLimit::Bounded(n) if events.len() > n as usize => {
            events.truncate(n as usize);
            (events, false)
        }
        _ => (events, true),
    }
}

fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<StoredEvent>, EventStoreError> {
    rows.iter()
        .map(|row| {
            StoredEventRow::from_row(row)
                .map_err(|e| EventStoreError::InvalidRead(format!("failed to decode event row: {e}")))
                .and_then(StoredEvent::try_from)
        })
        .collect()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::InvalidAppend(format!("concurrent append detected: {msg}")),
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => EventStoreError::Unavailable(format!("connection pool closed in {operation}")),
        other => EventStoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

#[derive(Debug)]
struct StoredEventRow {
    position: i64,
    recorded_at: DateTime<Utc>,
    name: String,
    aggregate_id: String,
    revision: i64,
    payload: JsonValue,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            position: row.try_get("position")?,
            recorded_at: row.try_get("recorded_at")?,
            name: row.try_get("name")?,
            aggregate_id: row.try_get("aggregate_id")?,
            revision: row.try_get("revision")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl TryFrom<StoredEventRow> for StoredEvent {
    type Error = EventStoreError;

    fn try_from(row: StoredEventRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| EventStoreError::InvalidRead(format!("row at position {}: {reason}", row.position));

        let position = u64::try_from(row.position).map_err(|_| corrupt("negative position".to_string()))?;
        let revision = u64::try_from(row.revision).map_err(|_| corrupt(format!("negative revision {}", row.revision)))?;
        let aggregate_id = AggregateId::new(row.aggregate_id).map_err(|e| corrupt(e.to_string()))?;
        let event = DomainEvent::new(row.name, aggregate_id, revision, row.payload)
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(StoredEvent {
            position,
            recorded_at: row.recorded_at,
            event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(position: i64, aggregate_id: &str, revision: i64, payload: JsonValue) -> StoredEventRow {
        StoredEventRow {
            position,
            recorded_at: Utc::now(),
            name: "orderPlaced".to_string(),
            aggregate_id: aggregate_id.to_string(),
            revision,
            payload,
        }
    }

    fn stored(position: u64) -> StoredEvent {
        StoredEvent::try_from(row(position as i64, "order-1", 0, json!({}))).unwrap()
    }

    #[test]
    fn bounded_pages_fetch_one_extra_row() {
        assert_eq!(fetch_size(PageLimit::Bounded(4)), Some(5));
        assert_eq!(fetch_size(PageLimit::Unbounded), None);
    }

    #[test]
    fn extra_row_means_the_stream_continues() {
        let (events, exhausted) = trim_page((1..=5).map(stored).collect(), PageLimit::Bounded(4));
        assert!(!exhausted);
        assert_eq!(events.iter().map(|e| e.position).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        let (events, exhausted) = trim_page((1..=4).map(stored).collect(), PageLimit::Bounded(4));
        assert!(exhausted);
        assert_eq!(events.len(), 4);

        let (_, exhausted) = trim_page((1..=9).map(stored).collect(), PageLimit::Unbounded);
        assert!(exhausted);
    }

    #[test]
    fn full_page_with_more_rows_continues_paging() {
        let (events, exhausted) = trim_page((1..=3).map(stored).collect(), PageLimit::Bounded(2));
        let page = StreamPage {
            events,
            skip: 0,
            limit: PageLimit::Bounded(2),
            exhausted,
        };
        assert_eq!(page.next_skip(), Some(2));
    }

    #[test]
    fn rows_decode_into_positioned_events() {
        let event = StoredEvent::try_from(row(7, "acc-1", 3, json!({ "amount": 30 }))).unwrap();
        assert_eq!(event.position, 7);
        assert_eq!(event.event.aggregate_id().as_str(), "acc-1");
        assert_eq!(event.event.revision(), 3);
        assert_eq!(event.event.payload_i64("amount"), Some(30));
    }

    #[test]
    fn corrupt_rows_are_read_errors() {
        let negative = StoredEvent::try_from(row(-1, "acc-1", 0, json!({})));
        assert!(matches!(negative, Err(EventStoreError::InvalidRead(m)) if m.contains("negative position")));

        let array_payload = StoredEvent::try_from(row(2, "acc-1", 0, json!([1])));
        assert!(matches!(array_payload, Err(EventStoreError::InvalidRead(m)) if m.contains("position 2")));
    }

    #[test]
    fn closed_pool_is_unavailable() {
        let err = map_sqlx_error("read_after", sqlx::Error::PoolClosed);
        assert!(matches!(err, EventStoreError::Unavailable(m) if m.contains("read_after")));
    }
}
