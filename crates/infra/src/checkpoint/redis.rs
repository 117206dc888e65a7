//! Redis-backed checkpoint store (optional `redis` feature).
//!
//! Checkpoints are plain string values under the feed key. The max-merge on
//! write runs as a Lua script so concurrent writers cannot move it backwards.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::instrument;

use super::{CheckpointError, CheckpointStore, FeedKey};

const SET_MAX_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local next = tonumber(ARGV[1])
if next > current or redis.call('EXISTS', KEYS[1]) == 0 then
    redis.call('SET', KEYS[1], ARGV[1])
end
return 1
"#;

#[derive(Clone)]
pub struct RedisCheckpointStore {
    conn: MultiplexedConnection,
    set_max: redis::Script,
}

impl core::fmt::Debug for RedisCheckpointStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisCheckpointStore").finish_non_exhaustive()
    }
}

fn map_redis(e: redis::RedisError) -> CheckpointError {
    CheckpointError::Unavailable(e.to_string())
}

impl RedisCheckpointStore {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, CheckpointError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(map_redis)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(map_redis)?;
        Ok(Self {
            conn,
            set_max: redis::Script::new(SET_MAX_SCRIPT),
        })
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    #[instrument(skip(self, key), fields(feed = %key))]
    async fn get(&self, key: &FeedKey) -> Result<Option<u64>, CheckpointError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key.to_string()).await.map_err(map_redis)?;

        raw.map(|value| {
            value.trim().parse::<u64>().map_err(|e| CheckpointError::Corrupt {
                key: key.to_string(),
                reason: format!("'{value}': {e}"),
            })
        })
        .transpose()
    }

    #[instrument(skip(self, key), fields(feed = %key))]
    async fn set(&self, key: &FeedKey, index: u64) -> Result<(), CheckpointError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .set_max
            .key(key.to_string())
            .arg(index)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CheckpointError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis)?;
        Ok(())
    }
}
