//! Cross-context bridge: tails an external context's event stream and
//! republishes it on the local bus.
//!
//! Delivery is at-least-once and batch-granular:
//!
//! 1. read up to `batch_size` events after the checkpoint
//! 2. publish each as an event message in the source context
//! 3. only when the whole batch is out, persist the highest index
//!
//! A batch that fails to publish is reported and retried on the next poll,
//! so a crash or error between steps 2 and 3 re-delivers that batch.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use relay_core::FailurePolicy;
use relay_events::{BusError, Message, MessageBus};

use crate::checkpoint::{CheckpointError, CheckpointStore, FeedKey};
use crate::event_store::{EventStore, EventStoreError};
use crate::workers::{ShutdownSignal, WorkerHandle};

pub const DEFAULT_BATCH_SIZE: u32 = 4;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

const COMPONENT: &str = "cross-context-bridge";

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("external feed error: {0}")]
    Feed(#[from] EventStoreError),

    #[error("checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("failed to publish event at index {position}: {source}")]
    Publish {
        position: u64,
        #[source]
        source: BusError,
    },
}

/// The batch a publish error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInfo {
    pub first_index: u64,
    pub last_index: u64,
    pub len: usize,
}

pub type CheckpointHook = Arc<dyn Fn(u64) + Send + Sync>;
pub type PublishErrorHook = Arc<dyn Fn(&BridgeError, &BatchInfo) + Send + Sync>;

#[derive(Clone)]
pub struct BridgeConfig {
    pub feed_key: FeedKey,
    pub batch_size: u32,
    pub poll_interval: Duration,
    /// Called after a checkpoint has been persisted.
    pub on_checkpoint: Option<CheckpointHook>,
    /// Called when a batch could not be published.
    pub on_error: Option<PublishErrorHook>,
}

impl core::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("feed_key", &self.feed_key)
            .field("batch_size", &self.batch_size)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl BridgeConfig {
    pub fn new(feed_key: FeedKey) -> Self {
        Self {
            feed_key,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            on_checkpoint: None,
            on_error: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn on_checkpoint(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_checkpoint = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&BridgeError, &BatchInfo) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn source_context(&self) -> &str {
        &self.feed_key.source_context
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing new past the checkpoint.
    Idle,
    /// A whole batch went out and the checkpoint moved to `checkpoint`.
    Forwarded { count: usize, checkpoint: u64 },
    /// A publish failed; the checkpoint did not move.
    PublishFailed,
}

pub struct CrossContextBridge<F, C, B> {
    feed: F,
    checkpoints: C,
    bus: B,
    config: BridgeConfig,
    failure: Arc<dyn FailurePolicy>,
    last_index: u64,
}

impl<F, C, B> CrossContextBridge<F, C, B>
where
    F: EventStore,
    C: CheckpointStore,
    B: MessageBus,
{
    /// Probe connectivity once, then load the feed's checkpoint (absent = 0).
    ///
    /// Any failure here is fatal and reported to `failure`.
    pub async fn connect(
        feed: F,
        checkpoints: C,
        bus: B,
        config: BridgeConfig,
        failure: Arc<dyn FailurePolicy>,
    ) -> Result<Self, BridgeError> {
        let startup = async {
            checkpoints.ping().await?;
            feed.ping().await?;
            let last_index = checkpoints.get(&config.feed_key).await?.unwrap_or(0);
            Ok::<u64, BridgeError>(last_index)
        };

        let last_index = match startup.await {
            Ok(last_index) => last_index,
            Err(e) => {
                failure.on_fatal(COMPONENT, &e);
                return Err(e);
            }
        };

        info!(feed = %config.feed_key, last_index, "bridge connected");

        Ok(Self {
            feed,
            checkpoints,
            bus,
            config,
            failure,
            last_index,
        })
    }

    /// Highest index forwarded and checkpointed so far.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// Forward at most one batch.
    ///
    /// Feed and checkpoint errors are returned; publish errors are reported to
    /// the error hook and yield [`PollOutcome::PublishFailed`].
    pub async fn poll_once(&mut self) -> Result<PollOutcome, BridgeError> {
        let batch = self
            .feed
            .read_after(self.last_index, self.config.batch_size)
            .await?;

        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Ok(PollOutcome::Idle);
        };
        let info = BatchInfo {
            first_index: first.position,
            last_index: last.position,
            len: batch.len(),
        };

        for stored in &batch {
            if let Err(e) = self.publish(stored).await {
                warn!(
                    feed = %self.config.feed_key,
                    first_index = info.first_index,
                    last_index = info.last_index,
                    error = %e,
                    "batch publish failed; will retry"
                );
                if let Some(hook) = &self.config.on_error {
                    hook(&e, &info);
                }
                return Ok(PollOutcome::PublishFailed);
            }
        }

        let checkpoint = info.last_index.max(self.last_index);
        self.checkpoints.set(&self.config.feed_key, checkpoint).await?;
        self.last_index = checkpoint;
        if let Some(hook) = &self.config.on_checkpoint {
            hook(checkpoint);
        }

        debug!(feed = %self.config.feed_key, count = info.len, checkpoint, "batch forwarded");
        Ok(PollOutcome::Forwarded {
            count: info.len,
            checkpoint,
        })
    }

    async fn publish(&self, stored: &crate::event_store::StoredEvent) -> Result<(), BridgeError> {
        let position = stored.position;
        let payload = serde_json::to_value(&stored.event).map_err(|e| BridgeError::Publish {
            position,
            source: BusError::Transport(format!("encode failed: {e}")),
        })?;
        let message = Message::event(payload).with_context(self.config.source_context());

        self.bus
            .publish(message, None)
            .await
            .map_err(|source| BridgeError::Publish { position, source })
    }

    /// Poll until shutdown. Returns an error only for fatal conditions, which
    /// are also reported to the failure policy.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Result<(), BridgeError> {
        loop {
            if shutdown.is_shutdown() {
                break;
            }

            let outcome = match self.poll_once().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.failure.on_fatal(COMPONENT, &e);
                    return Err(e);
                }
            };

            if matches!(outcome, PollOutcome::Forwarded { .. }) {
                continue;
            }

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(feed = %self.config.feed_key, last_index = self.last_index, "bridge stopped");
        Ok(())
    }
}

impl<F, C, B> CrossContextBridge<F, C, B>
where
    F: EventStore + 'static,
    C: CheckpointStore + 'static,
    B: MessageBus + 'static,
{
    pub fn spawn(self) -> WorkerHandle<Result<(), BridgeError>> {
        WorkerHandle::spawn("cross-context-bridge", move |shutdown| self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::event_store::InMemoryEventStore;
    use async_trait::async_trait;
    use relay_core::{AggregateId, RecordingFailurePolicy};
    use relay_events::{DomainEvent, InMemoryMessageBus, ReplySink, Subscription};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn key() -> FeedKey {
        FeedKey::new("example-app", "routemanagement", "sale")
    }

    fn sale_event(i: u64) -> DomainEvent {
        DomainEvent::new(
            "orderPlaced",
            AggregateId::new(format!("order-{i}")).unwrap(),
            0,
            serde_json::json!({ "n": i }),
        )
        .unwrap()
    }

    async fn feed_with(n: u64) -> Arc<InMemoryEventStore> {
        let feed = Arc::new(InMemoryEventStore::new());
        feed.append((1..=n).map(sale_event).collect()).await.unwrap();
        feed
    }

    fn drain(sub: &mut Subscription<Message>) -> Vec<u64> {
        let mut seen = vec![];
        while let Ok(msg) = sub.try_recv() {
            assert_eq!(msg.context.as_deref(), Some("sale"));
            seen.push(msg.payload["payload"]["n"].as_u64().unwrap());
        }
        seen
    }

    /// Fails the publish of one index a fixed number of times.
    struct FlakyBus {
        inner: InMemoryMessageBus,
        fail_index: u64,
        failures_left: AtomicU64,
    }

    #[async_trait]
    impl MessageBus for FlakyBus {
        async fn publish(&self, message: Message, replies: Option<ReplySink>) -> Result<(), BusError> {
            if message.payload["payload"]["n"].as_u64() == Some(self.fail_index)
                && self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(BusError::Transport("broker hiccup".to_string()));
            }
            self.inner.publish(message, replies).await
        }

        fn subscribe(&self) -> Subscription<Message> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn checkpoint_tracks_the_last_index_of_each_batch() {
        let feed = feed_with(10).await;
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let bus = Arc::new(InMemoryMessageBus::new("example-app.sale"));
        let mut sub = bus.subscribe();
        let observed = Arc::new(Mutex::new(Vec::new()));

        let seen = observed.clone();
        let config = BridgeConfig::new(key())
            .with_batch_size(4)
            .on_checkpoint(move |index| seen.lock().unwrap().push(index));
        let mut bridge = CrossContextBridge::connect(
            feed,
            checkpoints.clone(),
            bus,
            config,
            Arc::new(RecordingFailurePolicy::new()),
        )
        .await
        .unwrap();

        while bridge.poll_once().await.unwrap() != PollOutcome::Idle {}

        assert_eq!(*observed.lock().unwrap(), vec![4, 8, 10]);
        assert_eq!(checkpoints.get(&key()).await.unwrap(), Some(10));
        assert_eq!(drain(&mut sub), (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failed_batch_is_redelivered_after_restart() {
        let feed = feed_with(8).await;
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let bus = Arc::new(FlakyBus {
            inner: InMemoryMessageBus::new("example-app.sale"),
            fail_index: 6,
            failures_left: AtomicU64::new(1),
        });
        let mut sub = bus.subscribe();
        let errors = Arc::new(Mutex::new(Vec::new()));

        let recorded = errors.clone();
        let config = BridgeConfig::new(key())
            .with_batch_size(4)
            .on_error(move |_, info| recorded.lock().unwrap().push(*info));
        let failure = Arc::new(RecordingFailurePolicy::new());

        let mut first = CrossContextBridge::connect(
            feed.clone(),
            checkpoints.clone(),
            bus.clone(),
            config.clone(),
            failure.clone(),
        )
        .await
        .unwrap();
        assert!(matches!(first.poll_once().await.unwrap(), PollOutcome::Forwarded { checkpoint: 4, .. }));
        assert_eq!(first.poll_once().await.unwrap(), PollOutcome::PublishFailed);
        drop(first);

        assert_eq!(checkpoints.get(&key()).await.unwrap(), Some(4));
        assert_eq!(
            *errors.lock().unwrap(),
            vec![BatchInfo { first_index: 5, last_index: 8, len: 4 }]
        );

        // A fresh process resumes from the persisted checkpoint.
        let mut second = CrossContextBridge::connect(feed, checkpoints.clone(), bus, config, failure.clone())
            .await
            .unwrap();
        assert_eq!(second.last_index(), 4);
        assert!(matches!(second.poll_once().await.unwrap(), PollOutcome::Forwarded { checkpoint: 8, .. }));

        assert_eq!(drain(&mut sub), vec![1, 2, 3, 4, 5, 5, 6, 7, 8]);
        assert!(failure.failures().is_empty());
    }

    #[tokio::test]
    async fn unreachable_checkpoint_store_is_fatal_at_startup() {
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        checkpoints.set_available(false);
        let failure = Arc::new(RecordingFailurePolicy::new());

        let result = CrossContextBridge::connect(
            feed_with(1).await,
            checkpoints,
            Arc::new(InMemoryMessageBus::new("example-app.sale")),
            BridgeConfig::new(key()),
            failure.clone(),
        )
        .await;

        assert!(matches!(result, Err(BridgeError::Checkpoint(_))));
        assert_eq!(failure.failures().len(), 1);
        assert_eq!(failure.failures()[0].0, COMPONENT);
    }

    #[tokio::test(start_paused = true)]
    async fn run_tails_the_feed_until_shutdown() {
        let feed = feed_with(3).await;
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let bridge = CrossContextBridge::connect(
            feed.clone(),
            checkpoints.clone(),
            Arc::new(InMemoryMessageBus::new("example-app.sale")),
            BridgeConfig::new(key()),
            Arc::new(RecordingFailurePolicy::new()),
        )
        .await
        .unwrap();

        let worker = bridge.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(checkpoints.get(&key()).await.unwrap(), Some(3));

        feed.append(vec![sale_event(4), sale_event(5)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Still sleeping out the poll interval.
        assert_eq!(checkpoints.get(&key()).await.unwrap(), Some(3));

        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        assert_eq!(checkpoints.get(&key()).await.unwrap(), Some(5));

        worker.shutdown().await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoint_outage_while_running_is_fatal() {
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let failure = Arc::new(RecordingFailurePolicy::new());
        let bridge = CrossContextBridge::connect(
            feed_with(2).await,
            checkpoints.clone(),
            Arc::new(InMemoryMessageBus::new("example-app.sale")),
            BridgeConfig::new(key()),
            failure.clone(),
        )
        .await
        .unwrap();

        checkpoints.set_available(false);
        let worker = bridge.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(worker.is_finished());

        let result = worker.shutdown().await.unwrap();

        assert!(matches!(result, Err(BridgeError::Checkpoint(_))));
        assert_eq!(failure.failures().len(), 1);
    }
}
