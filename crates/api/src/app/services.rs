//! Infrastructure wiring: buses, stores, projection, bridge, saga scheduler
//! and dispatcher.
//!
//! Stores default to in-memory. `DATABASE_URL` switches the accounts read
//! model, the event journal, the source feed and checkpoints to Postgres;
//! `REDIS_URL` (with the `redis` feature) takes precedence for checkpoints.
//! Checkpoints are only kept durably when the feed they index is durable too.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use relay_core::FailurePolicy;
use relay_events::{
    BusError, DomainEvent, HandlerError, InMemoryMessageBus, Message, MessageHandler, MessageKind,
    RoutingMessageBus,
};
use relay_infra::{
    bridge::{BridgeConfig, BridgeError, CrossContextBridge},
    checkpoint::{CheckpointError, CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore},
    dispatcher::MessageDispatcher,
    event_store::{EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore},
    projections::{AccountsProjection, ProjectionHandler},
    read_model::{AccountStore, InMemoryAccountStore, PostgresAccountStore, ReadModelError},
    saga::{InMemorySagaRepository, SagaTimeoutScheduler, SchedulerConfig},
    workers::WorkerHandle,
};

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    ReadModel(#[from] ReadModelError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("handler registration failed: {0}")]
    Bus(#[from] BusError),
}

/// Everything the HTTP handlers need.
pub struct AppServices {
    pub config: AppConfig,
    /// Bus of the local context.
    pub local_bus: Arc<InMemoryMessageBus>,
    /// Bus of the source context the bridge forwards into.
    pub source_bus: Arc<InMemoryMessageBus>,
    pub router: Arc<RoutingMessageBus>,
    pub dispatcher: MessageDispatcher,
    /// Journal of local events; the replay source.
    pub event_store: Arc<dyn EventStore>,
    /// The source context's feed tailed by the bridge.
    pub source_feed: Arc<dyn EventStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub accounts_projection: Arc<AccountsProjection<Arc<dyn AccountStore>>>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub sagas: InMemorySagaRepository,
}

impl core::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppServices")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Background workers owned by the running application.
#[derive(Debug)]
pub struct Workers {
    bridge: WorkerHandle<Result<(), BridgeError>>,
    scheduler: WorkerHandle<()>,
}

impl Workers {
    pub fn bridge_finished(&self) -> bool {
        self.bridge.is_finished()
    }

    /// Stop the bridge and the scheduler and wait for both.
    pub async fn shutdown(self) {
        match self.bridge.shutdown().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "bridge stopped with error"),
            Err(e) => warn!(error = %e, "bridge task panicked"),
        }
        if let Err(e) = self.scheduler.shutdown().await {
            warn!(error = %e, "saga scheduler task panicked");
        }
        info!("workers stopped");
    }
}

/// Appends every local domain event to the journal so it can be replayed.
struct EventJournal {
    store: Arc<dyn EventStore>,
}

#[async_trait]
impl MessageHandler for EventJournal {
    async fn handle(&self, message: &Message) -> Result<Option<JsonValue>, HandlerError> {
        let Ok(event) = serde_json::from_value::<DomainEvent>(message.payload.clone()) else {
            return Ok(None);
        };
        let stored = self
            .store
            .append(vec![event])
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        if let Some(last) = stored.last() {
            debug!(position = last.position, "event journaled");
        }
        Ok(None)
    }
}

struct Stores {
    accounts: Arc<dyn AccountStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    journal: Arc<dyn EventStore>,
    feed: Arc<dyn EventStore>,
}

async fn build_stores(config: &AppConfig) -> Result<Stores, StartupError> {
    let Some(url) = &config.database_url else {
        // Checkpoints are only durable together with the feed they index.
        if config.redis_url.is_some() {
            warn!("REDIS_URL is ignored without DATABASE_URL; the source feed is in-memory");
        }
        return Ok(Stores {
            accounts: Arc::new(InMemoryAccountStore::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            journal: Arc::new(InMemoryEventStore::new()),
            feed: Arc::new(InMemoryEventStore::new()),
        });
    };

    let pool = sqlx::PgPool::connect(url).await?;
    let accounts = PostgresAccountStore::new(pool.clone());
    accounts.ensure_schema().await?;
    let journal = PostgresEventStore::new(pool.clone(), config.context_name.clone());
    journal.ensure_schema().await?;
    let feed = PostgresEventStore::new(pool.clone(), config.source_context.clone());
    let checkpoints: Arc<dyn CheckpointStore> = match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(redis_url) => {
            info!("using redis checkpoints");
            Arc::new(relay_infra::checkpoint::RedisCheckpointStore::connect(redis_url).await?)
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("REDIS_URL is set but the redis feature is disabled; ignoring");
            postgres_checkpoints(pool).await?
        }
        None => postgres_checkpoints(pool).await?,
    };
    info!(
        journal = journal.stream(),
        feed = feed.stream(),
        "using postgres read model, event streams and checkpoints"
    );

    Ok(Stores {
        accounts: Arc::new(accounts),
        checkpoints,
        journal: Arc::new(journal),
        feed: Arc::new(feed),
    })
}

async fn postgres_checkpoints(pool: sqlx::PgPool) -> Result<Arc<dyn CheckpointStore>, StartupError> {
    let checkpoints = PostgresCheckpointStore::new(pool);
    checkpoints.ensure_schema().await?;
    Ok(Arc::new(checkpoints))
}

/// Wire services and start the bridge and the saga scheduler.
///
/// A bridge that cannot reach its stores is reported to `failure` before the
/// error is returned.
pub async fn build_services(
    config: AppConfig,
    failure: Arc<dyn FailurePolicy>,
) -> Result<(Arc<AppServices>, Workers), StartupError> {
    let Stores {
        accounts,
        checkpoints,
        journal: event_store,
        feed: source_feed,
    } = build_stores(&config).await?;

    let local_bus = Arc::new(InMemoryMessageBus::new(format!(
        "{}.{}",
        config.app_name, config.context_name
    )));
    let source_bus = Arc::new(InMemoryMessageBus::new(format!(
        "{}.{}",
        config.app_name, config.source_context
    )));
    let router = Arc::new(
        RoutingMessageBus::new(config.context_name.clone(), local_bus.clone())
            .with_route(config.source_context.clone(), source_bus.clone()),
    );

    let accounts_projection = Arc::new(AccountsProjection::new(accounts.clone()));
    local_bus.register(
        "accounts-projection",
        MessageKind::Event,
        Arc::new(ProjectionHandler::new(accounts_projection.clone())),
    )?;
    local_bus.register(
        "event-journal",
        MessageKind::Event,
        Arc::new(EventJournal {
            store: event_store.clone(),
        }),
    )?;

    let dispatcher = MessageDispatcher::new(router.clone()).with_debounce(config.dispatch_debounce);
    let sagas = InMemorySagaRepository::new(router.clone());

    let bridge_config = BridgeConfig::new(config.feed_key())
        .with_batch_size(config.bridge_batch_size)
        .with_poll_interval(config.bridge_poll_interval);
    let bridge = CrossContextBridge::connect(
        source_feed.clone(),
        checkpoints.clone(),
        router.clone(),
        bridge_config,
        failure,
    )
    .await?;

    let scheduler = SagaTimeoutScheduler::new(
        sagas.clone(),
        SchedulerConfig::default().with_period(config.saga_timeout_period),
    );

    let workers = Workers {
        bridge: bridge.spawn(),
        scheduler: scheduler.spawn(),
    };

    info!(
        app = %config.app_name,
        context = %config.context_name,
        source = %config.source_context,
        "services ready"
    );

    let services = AppServices {
        config,
        local_bus,
        source_bus,
        router,
        dispatcher,
        event_store,
        source_feed,
        accounts,
        accounts_projection,
        checkpoints,
        sagas,
    };

    Ok((Arc::new(services), workers))
}
