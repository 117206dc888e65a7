//! Periodic resolution of timed-out sagas.
//!
//! Every period the scheduler asks the repository for sagas whose timeout
//! has elapsed. For each one it queues the saga's timeout commands, clears
//! the timeout (destroying the saga if it asks for that) and commits. Sagas
//! are handled independently: one failing commit does not affect the rest,
//! and a failed saga is simply picked up again on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use relay_events::{CommitOutcome, SagaError, SagaRepository, TimeoutSaga};

use crate::workers::{ShutdownSignal, WorkerHandle};

pub const DEFAULT_TIMEOUT_PERIOD: Duration = Duration::from_secs(90);

/// What to do when a tick starts while the previous one is still running.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TickOverlap {
    /// Drop the new tick.
    #[default]
    Skip,
    /// Run ticks concurrently.
    Allow,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub period: Duration,
    pub overlap: TickOverlap,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_TIMEOUT_PERIOD,
            overlap: TickOverlap::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_overlap(mut self, overlap: TickOverlap) -> Self {
        self.overlap = overlap;
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    Completed,
    /// Another tick was still running.
    Overlapped,
    /// The repository query failed; nothing was resolved.
    RepositoryFailed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub status: TickStatus,
    pub due: usize,
    pub updated: usize,
    pub removed: usize,
    pub failed: usize,
    pub commands_queued: usize,
}

impl TickReport {
    fn empty(status: TickStatus) -> Self {
        Self {
            status,
            due: 0,
            updated: 0,
            removed: 0,
            failed: 0,
            commands_queued: 0,
        }
    }
}

pub struct SagaTimeoutScheduler<R> {
    repository: R,
    config: SchedulerConfig,
    running: Mutex<()>,
}

impl<R> core::fmt::Debug for SagaTimeoutScheduler<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SagaTimeoutScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R> SagaTimeoutScheduler<R>
where
    R: SagaRepository,
{
    pub fn new(repository: R, config: SchedulerConfig) -> Self {
        Self {
            repository,
            config,
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Resolve every saga whose timeout is at or before `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let _running = match self.config.overlap {
            TickOverlap::Allow => None,
            TickOverlap::Skip => match self.running.try_lock() {
                Ok(guard) => Some(guard),
                Err(_) => {
                    debug!("previous saga timeout tick still running; skipping");
                    return TickReport::empty(TickStatus::Overlapped);
                }
            },
        };

        let sagas = match self.repository.timed_out_sagas(now).await {
            Ok(sagas) => sagas,
            Err(e) => {
                warn!(error = %e, "failed to load timed-out sagas; tick skipped");
                return TickReport::empty(TickStatus::RepositoryFailed);
            }
        };

        let mut report = TickReport::empty(TickStatus::Completed);
        report.due = sagas.len();

        for mut saga in sagas {
            let id = saga.id();
            match resolve(&mut saga).await {
                Ok((outcome, queued)) => {
                    report.commands_queued += queued;
                    match outcome {
                        CommitOutcome::Updated => report.updated += 1,
                        CommitOutcome::Removed => report.removed += 1,
                    }
                    debug!(saga = %id, queued, ?outcome, "saga timeout resolved");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(saga = %id, error = %e, "saga timeout commit failed; will retry next tick");
                }
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                updated = report.updated,
                removed = report.removed,
                failed = report.failed,
                "saga timeout tick finished"
            );
        }
        report
    }
}

async fn resolve<S>(saga: &mut S) -> Result<(CommitOutcome, usize), SagaError>
where
    S: TimeoutSaga,
{
    let commands = saga.timeout_commands().unwrap_or_default();
    let queued = commands.len();
    for command in commands {
        saga.add_command_to_send(command);
    }

    saga.remove_timeout();
    if saga.remove_after_timeout() {
        saga.destroy();
    }

    let outcome = saga.commit().await?;
    Ok((outcome, queued))
}

impl<R> SagaTimeoutScheduler<R>
where
    R: SagaRepository + 'static,
{
    /// Tick every `period` until shutdown. The first tick fires one period
    /// after start. Ticks run on their own tasks so a slow tick does not
    /// delay the schedule; overlap is governed by [`TickOverlap`]. Shutdown
    /// stops new ticks and waits for the ones in flight.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let period = self.config.period;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks: JoinSet<TickReport> = JoinSet::new();

        info!(period_secs = period.as_secs_f64(), "saga timeout scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    let scheduler = self.clone();
                    ticks.spawn(async move { scheduler.tick(Utc::now()).await });
                }
                Some(joined) = ticks.join_next(), if !ticks.is_empty() => reap(joined),
            }
        }

        if !ticks.is_empty() {
            info!(in_flight = ticks.len(), "waiting for saga timeout ticks");
        }
        while let Some(joined) = ticks.join_next().await {
            reap(joined);
        }
        info!("saga timeout scheduler stopped");
    }

    pub fn spawn(self) -> WorkerHandle<()> {
        let scheduler = Arc::new(self);
        WorkerHandle::spawn("saga-timeout-scheduler", move |shutdown| scheduler.run(shutdown))
    }
}

fn reap(joined: Result<TickReport, JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "saga timeout tick panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::{InMemorySagaRepository, SagaRecord};
    use async_trait::async_trait;
    use relay_core::SagaId;
    use relay_events::{InMemoryMessageBus, MessageBus, SagaCommand};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Saga whose commit outcome is scripted; records what it was asked to do.
    struct ScriptedSaga {
        id: SagaId,
        commands: Option<Vec<SagaCommand>>,
        fail_commit: bool,
        queued: Vec<SagaCommand>,
        log: Arc<StdMutex<Vec<(SagaId, usize)>>>,
    }

    #[async_trait]
    impl TimeoutSaga for ScriptedSaga {
        fn id(&self) -> SagaId {
            self.id
        }
        fn timeout_at(&self) -> Option<DateTime<Utc>> {
            Some(Utc::now())
        }
        fn timeout_commands(&self) -> Option<Vec<SagaCommand>> {
            self.commands.clone()
        }
        fn add_command_to_send(&mut self, command: SagaCommand) {
            self.queued.push(command);
        }
        fn remove_timeout(&mut self) {}
        fn destroy(&mut self) {}
        async fn commit(&mut self) -> Result<CommitOutcome, SagaError> {
            if self.fail_commit {
                return Err(SagaError::Storage("write timeout".to_string()));
            }
            self.log.lock().unwrap().push((self.id, self.queued.len()));
            Ok(CommitOutcome::Updated)
        }
    }

    struct ScriptedRepository {
        failing: Vec<bool>,
        log: Arc<StdMutex<Vec<(SagaId, usize)>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
        unavailable: bool,
    }

    impl ScriptedRepository {
        fn new(failing: Vec<bool>) -> Self {
            Self {
                failing,
                log: Arc::default(),
                calls: AtomicUsize::new(0),
                delay: None,
                unavailable: false,
            }
        }
    }

    #[async_trait]
    impl SagaRepository for ScriptedRepository {
        type Saga = ScriptedSaga;

        async fn timed_out_sagas(&self, _now: DateTime<Utc>) -> Result<Vec<ScriptedSaga>, SagaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.unavailable {
                return Err(SagaError::Storage("connection refused".to_string()));
            }
            Ok(self
                .failing
                .iter()
                .map(|fail| ScriptedSaga {
                    id: SagaId::new(),
                    commands: Some(vec![SagaCommand::new(json!({ "name": "expire" }))]),
                    fail_commit: *fail,
                    queued: vec![],
                    log: self.log.clone(),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn one_failing_saga_does_not_stop_the_others() {
        let repo = ScriptedRepository::new(vec![false, true, false]);
        let log = repo.log.clone();
        let scheduler = SagaTimeoutScheduler::new(repo, SchedulerConfig::default());

        let report = scheduler.tick(Utc::now()).await;

        assert_eq!(report.status, TickStatus::Completed);
        assert_eq!((report.due, report.updated, report.failed), (3, 2, 1));
        assert_eq!(report.commands_queued, 2);
        let committed = log.lock().unwrap();
        assert_eq!(committed.len(), 2);
        assert!(committed.iter().all(|(_, queued)| *queued == 1));
    }

    #[tokio::test]
    async fn repository_failure_skips_the_tick() {
        let mut repo = ScriptedRepository::new(vec![false]);
        repo.unavailable = true;
        let scheduler = SagaTimeoutScheduler::new(repo, SchedulerConfig::default());

        let report = scheduler.tick(Utc::now()).await;
        assert_eq!(report, TickReport::empty(TickStatus::RepositoryFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_ticks_are_skipped_by_default() {
        let mut repo = ScriptedRepository::new(vec![false]);
        repo.delay = Some(Duration::from_secs(120));
        let scheduler = SagaTimeoutScheduler::new(repo, SchedulerConfig::default());

        let (first, second) = tokio::join!(scheduler.tick(Utc::now()), scheduler.tick(Utc::now()));
        assert_eq!(first.status, TickStatus::Completed);
        assert_eq!(second.status, TickStatus::Overlapped);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_ticks_can_be_allowed() {
        let mut repo = ScriptedRepository::new(vec![false]);
        repo.delay = Some(Duration::from_secs(120));
        let scheduler = SagaTimeoutScheduler::new(
            repo,
            SchedulerConfig::default().with_overlap(TickOverlap::Allow),
        );

        let (first, second) = tokio::join!(scheduler.tick(Utc::now()), scheduler.tick(Utc::now()));
        assert_eq!(first.status, TickStatus::Completed);
        assert_eq!(second.status, TickStatus::Completed);
    }

    #[tokio::test]
    async fn resolves_in_memory_sagas_and_sends_their_commands() {
        let bus = Arc::new(InMemoryMessageBus::new("example-app.routemanagement"));
        let mut commands = bus.subscribe();
        let repo = InMemorySagaRepository::new(bus.clone() as Arc<dyn MessageBus>);
        let past = Utc::now() - chrono::Duration::minutes(5);

        let keep = repo
            .insert(SagaRecord::new("delivery", json!({})).with_timeout(
                past,
                Some(vec![SagaCommand::new(json!({ "name": "escalate" }))]),
            ))
            .unwrap();
        let drop_me = repo
            .insert(SagaRecord::new("delivery", json!({})).with_timeout(past, None).removed_after_timeout())
            .unwrap();

        let scheduler = SagaTimeoutScheduler::new(repo.clone(), SchedulerConfig::default());
        let report = scheduler.tick(Utc::now()).await;

        assert_eq!((report.due, report.updated, report.removed), (2, 1, 1));
        assert_eq!(commands.try_recv().unwrap().payload["name"], "escalate");
        assert!(commands.try_recv().is_err());

        let kept = repo.get(keep).unwrap();
        assert_eq!(kept.timeout_at, None);
        assert_eq!(kept.version, 1);
        assert!(repo.get(drop_me).is_none());

        // Nothing is due any more.
        assert_eq!(scheduler.tick(Utc::now()).await.due, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_once_per_period() {
        let repo = ScriptedRepository::new(vec![]);
        let scheduler = SagaTimeoutScheduler::new(repo, SchedulerConfig::default());
        let scheduler = Arc::new(scheduler);
        let (shutdown, signal) = ShutdownSignal::new();
        let task = tokio::spawn(scheduler.clone().run(signal));

        tokio::time::sleep(Duration::from_secs(89)).await;
        assert_eq!(scheduler.repository.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(scheduler.repository.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(DEFAULT_TIMEOUT_PERIOD).await;
        assert_eq!(scheduler.repository.calls.load(Ordering::SeqCst), 2);

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_the_tick_in_flight() {
        let mut repo = ScriptedRepository::new(vec![false]);
        repo.delay = Some(Duration::from_secs(120));
        let log = repo.log.clone();
        let scheduler = Arc::new(SagaTimeoutScheduler::new(repo, SchedulerConfig::default()));
        let (shutdown, signal) = ShutdownSignal::new();
        let started = Instant::now();
        let task = tokio::spawn(scheduler.clone().run(signal));

        // The first tick starts at 90s and is still loading sagas at 100s.
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(scheduler.repository.calls.load(Ordering::SeqCst), 1);
        assert!(log.lock().unwrap().is_empty());

        shutdown.send(true).unwrap();
        task.await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(210));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(scheduler.repository.calls.load(Ordering::SeqCst), 1);
    }
}
