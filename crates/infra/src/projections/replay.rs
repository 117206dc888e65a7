//! Paginated stream replay into a projection.
//!
//! A replay pulls one page at a time starting at `skip`, applies every event
//! in page order and continues while pages come back full. It can run inline
//! (`run`) or as a background job (`spawn`) observed through a
//! [`ReplayHandle`].

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use relay_events::{Projection, ProjectionError};

use crate::event_store::{EventStore, EventStoreError, PageLimit};

#[derive(Debug, Clone, Error)]
pub enum ReplayError {
    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("projection failed at position {position}: {source}")]
    Projection {
        position: u64,
        #[source]
        source: ProjectionError,
    },

    #[error("replay cancelled")]
    Cancelled,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReplayConfig {
    /// Offset of the first event to replay (0-based).
    pub skip: u64,
    pub limit: PageLimit,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: PageLimit::default(),
        }
    }
}

impl ReplayConfig {
    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_limit(mut self, limit: PageLimit) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub processed: u64,
    /// Number of page fetches issued.
    pub pages: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    Replaying,
    Complete,
    Failed,
    Cancelled,
}

/// Snapshot of a background replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayProgress {
    pub projection: String,
    pub processed_events: u64,
    pub pages: u64,
    pub phase: ReplayPhase,
    pub error: Option<String>,
}

impl ReplayProgress {
    pub fn is_finished(&self) -> bool {
        self.phase != ReplayPhase::Replaying
    }
}

/// Handle for observing and cancelling a background replay.
#[derive(Debug, Clone)]
pub struct ReplayHandle {
    progress: watch::Receiver<ReplayProgress>,
    cancellation: Arc<AtomicBool>,
}

impl ReplayHandle {
    pub fn progress(&self) -> ReplayProgress {
        self.progress.borrow().clone()
    }

    /// Ask the replay to stop before its next event.
    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::Relaxed)
    }

    /// Wait until the replay has finished, whatever the outcome.
    pub async fn wait(&self) -> ReplayProgress {
        let mut rx = self.progress.clone();
        if let Ok(progress) = rx.wait_for(ReplayProgress::is_finished).await {
            return progress.clone();
        }
        // The job task is gone; the last value is all we will get.
        rx.borrow().clone()
    }
}

/// Replays an event stream into a projection, page by page.
#[derive(Debug, Clone)]
pub struct StreamReplayer<S> {
    store: S,
    config: ReplayConfig,
}

impl<S> StreamReplayer<S>
where
    S: EventStore,
{
    pub fn new(store: S, config: ReplayConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> ReplayConfig {
        self.config
    }

    /// Replay until the stream is exhausted. Projections already applied are
    /// kept if a later event fails.
    pub async fn run<P>(&self, projection: &P) -> Result<ReplayReport, ReplayError>
    where
        P: Projection + ?Sized,
    {
        self.replay(projection, None, |_| {}).await
    }

    async fn replay<P, F>(
        &self,
        projection: &P,
        cancellation: Option<&AtomicBool>,
        mut on_page: F,
    ) -> Result<ReplayReport, ReplayError>
    where
        P: Projection + ?Sized,
        F: FnMut(ReplayReport),
    {
        let mut report = ReplayReport { processed: 0, pages: 0 };
        let result = self
            .replay_pages(projection, cancellation, &mut report, &mut on_page)
            .await;

        match &result {
            Ok(()) => info!(
                projection = projection.name(),
                processed = report.processed,
                pages = report.pages,
                "replay finished"
            ),
            Err(e) => warn!(
                projection = projection.name(),
                processed = report.processed,
                pages = report.pages,
                error = %e,
                "replay aborted"
            ),
        }

        result.map(|()| report)
    }

    async fn replay_pages<P, F>(
        &self,
        projection: &P,
        cancellation: Option<&AtomicBool>,
        report: &mut ReplayReport,
        on_page: &mut F,
    ) -> Result<(), ReplayError>
    where
        P: Projection + ?Sized,
        F: FnMut(ReplayReport),
    {
        let cancelled = || cancellation.is_some_and(|c| c.load(Ordering::Relaxed));
        let mut skip = self.config.skip;

        loop {
            let page = self.store.read_page(skip, self.config.limit).await?;
            report.pages += 1;

            for stored in &page.events {
                if cancelled() {
                    return Err(ReplayError::Cancelled);
                }
                projection
                    .apply(&stored.event)
                    .await
                    .map_err(|source| ReplayError::Projection {
                        position: stored.position,
                        source,
                    })?;
                report.processed += 1;
            }
            on_page(*report);

            match page.next_skip() {
                Some(next) => skip = next,
                None => return Ok(()),
            }
        }
    }
}

impl<S> StreamReplayer<S>
where
    S: EventStore + 'static,
{
    /// Run the replay on a background task.
    pub fn spawn(self, projection: Arc<dyn Projection>) -> ReplayHandle {
        let (tx, rx) = watch::channel(ReplayProgress {
            projection: projection.name().to_string(),
            processed_events: 0,
            pages: 0,
            phase: ReplayPhase::Replaying,
            error: None,
        });
        let cancellation = Arc::new(AtomicBool::new(false));
        let handle = ReplayHandle {
            progress: rx,
            cancellation: cancellation.clone(),
        };

        tokio::spawn(async move {
            let result = self
                .replay(projection.as_ref(), Some(&cancellation), |report| {
                    tx.send_modify(|p| {
                        p.processed_events = report.processed;
                        p.pages = report.pages;
                    });
                })
                .await;

            tx.send_modify(|p| match result {
                Ok(report) => {
                    p.processed_events = report.processed;
                    p.pages = report.pages;
                    p.phase = ReplayPhase::Complete;
                }
                Err(ReplayError::Cancelled) => {
                    p.phase = ReplayPhase::Cancelled;
                }
                Err(e) => {
                    p.phase = ReplayPhase::Failed;
                    p.error = Some(e.to_string());
                }
            });
        });

        handle
    }
}
