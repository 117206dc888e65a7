use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use relay_core::{ExpectedVersion, SagaId};
use relay_events::{CommitOutcome, MessageBus, SagaCommand, SagaError, SagaRepository, TimeoutSaga};

/// Persisted saga state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub id: SagaId,
    pub saga_type: String,
    /// Opaque saga state, owned by the saga's business logic.
    pub state: JsonValue,
    pub timeout_at: Option<DateTime<Utc>>,
    pub timeout_commands: Option<Vec<SagaCommand>>,
    pub remove_after_timeout: bool,
    /// Bumped on every commit.
    pub version: u64,
}

impl SagaRecord {
    pub fn new(saga_type: impl Into<String>, state: JsonValue) -> Self {
        Self {
            id: SagaId::new(),
            saga_type: saga_type.into(),
            state,
            timeout_at: None,
            timeout_commands: None,
            remove_after_timeout: false,
            version: 0,
        }
    }

    pub fn with_timeout(mut self, at: DateTime<Utc>, commands: Option<Vec<SagaCommand>>) -> Self {
        self.timeout_at = Some(at);
        self.timeout_commands = commands;
        self
    }

    pub fn removed_after_timeout(mut self) -> Self {
        self.remove_after_timeout = true;
        self
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at.is_some_and(|at| at <= now)
    }
}

struct Inner {
    records: RwLock<HashMap<SagaId, SagaRecord>>,
    command_bus: Arc<dyn MessageBus>,
}

fn lock_poisoned() -> SagaError {
    SagaError::Storage("lock poisoned".to_string())
}

/// In-memory saga repository for tests/dev.
///
/// Commits dispatch queued commands on `command_bus` before persisting, so a
/// failed write leads to re-dispatch on the next attempt, never to loss.
#[derive(Clone)]
pub struct InMemorySagaRepository {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for InMemorySagaRepository {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemorySagaRepository")
            .field("sagas", &self.len())
            .finish_non_exhaustive()
    }
}

impl InMemorySagaRepository {
    pub fn new(command_bus: Arc<dyn MessageBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: RwLock::new(HashMap::new()),
                command_bus,
            }),
        }
    }

    /// Store a new saga. Fails if the id is already taken.
    pub fn insert(&self, record: SagaRecord) -> Result<SagaId, SagaError> {
        let mut records = self.inner.records.write().map_err(|_| lock_poisoned())?;
        if let Some(existing) = records.get(&record.id) {
            return Err(SagaError::Conflict {
                id: record.id,
                expected: 0,
                actual: existing.version,
            });
        }
        let id = record.id;
        records.insert(id, record);
        Ok(id)
    }

    pub fn get(&self, id: SagaId) -> Option<SagaRecord> {
        self.inner.records.read().ok()?.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load one saga for modification.
    pub fn load(&self, id: SagaId) -> Result<StoredSaga, SagaError> {
        let record = self.get(id).ok_or(SagaError::NotFound(id))?;
        Ok(StoredSaga::new(record, self.inner.clone()))
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    type Saga = StoredSaga;

    async fn timed_out_sagas(&self, now: DateTime<Utc>) -> Result<Vec<StoredSaga>, SagaError> {
        let records = self.inner.records.read().map_err(|_| lock_poisoned())?;
        let mut due: Vec<SagaRecord> = records.values().filter(|r| r.is_due(now)).cloned().collect();
        due.sort_by_key(|r| (r.timeout_at, r.id.to_string()));

        Ok(due
            .into_iter()
            .map(|record| StoredSaga::new(record, self.inner.clone()))
            .collect())
    }
}

/// A saga loaded from [`InMemorySagaRepository`], with unsaved changes.
pub struct StoredSaga {
    record: SagaRecord,
    loaded_version: u64,
    pending: Vec<SagaCommand>,
    destroyed: bool,
    repo: Arc<Inner>,
}

impl core::fmt::Debug for StoredSaga {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StoredSaga")
            .field("record", &self.record)
            .field("pending", &self.pending.len())
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl StoredSaga {
    fn new(record: SagaRecord, repo: Arc<Inner>) -> Self {
        Self {
            loaded_version: record.version,
            record,
            pending: Vec::new(),
            destroyed: false,
            repo,
        }
    }

    pub fn record(&self) -> &SagaRecord {
        &self.record
    }

    pub fn pending_commands(&self) -> &[SagaCommand] {
        &self.pending
    }

    pub fn set_timeout(&mut self, at: DateTime<Utc>, commands: Option<Vec<SagaCommand>>) {
        self.record.timeout_at = Some(at);
        self.record.timeout_commands = commands;
    }

    pub fn set_state(&mut self, state: JsonValue) {
        self.record.state = state;
    }

    fn check_version(&self, records: &HashMap<SagaId, SagaRecord>) -> Result<(), SagaError> {
        let id = self.record.id;
        let actual = records.get(&id).map(|r| r.version).ok_or(SagaError::NotFound(id))?;
        ExpectedVersion::Exact(self.loaded_version)
            .check(actual)
            .map_err(|_| SagaError::Conflict {
                id,
                expected: self.loaded_version,
                actual,
            })
    }
}

#[async_trait]
impl TimeoutSaga for StoredSaga {
    fn id(&self) -> SagaId {
        self.record.id
    }

    fn timeout_at(&self) -> Option<DateTime<Utc>> {
        self.record.timeout_at
    }

    fn timeout_commands(&self) -> Option<Vec<SagaCommand>> {
        self.record.timeout_commands.clone()
    }

    fn add_command_to_send(&mut self, command: SagaCommand) {
        self.pending.push(command);
    }

    fn remove_timeout(&mut self) {
        self.record.timeout_at = None;
        self.record.timeout_commands = None;
    }

    fn remove_after_timeout(&self) -> bool {
        self.record.remove_after_timeout
    }

    fn destroy(&mut self) {
        self.destroyed = true;
    }

    async fn commit(&mut self) -> Result<CommitOutcome, SagaError> {
        {
            let records = self.repo.records.read().map_err(|_| lock_poisoned())?;
            self.check_version(&records)?;
        }

        for command in &self.pending {
            self.repo
                .command_bus
                .publish(command.clone().into_message(), None)
                .await
                .map_err(|e| SagaError::Dispatch(e.to_string()))?;
        }
        let dispatched = self.pending.len();

        let outcome = {
            let mut records = self.repo.records.write().map_err(|_| lock_poisoned())?;
            self.check_version(&records)?;

            if self.destroyed {
                records.remove(&self.record.id);
                CommitOutcome::Removed
            } else {
                self.record.version = self.loaded_version + 1;
                records.insert(self.record.id, self.record.clone());
                CommitOutcome::Updated
            }
        };

        self.pending.clear();
        self.loaded_version = self.record.version;
        debug!(saga = %self.record.id, dispatched, ?outcome, "saga committed");
        Ok(outcome)
    }
}
