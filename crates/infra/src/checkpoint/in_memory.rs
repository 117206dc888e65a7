use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{CheckpointError, CheckpointStore, FeedKey};

/// In-memory checkpoint store for tests/dev.
///
/// `set_available(false)` makes every call fail, to exercise outage paths.
#[derive(Debug)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, u64>>,
    available: AtomicBool,
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self {
            checkpoints: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CheckpointError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CheckpointError::Unavailable("store marked unavailable".to_string()))
        }
    }

    fn lock_poisoned() -> CheckpointError {
        CheckpointError::Unavailable("lock poisoned".to_string())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, key: &FeedKey) -> Result<Option<u64>, CheckpointError> {
        self.check_available()?;
        let checkpoints = self.checkpoints.read().map_err(|_| Self::lock_poisoned())?;
        Ok(checkpoints.get(&key.to_string()).copied())
    }

    async fn set(&self, key: &FeedKey, index: u64) -> Result<(), CheckpointError> {
        self.check_available()?;
        let mut checkpoints = self.checkpoints.write().map_err(|_| Self::lock_poisoned())?;
        let slot = checkpoints.entry(key.to_string()).or_insert(index);
        *slot = (*slot).max(index);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CheckpointError> {
        self.check_available()
    }
}
