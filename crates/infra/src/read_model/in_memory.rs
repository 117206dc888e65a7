use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use relay_core::AggregateId;

use super::{AccountRow, AccountStatement, AccountStore, ReadModelError, StatementOutcome};

/// In-memory accounts table for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    rows: RwLock<HashMap<AggregateId, AccountRow>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows, ordered by id.
    pub fn list(&self) -> Vec<AccountRow> {
        let Ok(rows) = self.rows.read() else {
            return vec![];
        };
        let mut out: Vec<AccountRow> = rows.values().cloned().collect();
        out.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        out
    }

    fn lock_poisoned() -> ReadModelError {
        ReadModelError::Unavailable("lock poisoned".to_string())
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn execute(&self, statement: &AccountStatement) -> Result<StatementOutcome, ReadModelError> {
        let mut rows = self.rows.write().map_err(|_| Self::lock_poisoned())?;

        match statement {
            AccountStatement::InsertAccount {
                id,
                owner,
                balance,
                revision,
            } => {
                if rows.contains_key(id) {
                    return Ok(StatementOutcome::AlreadyApplied);
                }
                rows.insert(
                    id.clone(),
                    AccountRow {
                        id: id.clone(),
                        owner: owner.clone(),
                        balance: *balance,
                        revision: *revision,
                    },
                );
                Ok(StatementOutcome::Applied)
            }
            AccountStatement::AdjustBalance { id, delta, revision } => {
                let Some(row) = rows.get_mut(id) else {
                    return Ok(StatementOutcome::MissingRow);
                };
                if *revision <= row.revision {
                    return Ok(StatementOutcome::AlreadyApplied);
                }
                row.balance = row
                    .balance
                    .checked_add(*delta)
                    .ok_or_else(|| ReadModelError::Corrupt(format!("balance overflow for account {id}")))?;
                row.revision = *revision;
                Ok(StatementOutcome::Applied)
            }
        }
    }

    async fn get(&self, id: &AggregateId) -> Result<Option<AccountRow>, ReadModelError> {
        let rows = self.rows.read().map_err(|_| Self::lock_poisoned())?;
        Ok(rows.get(id).cloned())
    }

    async fn clear(&self) -> Result<(), ReadModelError> {
        let mut rows = self.rows.write().map_err(|_| Self::lock_poisoned())?;
        rows.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> AggregateId {
        AggregateId::new(s).unwrap()
    }

    #[tokio::test]
    async fn insert_is_insert_if_absent() {
        let store = InMemoryAccountStore::new();
        let insert = AccountStatement::InsertAccount {
            id: id("acc-1"),
            owner: "ada".to_string(),
            balance: 100,
            revision: 0,
        };

        assert_eq!(store.execute(&insert).await.unwrap(), StatementOutcome::Applied);
        assert_eq!(store.execute(&insert).await.unwrap(), StatementOutcome::AlreadyApplied);
        assert_eq!(store.list().len(), 1);
    }

    #[tokio::test]
    async fn stale_and_orphan_adjustments_are_skipped() {
        let store = InMemoryAccountStore::new();
        store
            .execute(&AccountStatement::InsertAccount {
                id: id("acc-1"),
                owner: "ada".to_string(),
                balance: 100,
                revision: 2,
            })
            .await
            .unwrap();

        let stale = AccountStatement::AdjustBalance {
            id: id("acc-1"),
            delta: -30,
            revision: 2,
        };
        assert_eq!(store.execute(&stale).await.unwrap(), StatementOutcome::AlreadyApplied);

        let orphan = AccountStatement::AdjustBalance {
            id: id("acc-404"),
            delta: 5,
            revision: 1,
        };
        assert_eq!(store.execute(&orphan).await.unwrap(), StatementOutcome::MissingRow);

        assert_eq!(store.get(&id("acc-1")).await.unwrap().unwrap().balance, 100);
    }
}
