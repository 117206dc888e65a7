//! Accounts read model: rows, idempotent statements and their stores.
//!
//! Read models are disposable. They can be cleared and rebuilt by replaying
//! the event stream, which is why every statement must be safe to repeat.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use relay_core::AggregateId;

pub use in_memory::InMemoryAccountStore;
pub use postgres::PostgresAccountStore;

/// One row of the accounts table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRow {
    pub id: AggregateId,
    pub owner: String,
    pub balance: i64,
    /// Aggregate revision of the last event applied to this row.
    pub revision: u64,
}

/// An idempotent write against the accounts table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountStatement {
    /// Insert the row unless it already exists.
    InsertAccount {
        id: AggregateId,
        owner: String,
        balance: i64,
        revision: u64,
    },
    /// Add `delta` to the balance, only if `revision` is newer than the row's.
    AdjustBalance {
        id: AggregateId,
        delta: i64,
        revision: u64,
    },
}

impl AccountStatement {
    pub fn account_id(&self) -> &AggregateId {
        match self {
            AccountStatement::InsertAccount { id, .. } | AccountStatement::AdjustBalance { id, .. } => id,
        }
    }

    /// Parameterized Postgres text for this statement.
    pub fn sql(&self) -> &'static str {
        match self {
            AccountStatement::InsertAccount { .. } => {
                "INSERT INTO accounts (id, owner, balance, revision) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (id) DO NOTHING"
            }
            AccountStatement::AdjustBalance { .. } => {
                "UPDATE accounts SET balance = balance + $2, revision = $3 \
                 WHERE id = $1 AND revision < $3"
            }
        }
    }
}

/// What executing a statement did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatementOutcome {
    Applied,
    /// The row already reflects this statement.
    AlreadyApplied,
    /// A balance change targeted an account that does not exist.
    MissingRow,
}

#[derive(Debug, Clone, Error)]
pub enum ReadModelError {
    #[error("read model store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt read model row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn execute(&self, statement: &AccountStatement) -> Result<StatementOutcome, ReadModelError>;

    async fn get(&self, id: &AggregateId) -> Result<Option<AccountRow>, ReadModelError>;

    /// Drop every row (rebuild support).
    async fn clear(&self) -> Result<(), ReadModelError>;
}

#[async_trait]
impl<S> AccountStore for Arc<S>
where
    S: AccountStore + ?Sized,
{
    async fn execute(&self, statement: &AccountStatement) -> Result<StatementOutcome, ReadModelError> {
        (**self).execute(statement).await
    }

    async fn get(&self, id: &AggregateId) -> Result<Option<AccountRow>, ReadModelError> {
        (**self).get(id).await
    }

    async fn clear(&self) -> Result<(), ReadModelError> {
        (**self).clear().await
    }
}
