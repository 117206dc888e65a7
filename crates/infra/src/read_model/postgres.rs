//! Postgres-backed accounts table.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use relay_core::AggregateId;

use super::{AccountRow, AccountStatement, AccountStore, ReadModelError, StatementOutcome};

#[derive(Debug, Clone)]
pub struct PostgresAccountStore {
    pool: Arc<PgPool>,
}

fn map_sqlx(e: sqlx::Error) -> ReadModelError {
    ReadModelError::Unavailable(e.to_string())
}

fn to_i64(value: u64, what: &str) -> Result<i64, ReadModelError> {
    i64::try_from(value).map_err(|_| ReadModelError::Corrupt(format!("{what} {value} out of range")))
}

impl PostgresAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), ReadModelError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                balance BIGINT NOT NULL,
                revision BIGINT NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn exists(&self, id: &AggregateId) -> Result<bool, ReadModelError> {
        let row = sqlx::query("SELECT 1 AS present FROM accounts WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    #[instrument(skip(self, statement), fields(account = %statement.account_id()))]
    async fn execute(&self, statement: &AccountStatement) -> Result<StatementOutcome, ReadModelError> {
        let result = match statement {
            AccountStatement::InsertAccount {
                id,
                owner,
                balance,
                revision,
            } => sqlx::query(statement.sql())
                .bind(id.as_str())
                .bind(owner)
                .bind(*balance)
                .bind(to_i64(*revision, "revision")?)
                .execute(&*self.pool)
                .await
                .map_err(map_sqlx)?,
            AccountStatement::AdjustBalance { id, delta, revision } => sqlx::query(statement.sql())
                .bind(id.as_str())
                .bind(*delta)
                .bind(to_i64(*revision, "revision")?)
                .execute(&*self.pool)
                .await
                .map_err(map_sqlx)?,
        };

        if result.rows_affected() > 0 {
            return Ok(StatementOutcome::Applied);
        }

        match statement {
            AccountStatement::InsertAccount { .. } => Ok(StatementOutcome::AlreadyApplied),
            AccountStatement::AdjustBalance { id, .. } => {
                if self.exists(id).await? {
                    Ok(StatementOutcome::AlreadyApplied)
                } else {
                    Ok(StatementOutcome::MissingRow)
                }
            }
        }
    }

    async fn get(&self, id: &AggregateId) -> Result<Option<AccountRow>, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner, balance, revision
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let revision: i64 = row.try_get("revision").map_err(map_sqlx)?;
        Ok(Some(AccountRow {
            id: id.clone(),
            owner: row.try_get("owner").map_err(map_sqlx)?,
            balance: row.try_get("balance").map_err(map_sqlx)?,
            revision: u64::try_from(revision)
                .map_err(|_| ReadModelError::Corrupt(format!("negative revision for account {id}")))?,
        }))
    }

    async fn clear(&self) -> Result<(), ReadModelError> {
        sqlx::query("TRUNCATE accounts")
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}
