//! Accounts projection: account events -> accounts table.
//!
//! | event            | statement                                   |
//! |------------------|---------------------------------------------|
//! | `accountOpened`  | insert `(id, owner, initialBalance, rev)`   |
//! | `moneyWithdrawn` | balance -= `amount`, revision = rev         |
//! | `moneyDeposited` | balance += `amount`, revision = rev         |
//!
//! Any other event name is ignored.

use async_trait::async_trait;
use tracing::{debug, warn};

use relay_core::AggregateId;
use relay_events::{DomainEvent, Projection, ProjectionError};

use crate::read_model::{AccountRow, AccountStatement, AccountStore, StatementOutcome};

pub const ACCOUNT_OPENED: &str = "accountOpened";
pub const MONEY_WITHDRAWN: &str = "moneyWithdrawn";
pub const MONEY_DEPOSITED: &str = "moneyDeposited";

fn amount(event: &DomainEvent) -> Result<i64, ProjectionError> {
    event.payload_i64("amount").ok_or_else(|| {
        ProjectionError::InvalidEvent(format!(
            "{} for {} has no integer 'amount'",
            event.name,
            event.aggregate_id()
        ))
    })
}

/// Map an event to the statement it produces, if any.
pub fn statement_for(event: &DomainEvent) -> Result<Option<AccountStatement>, ProjectionError> {
    let id = event.aggregate_id().clone();
    let revision = event.revision();

    let statement = match event.name.as_str() {
        ACCOUNT_OPENED => {
            let owner = event.payload_str("owner").ok_or_else(|| {
                ProjectionError::InvalidEvent(format!("{ACCOUNT_OPENED} for {id} has no 'owner'"))
            })?;
            let balance = match event.payload.get("initialBalance") {
                None => 0,
                Some(_) => event.payload_i64("initialBalance").ok_or_else(|| {
                    ProjectionError::InvalidEvent(format!(
                        "{ACCOUNT_OPENED} for {id} has a non-integer 'initialBalance'"
                    ))
                })?,
            };
            AccountStatement::InsertAccount {
                id,
                owner: owner.to_string(),
                balance,
                revision,
            }
        }
        MONEY_WITHDRAWN => {
            let delta = amount(event)?.checked_neg().ok_or_else(|| {
                ProjectionError::InvalidEvent(format!("{MONEY_WITHDRAWN} for {id} amount out of range"))
            })?;
            AccountStatement::AdjustBalance { id, delta, revision }
        }
        MONEY_DEPOSITED => AccountStatement::AdjustBalance {
            id,
            delta: amount(event)?,
            revision,
        },
        _ => return Ok(None),
    };

    Ok(Some(statement))
}

/// Idempotent projection of account events into an [`AccountStore`].
#[derive(Debug)]
pub struct AccountsProjection<S> {
    store: S,
}

impl<S> AccountsProjection<S>
where
    S: AccountStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn get(&self, id: &AggregateId) -> Result<Option<AccountRow>, ProjectionError> {
        self.store
            .get(id)
            .await
            .map_err(|e| ProjectionError::Store(e.to_string()))
    }
}

#[async_trait]
impl<S> Projection for AccountsProjection<S>
where
    S: AccountStore,
{
    fn name(&self) -> &str {
        "accounts"
    }

    async fn apply(&self, event: &DomainEvent) -> Result<(), ProjectionError> {
        let Some(statement) = statement_for(event)? else {
            return Ok(());
        };

        let outcome = self
            .store
            .execute(&statement)
            .await
            .map_err(|e| ProjectionError::Store(e.to_string()))?;

        match outcome {
            StatementOutcome::Applied => {}
            StatementOutcome::AlreadyApplied => {
                debug!(event = %event.name, account = %event.aggregate_id(), revision = event.revision(), "event already reflected");
            }
            StatementOutcome::MissingRow => {
                warn!(event = %event.name, account = %event.aggregate_id(), "balance change for unknown account ignored");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_model::InMemoryAccountStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn event(name: &str, id: &str, revision: u64, payload: serde_json::Value) -> DomainEvent {
        DomainEvent::new(name, AggregateId::new(id).unwrap(), revision, payload).unwrap()
    }

    fn acc(id: &str) -> AggregateId {
        AggregateId::new(id).unwrap()
    }

    #[tokio::test]
    async fn open_then_withdraw() {
        let projection = AccountsProjection::new(InMemoryAccountStore::new());

        projection
            .apply(&event(ACCOUNT_OPENED, "acc-1", 0, json!({ "owner": "ada", "initialBalance": 100 })))
            .await
            .unwrap();
        projection
            .apply(&event(MONEY_WITHDRAWN, "acc-1", 1, json!({ "amount": 30 })))
            .await
            .unwrap();

        let row = projection.get(&acc("acc-1")).await.unwrap().unwrap();
        assert_eq!(row.owner, "ada");
        assert_eq!(row.balance, 70);
        assert_eq!(row.revision, 1);
    }

    #[tokio::test]
    async fn unknown_events_are_ignored() {
        let projection = AccountsProjection::new(InMemoryAccountStore::new());
        projection
            .apply(&event("accountRenamed", "acc-1", 3, json!({ "owner": "bob" })))
            .await
            .unwrap();
        assert!(projection.store().list().is_empty());
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(statement_for(&event(ACCOUNT_OPENED, "a", 0, json!({ "initialBalance": 1 }))).is_err());
        assert!(statement_for(&event(MONEY_DEPOSITED, "a", 1, json!({ "amount": "ten" }))).is_err());

        let opened = statement_for(&event(ACCOUNT_OPENED, "a", 0, json!({ "owner": "x" })))
            .unwrap()
            .unwrap();
        assert!(matches!(opened, AccountStatement::InsertAccount { balance: 0, .. }));
    }

    #[derive(Debug, Clone)]
    enum Movement {
        Withdraw(i64),
        Deposit(i64),
    }

    fn movement() -> impl Strategy<Value = Movement> {
        prop_oneof![
            (0i64..1_000).prop_map(Movement::Withdraw),
            (0i64..1_000).prop_map(Movement::Deposit),
        ]
    }

    fn stream(initial: i64, movements: &[Movement]) -> Vec<DomainEvent> {
        let mut events = vec![event(
            ACCOUNT_OPENED,
            "acc-p",
            0,
            json!({ "owner": "prop", "initialBalance": initial }),
        )];
        for (i, m) in movements.iter().enumerate() {
            let (name, amount) = match m {
                Movement::Withdraw(a) => (MONEY_WITHDRAWN, *a),
                Movement::Deposit(a) => (MONEY_DEPOSITED, *a),
            };
            events.push(event(name, "acc-p", i as u64 + 1, json!({ "amount": amount })));
        }
        events
    }

    async fn project(events: &[DomainEvent]) -> AccountRow {
        let projection = AccountsProjection::new(InMemoryAccountStore::new());
        for e in events {
            projection.apply(e).await.unwrap();
        }
        projection.get(&acc("acc-p")).await.unwrap().unwrap()
    }

    proptest! {
        #[test]
        fn redelivery_does_not_change_the_row(
            initial in 0i64..10_000,
            movements in prop::collection::vec(movement(), 0..20),
            repeats in prop::collection::vec(1usize..4, 21),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let events = stream(initial, &movements);

            // Every event delivered one or more times, in order.
            let redelivered: Vec<DomainEvent> = events
                .iter()
                .zip(repeats.iter())
                .flat_map(|(e, n)| std::iter::repeat(e.clone()).take(*n))
                .collect();

            // The whole stream replayed a second time.
            let mut replayed = events.clone();
            replayed.extend(events.iter().cloned());

            let once = rt.block_on(project(&events));
            prop_assert_eq!(&rt.block_on(project(&redelivered)), &once);
            prop_assert_eq!(&rt.block_on(project(&replayed)), &once);

            let expected: i64 = movements.iter().fold(initial, |b, m| match m {
                Movement::Withdraw(a) => b - a,
                Movement::Deposit(a) => b + a,
            });
            prop_assert_eq!(once.balance, expected);
            prop_assert_eq!(once.revision, movements.len() as u64);
        }
    }
}
