//! Projection implementations (read model builders) and replay tooling.
//!
//! All projections are:
//! - **Rebuildable**: can be reconstructed from the event stream
//! - **Idempotent**: safe for at-least-once delivery

pub mod accounts;
pub mod replay;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::debug;

use relay_events::{DomainEvent, HandlerError, Message, MessageHandler, Projection, ProjectionError};

pub use accounts::{AccountsProjection, statement_for};
pub use replay::{
    ReplayConfig, ReplayError, ReplayHandle, ReplayPhase, ReplayProgress, ReplayReport, StreamReplayer,
};

/// Feeds bus events into a projection and acknowledges each one.
///
/// Messages whose payload is not a domain event are left alone (no reply).
pub struct ProjectionHandler {
    projection: Arc<dyn Projection>,
}

impl ProjectionHandler {
    pub fn new(projection: Arc<dyn Projection>) -> Self {
        Self { projection }
    }
}

#[async_trait]
impl MessageHandler for ProjectionHandler {
    async fn handle(&self, message: &Message) -> Result<Option<JsonValue>, HandlerError> {
        let Ok(event) = serde_json::from_value::<DomainEvent>(message.payload.clone()) else {
            debug!(projection = self.projection.name(), message_id = %message.id, "not a domain event; skipped");
            return Ok(None);
        };

        self.projection.apply(&event).await.map_err(|e| match e {
            ProjectionError::InvalidEvent(reason) => HandlerError::Rejected(reason),
            ProjectionError::Store(reason) => HandlerError::Failed(reason),
        })?;

        Ok(Some(json!({
            "projection": self.projection.name(),
            "event": event.name,
            "aggregateId": event.aggregate_id(),
            "revision": event.revision(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_model::{AccountStore, InMemoryAccountStore};
    use relay_core::AggregateId;

    #[tokio::test]
    async fn handler_applies_and_acknowledges() {
        let accounts = Arc::new(InMemoryAccountStore::new());
        let handler = ProjectionHandler::new(Arc::new(AccountsProjection::new(accounts.clone())));

        let reply = handler
            .handle(&Message::event(json!({
                "name": "accountOpened",
                "aggregate": { "id": "acc-9", "revision": 0 },
                "payload": { "owner": "eve", "initialBalance": 5 }
            })))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply["projection"], "accounts");
        assert_eq!(reply["aggregateId"], "acc-9");
        let row = accounts.get(&AggregateId::new("acc-9").unwrap()).await.unwrap().unwrap();
        assert_eq!(row.balance, 5);
    }

    #[tokio::test]
    async fn foreign_payloads_are_skipped() {
        let handler = ProjectionHandler::new(Arc::new(AccountsProjection::new(InMemoryAccountStore::new())));
        let reply = handler.handle(&Message::event(json!({ "hello": "world" }))).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn malformed_account_events_are_rejected() {
        let handler = ProjectionHandler::new(Arc::new(AccountsProjection::new(InMemoryAccountStore::new())));
        let err = handler
            .handle(&Message::event(json!({
                "name": "moneyDeposited",
                "aggregate": { "id": "acc-1", "revision": 1 },
                "payload": {}
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));
    }
}
