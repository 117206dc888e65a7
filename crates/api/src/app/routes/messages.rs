//! Inbound command/event endpoints.
//!
//! `?async=true` acknowledges as soon as the message is on the bus. Otherwise
//! the request waits for the dispatcher's debounced response list.

use std::sync::{Arc, Mutex};

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::oneshot;
use tracing::warn;

use relay_events::{HandlerResponse, MessageKind};
use relay_infra::dispatcher::{DispatchError, DispatchHandlers};

use crate::app::{errors, services::AppServices};

#[derive(Debug, Default, Deserialize)]
pub struct DispatchQuery {
    #[serde(rename = "async")]
    pub fire_and_forget: Option<String>,
}

impl DispatchQuery {
    fn is_async(&self) -> bool {
        self.fire_and_forget.as_deref() == Some("true")
    }
}

type Outcome = Result<Vec<HandlerResponse>, DispatchError>;

/// First writer wins; later outcomes for the same request are dropped.
#[derive(Clone)]
struct OutcomeSlot(Arc<Mutex<Option<oneshot::Sender<Outcome>>>>);

impl OutcomeSlot {
    fn new() -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    fn fill(&self, outcome: Outcome) -> bool {
        let sender = match self.0.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        if let Ok(mut slot) = self.0.lock() {
            slot.take();
        }
    }
}

/// POST /commands
pub async fn post_command(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<DispatchQuery>,
    Json(payload): Json<JsonValue>,
) -> axum::response::Response {
    dispatch(&services, MessageKind::Command, query, payload).await
}

/// POST /events
pub async fn post_event(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<DispatchQuery>,
    Json(payload): Json<JsonValue>,
) -> axum::response::Response {
    dispatch(&services, MessageKind::Event, query, payload).await
}

async fn dispatch(
    services: &AppServices,
    kind: MessageKind,
    query: DispatchQuery,
    payload: JsonValue,
) -> axum::response::Response {
    let (slot, outcome) = OutcomeSlot::new();

    let error_slot = slot.clone();
    let on_error = move |err: DispatchError| {
        warn!(%kind, error = %err, "dispatch error");
        error_slot.fill(Err(err));
    };

    if query.is_async() {
        let accepted = services
            .dispatcher
            .dispatch(kind, payload, DispatchHandlers::fire_and_forget(on_error))
            .await;
        if accepted.is_some() {
            // Handler failures from here on are only logged.
            slot.close();
            return (StatusCode::OK, Json(json!({ "ok": true }))).into_response();
        }
        drop(slot);
        return match outcome.await {
            Ok(Err(err)) => errors::dispatch_error_to_response(&err),
            _ => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "dispatch_failed", "dispatch failed"),
        };
    }

    let response_slot = slot.clone();
    let handlers = DispatchHandlers::aggregating(on_error, move |responses| {
        response_slot.fill(Ok(responses));
    });
    // The outcome arrives through the slot either way.
    let _ = services.dispatcher.dispatch(kind, payload, handlers).await;
    drop(slot);

    match outcome.await {
        Ok(Ok(responses)) => (StatusCode::OK, Json(responses)).into_response(),
        Ok(Err(err)) => errors::dispatch_error_to_response(&err),
        Err(_) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "dispatch_abandoned",
            "dispatch finished without a result",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_literal_true_selects_async_mode() {
        let q = |v: Option<&str>| DispatchQuery {
            fire_and_forget: v.map(str::to_string),
        };
        assert!(q(Some("true")).is_async());
        assert!(!q(Some("1")).is_async());
        assert!(!q(Some("TRUE")).is_async());
        assert!(!q(None).is_async());
    }

    #[tokio::test]
    async fn slot_keeps_the_first_outcome() {
        let (slot, rx) = OutcomeSlot::new();
        assert!(slot.fill(Ok(Vec::new())));
        assert!(!slot.fill(Err(DispatchError::InvalidPayload("null".to_string()))));
        assert!(matches!(rx.await, Ok(Ok(v)) if v.is_empty()));
    }
}
