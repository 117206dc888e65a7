//! Ingress for the source context's feed.
//!
//! Events posted here are appended to the feed the bridge tails, exactly as
//! if the source context had written them to its stream.

use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use relay_events::DomainEvent;
use relay_infra::event_store::EventStore;

use crate::app::{errors, services::AppServices};

/// One event or a batch; a batch is appended atomically and in order.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FeedAppend {
    Batch(Vec<DomainEvent>),
    One(DomainEvent),
}

impl FeedAppend {
    fn into_events(self) -> Vec<DomainEvent> {
        match self {
            FeedAppend::Batch(events) => events,
            FeedAppend::One(event) => vec![event],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FeedAppendResponse {
    pub positions: Vec<u64>,
}

/// POST /feed/events
pub async fn append_to_feed(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<FeedAppend>,
) -> axum::response::Response {
    let events = body.into_events();
    if events.is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "empty_batch", "no events to append");
    }

    match services.source_feed.append(events).await {
        Ok(stored) => {
            let positions: Vec<u64> = stored.iter().map(|e| e.position).collect();
            info!(
                source = %services.config.source_context,
                count = positions.len(),
                last = positions.last().copied(),
                "events appended to source feed"
            );
            (StatusCode::CREATED, Json(FeedAppendResponse { positions })).into_response()
        }
        Err(e) => errors::event_store_error_to_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_a_single_event_or_a_batch() {
        let event = json!({ "name": "orderPlaced", "aggregate": { "id": "order-1", "revision": 0 } });

        let one: FeedAppend = serde_json::from_value(event.clone()).unwrap();
        assert_eq!(one.into_events().len(), 1);

        let batch: FeedAppend = serde_json::from_value(json!([event.clone(), event])).unwrap();
        assert_eq!(batch.into_events().len(), 2);

        let empty: FeedAppend = serde_json::from_value(json!([])).unwrap();
        assert!(empty.into_events().is_empty());
    }

    #[test]
    fn rejects_events_without_an_aggregate() {
        assert!(serde_json::from_value::<FeedAppend>(json!({ "name": "orderPlaced" })).is_err());
    }
}
