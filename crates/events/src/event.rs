use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use relay_core::{AggregateId, DomainError};

/// Reference to the aggregate an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRef {
    pub id: AggregateId,
    /// Aggregate version after this event was applied.
    pub revision: u64,
}

/// A domain event as written by the command side.
///
/// Events are facts: once stored they are never modified. Ordering within a
/// stream is carried by the store (see `StoredEvent::position` in infra), not
/// by the event itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Event name, e.g. `"accountOpened"`.
    pub name: String,
    pub aggregate: AggregateRef,
    #[serde(default)]
    pub payload: JsonMap<String, JsonValue>,
}

impl DomainEvent {
    /// Build an event from a JSON payload. The payload must be an object.
    pub fn new(
        name: impl Into<String>,
        aggregate_id: AggregateId,
        revision: u64,
        payload: JsonValue,
    ) -> Result<Self, DomainError> {
        let name = name.into();
        let payload = match payload {
            JsonValue::Object(map) => map,
            JsonValue::Null => JsonMap::new(),
            other => {
                return Err(DomainError::validation(format!(
                    "event '{name}' payload must be an object, got {other}"
                )));
            }
        };

        Ok(Self {
            name,
            aggregate: AggregateRef {
                id: aggregate_id,
                revision,
            },
            payload,
        })
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate.id
    }

    pub fn revision(&self) -> u64 {
        self.aggregate.revision
    }

    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(JsonValue::as_str)
    }

    pub fn payload_i64(&self, field: &str) -> Option<i64> {
        self.payload.get(field).and_then(JsonValue::as_i64)
    }
}
