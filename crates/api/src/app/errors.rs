use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use relay_infra::dispatcher::DispatchError;
use relay_infra::event_store::EventStoreError;
use relay_infra::read_model::ReadModelError;

/// Dispatcher failures surface to HTTP callers as `500 {"error": ...}`.
pub fn dispatch_error_to_response(err: &DispatchError) -> axum::response::Response {
    let code = match err {
        DispatchError::InvalidPayload(_) => "invalid_payload",
        DispatchError::Bus(_) => "publish_error",
        DispatchError::Handler { .. } => "handler_error",
    };
    json_error(StatusCode::INTERNAL_SERVER_ERROR, code, err.to_string())
}

pub fn read_model_error_to_response(err: &ReadModelError) -> axum::response::Response {
    match err {
        ReadModelError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "read_model_unavailable", msg.clone())
        }
        ReadModelError::Corrupt(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "read_model_corrupt", msg.clone()),
    }
}

pub fn event_store_error_to_response(err: &EventStoreError) -> axum::response::Response {
    match err {
        EventStoreError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "event_store_unavailable", msg.clone())
        }
        EventStoreError::InvalidAppend(msg) | EventStoreError::InvalidRead(msg) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_event", msg.clone())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": message.into(),
            "code": code,
        })),
    )
        .into_response()
}
