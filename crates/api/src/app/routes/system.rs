use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::warn;

use relay_infra::checkpoint::CheckpointStore;

use crate::app::services::AppServices;

/// GET /health
///
/// Healthy while the checkpoint store answers.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.checkpoints.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
