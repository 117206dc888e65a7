use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use relay_core::AggregateId;
use relay_infra::read_model::AccountStore;

use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new().route("/:id", get(get_account))
}

/// GET /accounts/:id
pub async fn get_account(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match AggregateId::new(id) {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    match services.accounts.get(&id).await {
        Ok(Some(row)) => (StatusCode::OK, Json(row)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("account {id} not found")),
        Err(e) => errors::read_model_error_to_response(&e),
    }
}
