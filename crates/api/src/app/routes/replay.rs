//! Replay endpoints for rebuilding the accounts read model.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use relay_infra::event_store::PageLimit;
use relay_infra::projections::{ReplayConfig, ReplayHandle, ReplayProgress, StreamReplayer};
use relay_infra::read_model::AccountStore;

use crate::app::{errors, services::AppServices};

// ─────────────────────────────────────────────────────────────────────────────
// Job Store
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory job store for tracking replay operations.
#[derive(Clone, Default)]
pub struct ReplayJobStore {
    jobs: Arc<RwLock<HashMap<Uuid, ReplayHandle>>>,
}

impl ReplayJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job_id: Uuid, handle: ReplayHandle) {
        self.jobs.write().await.insert(job_id, handle);
    }

    pub async fn get(&self, job_id: &Uuid) -> Option<ReplayHandle> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn list(&self) -> Vec<(Uuid, ReplayProgress)> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.progress()))
            .collect();
        // v7 ids sort by creation time.
        jobs.sort_by_key(|(id, _)| *id);
        jobs
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ReplayRequest {
    pub skip: Option<u64>,
    /// Page size; negative reads the whole stream in one page.
    pub limit: Option<i64>,
    /// Clear the read model before replaying.
    #[serde(default)]
    pub rebuild: bool,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub job_id: Uuid,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ReplayStatusResponse {
    pub job_id: Uuid,
    pub progress: ReplayProgress,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_replays).post(start_replay))
        .route("/:job_id", get(get_replay_status).delete(cancel_replay))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /admin/replay
pub async fn start_replay(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(job_store): Extension<ReplayJobStore>,
    Json(request): Json<ReplayRequest>,
) -> axum::response::Response {
    let mut config = ReplayConfig::default();
    if let Some(skip) = request.skip {
        config = config.with_skip(skip);
    }
    if let Some(raw) = request.limit {
        match PageLimit::try_from(raw) {
            Ok(limit) => config = config.with_limit(limit),
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_limit", e.to_string()),
        }
    }

    if request.rebuild {
        if let Err(e) = services.accounts.clear().await {
            return errors::read_model_error_to_response(&e);
        }
    }

    let job_id = Uuid::now_v7();
    let handle = StreamReplayer::new(services.event_store.clone(), config).spawn(services.accounts_projection.clone());
    job_store.insert(job_id, handle).await;

    info!(%job_id, skip = config.skip, rebuild = request.rebuild, "replay started");

    (
        StatusCode::ACCEPTED,
        Json(ReplayResponse {
            job_id,
            message: "replay started".to_string(),
        }),
    )
        .into_response()
}

/// GET /admin/replay
pub async fn list_replays(Extension(job_store): Extension<ReplayJobStore>) -> axum::response::Response {
    let jobs: Vec<ReplayStatusResponse> = job_store
        .list()
        .await
        .into_iter()
        .map(|(job_id, progress)| ReplayStatusResponse { job_id, progress })
        .collect();
    (StatusCode::OK, Json(jobs)).into_response()
}

/// GET /admin/replay/:job_id
pub async fn get_replay_status(
    Extension(job_store): Extension<ReplayJobStore>,
    Path(job_id): Path<Uuid>,
) -> axum::response::Response {
    match job_store.get(&job_id).await {
        Some(handle) => (
            StatusCode::OK,
            Json(ReplayStatusResponse {
                job_id,
                progress: handle.progress(),
            }),
        )
            .into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", "replay job not found"),
    }
}

/// DELETE /admin/replay/:job_id
///
/// Cancellation takes effect before the job's next event.
pub async fn cancel_replay(
    Extension(job_store): Extension<ReplayJobStore>,
    Path(job_id): Path<Uuid>,
) -> axum::response::Response {
    let Some(handle) = job_store.get(&job_id).await else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "replay job not found");
    };
    handle.cancel();
    info!(%job_id, "replay cancellation requested");
    (
        StatusCode::ACCEPTED,
        Json(ReplayStatusResponse {
            job_id,
            progress: handle.progress(),
        }),
    )
        .into_response()
}
