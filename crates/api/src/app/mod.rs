//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: buses, stores, projection, bridge, scheduler, dispatcher
//! - `routes/`: HTTP routes + handlers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use relay_core::FailurePolicy;

use crate::config::AppConfig;

pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, StartupError, Workers};

/// A wired application: the router plus what it runs in the background.
pub struct App {
    pub router: Router,
    pub services: Arc<AppServices>,
    pub workers: Workers,
}

/// Build the full HTTP router and start background workers.
pub async fn build_app(config: AppConfig, failure: Arc<dyn FailurePolicy>) -> Result<App, StartupError> {
    let (services, workers) = services::build_services(config, failure).await?;
    let router = router(services.clone());
    Ok(App {
        router,
        services,
        workers,
    })
}

pub fn router(services: Arc<AppServices>) -> Router {
    let replay_jobs = routes::replay::ReplayJobStore::new();

    routes::router().layer(
        ServiceBuilder::new()
            .layer(Extension(services))
            .layer(Extension(replay_jobs)),
    )
}
