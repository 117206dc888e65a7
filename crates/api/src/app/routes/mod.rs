use axum::{routing::get, routing::post, Router};

pub mod accounts;
pub mod feed;
pub mod messages;
pub mod replay;
pub mod system;

/// Router for every endpoint; services are attached by the caller.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/commands", post(messages::post_command))
        .route("/events", post(messages::post_event))
        .route("/feed/events", post(feed::append_to_feed))
        .nest("/accounts", accounts::router())
        .nest("/admin/replay", replay::router())
}
