//! HTTP API: configuration, service wiring and routes.

pub mod app;
pub mod config;
