//! Infrastructure for the coordination layer: stores, replay, the
//! cross-context bridge, saga timeouts and message dispatch.

pub mod bridge;
pub mod checkpoint;
pub mod dispatcher;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod saga;
pub mod workers;

#[cfg(test)]
mod integration_tests;
