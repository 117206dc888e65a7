//! Process-wide tracing setup shared by the binary and tests.

pub mod tracing;

pub use crate::tracing::{init, init_test, init_with_default};
