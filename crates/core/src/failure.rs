//! Failure policy for unrecoverable wiring errors.
//!
//! Long-running components (bridge, scheduler) never exit the process
//! themselves. They report fatal conditions to an injected policy, and the
//! binary decides what "fatal" means (usually: log and exit so a supervisor
//! restarts us).

use std::sync::Mutex;

use tracing::error;

/// Capability invoked when a component hits an unrecoverable failure.
pub trait FailurePolicy: Send + Sync + 'static {
    fn on_fatal(&self, component: &str, error: &(dyn std::error::Error + 'static));
}

/// Logs the failure and terminates the process with exit code 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitProcess;

impl FailurePolicy for ExitProcess {
    fn on_fatal(&self, component: &str, err: &(dyn std::error::Error + 'static)) {
        error!(component, error = %err, "fatal failure; exiting");
        std::process::exit(1);
    }
}

/// Records fatal failures instead of exiting (tests/dev).
#[derive(Debug, Default)]
pub struct RecordingFailurePolicy {
    failures: Mutex<Vec<(String, String)>>,
}

impl RecordingFailurePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(component, error message)` pairs in the order they were reported.
    pub fn failures(&self) -> Vec<(String, String)> {
        self.failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }
}

impl FailurePolicy for RecordingFailurePolicy {
    fn on_fatal(&self, component: &str, err: &(dyn std::error::Error + 'static)) {
        error!(component, error = %err, "fatal failure recorded");
        if let Ok(mut failures) = self.failures.lock() {
            failures.push((component.to_string(), err.to_string()));
        }
    }
}
