//! Background worker plumbing shared by the bridge and the saga scheduler.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

/// Receiving side of a worker's shutdown request.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal plus the sender that triggers it.
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested or the sender is gone.
    /// Cancel-safe; meant to sit in a `select!`.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Handle to stop and join a background worker task.
#[derive(Debug)]
pub struct WorkerHandle<T> {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<T>,
}

impl<T> WorkerHandle<T>
where
    T: Send + 'static,
{
    /// Spawn `worker` with a fresh shutdown signal.
    pub fn spawn<F, Fut>(name: &'static str, worker: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (shutdown, signal) = ShutdownSignal::new();
        let join = tokio::spawn(worker(signal));
        Self { name, shutdown, join }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) -> Result<T, JoinError> {
        debug!(worker = self.name, "shutdown requested");
        let _ = self.shutdown.send(true);
        self.join.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn worker_stops_on_request() {
        let handle = WorkerHandle::spawn("ticker", |mut shutdown| async move {
            let mut ticks = 0u32;
            loop {
                tokio::select! {
                    _ = shutdown.wait() => return ticks,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => ticks += 1,
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(!handle.is_finished());
        assert_eq!(handle.shutdown().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, mut signal) = ShutdownSignal::new();
        drop(tx);
        signal.wait().await;
        assert!(!signal.is_shutdown());
    }
}
