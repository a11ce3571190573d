//! Receiver/transmitter task bookkeeping.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::error;

/// Cooperative shutdown for the tasks serving one socket.
///
/// Tasks check [`is_running`](Self::is_running) at loop boundaries and
/// select on [`shutdown`](Self::shutdown) around every blocking await.
#[derive(Debug)]
pub(crate) struct Worker {
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    wake: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            shutdown: watch::Sender::new(false),
            wake: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn a task tracked by [`join`](Self::join).
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(task));
    }

    /// Receiver that resolves when [`stop`](Self::stop) is called.
    pub(crate) fn shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Wake the transmitter.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Ask every task to finish. Returns `true` on the first call only.
    pub(crate) fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.send_replace(true);
        self.wake.notify_one();
        true
    }

    /// Wait for every spawned task to finish.
    ///
    /// Must not be awaited from one of the tracked tasks.
    pub(crate) async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "connection task panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_stop_unblocks_and_join_waits() {
        let worker = Arc::new(Worker::new());
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let worker_ref = worker.clone();
            let finished = finished.clone();
            let mut shutdown = worker.shutdown();
            worker.spawn(async move {
                while worker_ref.is_running() {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = worker_ref.woken() => {}
                    }
                }
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(worker.stop());
        assert!(!worker.stop());
        worker.join().await;
        assert_eq!(finished.load(Ordering::SeqCst), 2);

        // Joining again has nothing left to wait for.
        worker.join().await;
        assert!(!worker.is_running());
    }
}
