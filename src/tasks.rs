//! Tracked background task set.
//!
//! Rotation saves and step closes run off the hot path, but must all be
//! joined before the process can report success. Detached spawns would
//! make that untestable, so every background future goes through a
//! [`TaskSet`] and the owner awaits [`TaskSet::shutdown`].

// std::sync::Mutex is correct here: the lock is never held across an
// .await point.
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::warn;

/// Set of background tasks awaited as a group.
#[derive(Clone, Default)]
pub struct TaskSet {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskSet {
    /// Create an empty task set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a future and track its handle.
    ///
    /// The handle is registered before this returns, so a task spawned
    /// just ahead of `shutdown` can never be missed by the join.
    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);

        let mut guard = self.handles.lock().expect("mutex poisoned");
        guard.retain(|h| !h.is_finished());
        guard.push(handle);
    }

    /// Wait for every tracked task to finish.
    ///
    /// This is the drain barrier: callers invoke it exactly once at
    /// end-of-stream. Panicked tasks are reported and skipped.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().expect("mutex poisoned"));

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task panicked");
            }
        }
    }

    /// Number of tasks not yet finished.
    pub fn pending_count(&self) -> usize {
        let mut guard = self.handles.lock().expect("mutex poisoned");
        guard.retain(|h| !h.is_finished());
        guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_joins_all_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tasks = TaskSet::new();

        for delay in [5u64, 15] {
            let counter = counter.clone();
            tasks.spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tasks.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_on_empty_set_returns_immediately() {
        TaskSet::new().shutdown().await;
    }

    #[tokio::test]
    async fn pending_count_drops_as_tasks_finish() {
        let tasks = TaskSet::new();
        tasks.spawn(async {});
        tasks.shutdown().await;
        assert_eq!(tasks.pending_count(), 0);
    }
}
