//! Executor adapters for tokio and rayon, and an async release wait.

use crate::AccessToken;
use arbiter_core::executor::run_task;
use arbiter_core::{ArbiterError, ArbiterResult, CancelToken, Cleanup, Task, TaskExecutor, TaskOutcome};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Reports cancellation if the closure holding it is dropped without
/// running, e.g. when the runtime shuts down with the task still queued.
struct CleanupGuard(Option<Cleanup>);

impl CleanupGuard {
    fn run(mut self, cancel: &CancelToken, task: Task) {
        run_task(cancel, task, self.0.take());
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup(TaskOutcome::cancelled());
        }
    }
}

/// Runs tasks on the blocking pool of a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the calling context.
    pub fn current() -> ArbiterResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ArbiterError::IllegalState(format!("no tokio runtime: {e}")))
    }
}

impl TaskExecutor for TokioExecutor {
    fn execute(&self, cancel: CancelToken, task: Task, cleanup: Option<Cleanup>) {
        let guard = CleanupGuard(cleanup);
        // Dropping the JoinHandle detaches the task.
        let _ = self
            .handle
            .spawn_blocking(move || guard.run(&cancel, task));
    }
}

/// Runs tasks on a rayon thread pool in FIFO order.
#[derive(Clone)]
pub struct RayonExecutor {
    pool: Arc<rayon::ThreadPool>,
}

impl RayonExecutor {
    pub fn new(pool: Arc<rayon::ThreadPool>) -> Self {
        Self { pool }
    }

    pub fn with_threads(threads: usize) -> ArbiterResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("arbiter-worker-{i}"))
            .build()
            .map_err(|e| ArbiterError::Internal(format!("failed to build thread pool: {e}")))?;
        Ok(Self::new(Arc::new(pool)))
    }
}

impl std::fmt::Debug for RayonExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonExecutor")
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl TaskExecutor for RayonExecutor {
    fn execute(&self, cancel: CancelToken, task: Task, cleanup: Option<Cleanup>) {
        let guard = CleanupGuard(cleanup);
        self.pool.spawn_fifo(move || guard.run(&cancel, task));
    }
}

/// Completes once `token` is released.
pub async fn released<I, T>(token: &T)
where
    T: AccessToken<I> + ?Sized,
{
    let (tx, rx) = oneshot::channel();
    let _registration = token.add_release_listener(Box::new(move || {
        let _ = tx.send(());
    }));
    // The sender is only dropped unsent if the listener was discarded.
    let _ = rx.await;
}
