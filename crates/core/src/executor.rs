//! Task submission interface shared by every executor and token wrapper.
//!
//! Contract: `execute` calls the cleanup callback exactly once, whether the
//! task ran, failed, was skipped because of cancellation, or was rejected.

use crate::cancel::CancelToken;
use crate::error::{ArbiterError, ArbiterResult};
use crate::signal::ReleaseSignal;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// A task body. Observes cancellation through the passed token.
pub type Task = Box<dyn FnOnce(&CancelToken) -> ArbiterResult<()> + Send>;

/// Called once after the task finished or was skipped.
pub type Cleanup = Box<dyn FnOnce(TaskOutcome) + Send>;

/// How a submitted task ended.
#[derive(Debug)]
pub struct TaskOutcome {
    pub cancelled: bool,
    pub error: Option<ArbiterError>,
}

impl TaskOutcome {
    pub fn completed() -> Self {
        Self {
            cancelled: false,
            error: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            error: None,
        }
    }

    pub fn failed(error: ArbiterError) -> Self {
        Self {
            cancelled: false,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.error.is_none()
    }

    pub fn into_result(self) -> ArbiterResult<()> {
        match (self.cancelled, self.error) {
            (_, Some(e)) => Err(e),
            (true, None) => Err(ArbiterError::Cancelled),
            (false, None) => Ok(()),
        }
    }
}

pub trait TaskExecutor: Send + Sync {
    fn execute(&self, cancel: CancelToken, task: Task, cleanup: Option<Cleanup>);
}

/// An executor that knows whether the current code runs inside one of
/// its tasks.
pub trait ContextAwareExecutor: TaskExecutor {
    fn is_executing_in_this(&self) -> bool;
}

impl<T: TaskExecutor + ?Sized> TaskExecutor for Arc<T> {
    fn execute(&self, cancel: CancelToken, task: Task, cleanup: Option<Cleanup>) {
        (**self).execute(cancel, task, cleanup)
    }
}

impl<T: ContextAwareExecutor + ?Sized> ContextAwareExecutor for Arc<T> {
    fn is_executing_in_this(&self) -> bool {
        (**self).is_executing_in_this()
    }
}

/// A task that does nothing, used to deliver cleanup-only submissions.
pub fn noop_task() -> Task {
    Box::new(|_| Ok(()))
}

/// Runs `task` in the calling thread and reports through `cleanup`.
///
/// Pre-cancelled tasks are skipped. A task returning `Cancelled` counts as
/// cancelled, not failed. Panics are caught and reported as task errors.
pub fn run_task(cancel: &CancelToken, task: Task, cleanup: Option<Cleanup>) {
    let outcome = if cancel.is_cancelled() {
        TaskOutcome::cancelled()
    } else {
        match panic::catch_unwind(AssertUnwindSafe(|| task(cancel))) {
            Ok(Ok(())) => TaskOutcome::completed(),
            Ok(Err(e)) if e.is_cancelled() => TaskOutcome::cancelled(),
            Ok(Err(e)) => TaskOutcome::failed(e),
            Err(payload) => TaskOutcome::failed(ArbiterError::from_panic(payload)),
        }
    };

    if let Some(cleanup) = cleanup {
        cleanup(outcome);
    } else if let Some(err) = outcome.error {
        tracing::debug!(error = %err, "task failed without cleanup");
    }
}

/// Runs every task inline in the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncExecutor;

impl TaskExecutor for SyncExecutor {
    fn execute(&self, cancel: CancelToken, task: Task, cleanup: Option<Cleanup>) {
        run_task(&cancel, task, cleanup);
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Waitable result of [`TaskExecutorExt::submit`].
pub struct TaskHandle {
    done: ReleaseSignal,
    outcome: Arc<Mutex<Option<TaskOutcome>>>,
}

impl TaskHandle {
    pub fn is_done(&self) -> bool {
        self.done.is_signaled()
    }

    /// Blocks until the task's cleanup ran, then returns its outcome.
    /// Cancelling `cancel` only stops the wait, not the task.
    pub fn wait(self, cancel: &CancelToken) -> ArbiterResult<TaskOutcome> {
        self.done.wait_signal(cancel)?;
        self.take_outcome()
    }

    /// Bounded wait; `Ok(None)` on timeout, handing the handle back.
    pub fn try_wait(
        self,
        cancel: &CancelToken,
        timeout: Duration,
    ) -> ArbiterResult<Result<TaskOutcome, TaskHandle>> {
        if self.done.try_wait_signal(cancel, timeout)? {
            self.take_outcome().map(Ok)
        } else {
            Ok(Err(self))
        }
    }

    fn take_outcome(&self) -> ArbiterResult<TaskOutcome> {
        self.outcome
            .lock()
            .take()
            .ok_or_else(|| ArbiterError::Internal("task outcome already taken".into()))
    }
}

pub trait TaskExecutorExt: TaskExecutor {
    /// Submits `task` and returns a handle completing with its outcome.
    fn submit(&self, cancel: CancelToken, task: Task) -> TaskHandle {
        let done = ReleaseSignal::new();
        let outcome = Arc::new(Mutex::new(None));
        let cleanup: Cleanup = {
            let done = done.clone();
            let outcome = outcome.clone();
            Box::new(move |o| {
                *outcome.lock() = Some(o);
                done.signal();
            })
        };
        self.execute(cancel, task, Some(cleanup));
        TaskHandle { done, outcome }
    }
}

impl<T: TaskExecutor + ?Sized> TaskExecutorExt for T {}
