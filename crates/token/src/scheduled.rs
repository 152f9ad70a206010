//! Token whose tasks wait for a fixed set of blocking tokens.
//!
//! Tasks submitted before every blocker has released are queued in one
//! FIFO shared by all executors of the token. The last blocker to release
//! flushes the queue and flips a permanent submit-now flag, after which
//! submissions go straight to the wrapped token.
//!
//! Lock order: the queue lock is never held while calling into another
//! token or executor.

use crate::{AccessToken, GenericToken, SharedToken};
use arbiter_core::{
    ArbiterError, ArbiterResult, CancelToken, Cleanup, ContextAwareExecutor, ListenerRef,
    OnceListener, Task, TaskExecutor, TaskOutcome,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

struct QueuedTask {
    id: u64,
    executor: Arc<dyn ContextAwareExecutor>,
    cancel: CancelToken,
    task: Task,
    cleanup: Option<Cleanup>,
    cancel_ref: Option<ListenerRef>,
}

impl QueuedTask {
    fn skip(self) {
        if let Some(r) = &self.cancel_ref {
            r.unregister();
        }
        if let Some(cleanup) = self.cleanup {
            cleanup(TaskOutcome::cancelled());
        }
    }
}

#[derive(Default)]
struct Queue {
    tasks: VecDeque<QueuedTask>,
    next_id: u64,
    submit_now: bool,
    flushing: bool,
    shutting_down: bool,
}

struct ScheduledInner<I> {
    origin: SharedToken<I>,
    wrapped: GenericToken<I>,
    started: AtomicBool,
    remaining: AtomicUsize,
    queue: Mutex<Queue>,
}

impl<I: Send + Sync + 'static> ScheduledInner<I> {
    fn blocker_released(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.flush();
        }
    }

    fn flush(&self) {
        loop {
            let batch: Vec<QueuedTask> = {
                let mut q = self.queue.lock();
                if q.tasks.is_empty() {
                    q.submit_now = true;
                    q.flushing = false;
                    let release = q.shutting_down;
                    drop(q);
                    if release {
                        self.wrapped.release();
                    }
                    return;
                }
                q.flushing = true;
                q.tasks.drain(..).collect()
            };

            tracing::trace!(tasks = batch.len(), "flushing scheduled tasks");
            for queued in batch {
                if let Some(r) = &queued.cancel_ref {
                    r.unregister();
                }
                queued
                    .executor
                    .execute(queued.cancel, queued.task, queued.cleanup);
            }
        }
    }

    fn cancel_queued(&self, id: u64) {
        let removed = {
            let mut q = self.queue.lock();
            q.tasks
                .iter()
                .position(|t| t.id == id)
                .and_then(|pos| q.tasks.remove(pos))
        };
        if let Some(queued) = removed {
            queued.skip();
        }
    }

    fn release(&self) {
        let release_now = {
            let mut q = self.queue.lock();
            q.shutting_down = true;
            q.tasks.is_empty() && !q.flushing
        };
        if release_now {
            self.wrapped.release();
        }
    }

    fn release_and_cancel(&self) {
        let dropped: Vec<QueuedTask> = {
            let mut q = self.queue.lock();
            q.shutting_down = true;
            q.tasks.drain(..).collect()
        };
        for queued in dropped {
            queued.skip();
        }
        self.wrapped.release_and_cancel();
    }
}

/// A token granted in scheduled mode.
///
/// Its rights are reserved from creation on; only task execution is
/// deferred. Releasing it releases the manager's underlying token once
/// every accepted task completed.
pub struct ScheduledAccessToken<I> {
    inner: Arc<ScheduledInner<I>>,
}

impl<I> Clone for ScheduledAccessToken<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I> ScheduledAccessToken<I>
where
    I: Clone + Send + Sync + 'static,
{
    /// Creates a token that queues tasks until [`start_waiting`] is called
    /// and its blockers release.
    ///
    /// [`start_waiting`]: Self::start_waiting
    pub fn new_pending(origin: SharedToken<I>) -> Self {
        let wrapped = GenericToken::new(origin.access_id().clone());
        let target = origin.clone();
        wrapped.add_release_listener(Box::new(move || target.release()));

        Self {
            inner: Arc::new(ScheduledInner {
                origin,
                wrapped,
                started: AtomicBool::new(false),
                remaining: AtomicUsize::new(0),
                queue: Mutex::new(Queue::default()),
            }),
        }
    }

    pub fn new(origin: SharedToken<I>, blocking: &[SharedToken<I>]) -> Self {
        let token = Self::new_pending(origin);
        // Cannot fail on a fresh token.
        let _ = token.start_waiting(blocking);
        token
    }

    /// Starts listening for the blockers' release. With no blockers the
    /// queue is flushed synchronously.
    pub fn start_waiting(&self, blocking: &[SharedToken<I>]) -> ArbiterResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ArbiterError::IllegalState(
                "scheduled token is already waiting".into(),
            ));
        }

        // One extra count held until every listener is registered, so a
        // blocker releasing mid-loop cannot flush early.
        self.inner
            .remaining
            .store(blocking.len() + 1, Ordering::SeqCst);
        for blocker in blocking {
            let weak: Weak<ScheduledInner<I>> = Arc::downgrade(&self.inner);
            blocker.add_release_listener(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.blocker_released();
                }
            }));
        }
        self.inner.blocker_released();
        Ok(())
    }
}

impl<I> ScheduledAccessToken<I> {
    /// True once all blockers released and the queue was flushed.
    pub fn is_unblocked(&self) -> bool {
        self.inner.queue.lock().submit_now
    }

    /// Tasks still waiting for the blockers.
    pub fn queued_tasks(&self) -> usize {
        self.inner.queue.lock().tasks.len()
    }
}

impl<I: Send + Sync + 'static> AccessToken<I> for ScheduledAccessToken<I> {
    fn access_id(&self) -> &I {
        self.inner.origin.access_id()
    }

    fn create_executor(&self, executor: Arc<dyn TaskExecutor>) -> Arc<dyn ContextAwareExecutor> {
        Arc::new(ScheduledExecutor {
            inner: self.inner.clone(),
            executor: self.inner.wrapped.create_executor(executor),
        })
    }

    fn is_executing_in_this(&self) -> bool {
        self.inner.wrapped.is_executing_in_this()
    }

    fn add_release_listener(&self, listener: OnceListener) -> ListenerRef {
        self.inner.origin.add_release_listener(listener)
    }

    fn is_released(&self) -> bool {
        self.inner.origin.is_released()
    }

    /// Queued tasks still run once the blockers release.
    fn release(&self) {
        self.inner.release();
    }

    fn release_and_cancel(&self) {
        self.inner.release_and_cancel();
    }

    fn await_release(&self, cancel: &CancelToken) -> ArbiterResult<()> {
        self.inner.origin.await_release(cancel)
    }

    fn try_await_release(&self, cancel: &CancelToken, timeout: Duration) -> ArbiterResult<bool> {
        self.inner.origin.try_await_release(cancel, timeout)
    }
}

impl<I: fmt::Debug> fmt::Debug for ScheduledAccessToken<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScheduledAccessToken{{{:?}}}", self.inner.origin.access_id())
    }
}

struct ScheduledExecutor<I> {
    inner: Arc<ScheduledInner<I>>,
    executor: Arc<dyn ContextAwareExecutor>,
}

enum Route {
    Direct(CancelToken, Task, Option<Cleanup>),
    Reject(Option<Cleanup>),
    Queued(u64, CancelToken),
}

impl<I: Send + Sync + 'static> TaskExecutor for ScheduledExecutor<I> {
    fn execute(&self, cancel: CancelToken, task: Task, cleanup: Option<Cleanup>) {
        let route = {
            let mut q = self.inner.queue.lock();
            if q.shutting_down {
                Route::Reject(cleanup)
            } else if q.submit_now {
                Route::Direct(cancel, task, cleanup)
            } else {
                let id = q.next_id;
                q.next_id += 1;
                q.tasks.push_back(QueuedTask {
                    id,
                    executor: self.executor.clone(),
                    cancel: cancel.clone(),
                    task,
                    cleanup,
                    cancel_ref: None,
                });
                Route::Queued(id, cancel)
            }
        };

        match route {
            Route::Direct(cancel, task, cleanup) => self.executor.execute(cancel, task, cleanup),
            Route::Reject(cleanup) => {
                if let Some(cleanup) = cleanup {
                    cleanup(TaskOutcome::cancelled());
                }
            }
            Route::Queued(id, cancel) => {
                // Registered outside the lock: an already cancelled token
                // runs the listener immediately.
                let weak = Arc::downgrade(&self.inner);
                let registration = cancel.add_listener(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.cancel_queued(id);
                    }
                }));
                let stale = {
                    let mut q = self.inner.queue.lock();
                    match q.tasks.iter_mut().find(|t| t.id == id) {
                        Some(queued) => {
                            queued.cancel_ref = Some(registration);
                            None
                        }
                        None => Some(registration),
                    }
                };
                if let Some(registration) = stale {
                    registration.unregister();
                }
            }
        }
    }
}

impl<I: Send + Sync + 'static> ContextAwareExecutor for ScheduledExecutor<I> {
    fn is_executing_in_this(&self) -> bool {
        self.executor.is_executing_in_this()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_token;
    use arbiter_core::{CancellationSource, SyncExecutor};

    type Log = Arc<Mutex<Vec<String>>>;

    fn logging_task(log: &Log, entry: &str) -> Task {
        let log = log.clone();
        let entry = entry.to_string();
        Box::new(move |_| {
            log.lock().push(entry);
            Ok(())
        })
    }

    fn outcome_slot() -> (Arc<Mutex<Option<TaskOutcome>>>, Option<Cleanup>) {
        let slot = Arc::new(Mutex::new(None));
        let s = slot.clone();
        (slot, Some(Box::new(move |o| *s.lock() = Some(o))))
    }

    #[test]
    fn without_blockers_runs_immediately() {
        let token = ScheduledAccessToken::new(create_token(1u32), &[]);
        assert!(token.is_unblocked());

        let log: Log = Arc::default();
        let exec = token.create_executor(Arc::new(SyncExecutor));
        exec.execute(CancelToken::uncancelable(), logging_task(&log, "a"), None);
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn queues_until_every_blocker_released() {
        let log: Log = Arc::default();
        let b1 = create_token(1u32);
        let b2 = create_token(2u32);
        let l = log.clone();
        b2.add_release_listener(Box::new(move || l.lock().push("b2 released".into())));

        let token = ScheduledAccessToken::new(create_token(3u32), &[b1.clone(), b2.clone()]);
        let exec = token.create_executor(Arc::new(SyncExecutor));
        let other = token.create_executor(Arc::new(SyncExecutor));
        exec.execute(CancelToken::uncancelable(), logging_task(&log, "t1"), None);
        other.execute(CancelToken::uncancelable(), logging_task(&log, "t2"), None);
        exec.execute(CancelToken::uncancelable(), logging_task(&log, "t3"), None);
        assert_eq!(token.queued_tasks(), 3);

        b1.release();
        assert!(log.lock().is_empty());
        b2.release();
        exec.execute(CancelToken::uncancelable(), logging_task(&log, "t4"), None);

        assert_eq!(*log.lock(), vec!["b2 released", "t1", "t2", "t3", "t4"]);
        assert!(token.is_unblocked());
    }

    #[test]
    fn graceful_release_runs_queued_tasks_first() {
        let blocker = create_token(1u32);
        let origin = create_token(2u32);
        let token = ScheduledAccessToken::new(origin.clone(), &[blocker.clone()]);
        let exec = token.create_executor(Arc::new(SyncExecutor));
        let log: Log = Arc::default();

        exec.execute(CancelToken::uncancelable(), logging_task(&log, "queued"), None);
        token.release();
        assert!(!origin.is_released());

        let (late, cleanup) = outcome_slot();
        exec.execute(CancelToken::uncancelable(), logging_task(&log, "late"), cleanup);
        assert!(late.lock().as_ref().is_some_and(|o| o.cancelled));

        blocker.release();
        assert_eq!(*log.lock(), vec!["queued"]);
        assert!(origin.is_released());
        assert!(token.is_released());
    }

    #[test]
    fn release_and_cancel_skips_queued_tasks() {
        let blocker = create_token(1u32);
        let origin = create_token(2u32);
        let token = ScheduledAccessToken::new(origin.clone(), &[blocker.clone()]);
        let exec = token.create_executor(Arc::new(SyncExecutor));

        let (seen, cleanup) = outcome_slot();
        exec.execute(
            CancelToken::uncancelable(),
            Box::new(|_| panic!("must not run")),
            cleanup,
        );
        token.release_and_cancel();

        assert!(seen.lock().as_ref().is_some_and(|o| o.cancelled));
        assert!(origin.is_released());
        assert_eq!(token.queued_tasks(), 0);
    }

    #[test]
    fn cancelling_a_queued_task_runs_its_cleanup_once() {
        let blocker = create_token(1u32);
        let token = ScheduledAccessToken::new(create_token(2u32), &[blocker.clone()]);
        let exec = token.create_executor(Arc::new(SyncExecutor));

        let source = CancellationSource::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        exec.execute(
            source.token(),
            Box::new(|_| panic!("must not run")),
            Some(Box::new(move |o| {
                assert!(o.cancelled);
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );
        source.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(token.queued_tasks(), 0);

        blocker.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_waiting_twice_is_illegal() {
        let token = ScheduledAccessToken::new_pending(create_token(1u32));
        assert!(!token.is_unblocked());
        token.start_waiting(&[]).unwrap();
        assert!(token.is_unblocked());
        assert!(matches!(
            token.start_waiting(&[]),
            Err(ArbiterError::IllegalState(_))
        ));
    }
}
