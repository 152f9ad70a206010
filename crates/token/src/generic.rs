//! Independent access token.
//!
//! Release protocol, in terms of two atomic counters:
//!
//! - `pending`: tasks accepted by an executor whose cleanup has not run.
//!   Submission increments *before* checking the release state; cleanup
//!   decrements *before* re-checking it. With this ordering a task can never
//!   be accepted after `release()` has observed zero pending tasks.
//! - `running`: task bodies currently executing. Used instead of `pending`
//!   after `release_and_cancel()`, since cancelled queued tasks will never
//!   run their bodies anyway.
//!
//! The `Releasing -> Released` transition is a single CAS, so listeners
//! fire exactly once no matter how many threads race to finish.

use crate::AccessToken;
use arbiter_core::executor::{noop_task, Cleanup, Task};
use arbiter_core::{
    ArbiterError, ArbiterResult, CancelToken, CancellationSource, ContextAwareExecutor,
    ListenerRef, OnceListener, OneShotListeners, ReleaseSignal, TaskExecutor, TaskOutcome,
};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ACTIVE: u8 = 0;
const RELEASING: u8 = 1;
const RELEASED: u8 = 2;

thread_local! {
    /// Tokens whose tasks are executing on this thread, innermost last.
    static EXECUTING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct ContextGuard(usize);

impl ContextGuard {
    fn enter(key: usize) -> Self {
        EXECUTING.with(|stack| stack.borrow_mut().push(key));
        ContextGuard(key)
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        EXECUTING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|k| *k == self.0) {
                stack.remove(pos);
            }
        });
    }
}

pub(crate) struct TokenState<I> {
    id: I,
    state: AtomicU8,
    terminating: AtomicBool,
    pending: AtomicUsize,
    running: AtomicUsize,
    next_controller: AtomicU64,
    controllers: Mutex<HashMap<u64, Arc<CancellationSource>>>,
    listeners: OneShotListeners,
    signal: ReleaseSignal,
}

impl<I> TokenState<I> {
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    fn is_accepting(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ACTIVE
    }

    fn is_released(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RELEASED
    }

    fn is_executing_in_this(&self) -> bool {
        let key = self.key();
        EXECUTING.with(|stack| stack.borrow().contains(&key))
    }

    fn release(&self) {
        let _ = self
            .state
            .compare_exchange(ACTIVE, RELEASING, Ordering::SeqCst, Ordering::SeqCst);
        self.check_released();
    }

    fn release_and_cancel(&self) {
        self.terminating.store(true, Ordering::SeqCst);
        self.release();

        let to_cancel: Vec<_> = self.controllers.lock().drain().map(|(_, c)| c).collect();
        for controller in to_cancel {
            controller.cancel();
        }
    }

    fn check_released(&self) {
        if self.state.load(Ordering::SeqCst) != RELEASING {
            return;
        }
        let idle = if self.terminating.load(Ordering::SeqCst) {
            self.running.load(Ordering::SeqCst) == 0
        } else {
            self.pending.load(Ordering::SeqCst) == 0
        };
        if idle
            && self
                .state
                .compare_exchange(RELEASING, RELEASED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.on_released();
        }
    }

    /// Listeners run before the signal so that a waiter observing the
    /// release also observes every listener's side effects.
    fn on_released(&self) {
        let fired = panic::catch_unwind(AssertUnwindSafe(|| self.listeners.fire()));
        self.signal.signal();
        if let Err(payload) = fired {
            panic::resume_unwind(payload);
        }
    }

    fn finish_pending(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.check_released();
    }

    fn add_controller(&self, controller: Arc<CancellationSource>) -> u64 {
        let id = self.next_controller.fetch_add(1, Ordering::Relaxed);
        self.controllers.lock().insert(id, controller);
        id
    }

    fn remove_controller(&self, id: u64) {
        self.controllers.lock().remove(&id);
    }

    fn run_task(&self, cancel: &CancelToken, task: Task) -> ArbiterResult<()> {
        self.running.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() || self.terminating.load(Ordering::SeqCst) {
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.check_released();
            return Err(ArbiterError::Cancelled);
        }

        let _running = RunningGuard(self);
        let _context = ContextGuard::enter(self.key());
        task(cancel)
    }
}

/// Decrements `running` even when the task body panics.
struct RunningGuard<'a, I>(&'a TokenState<I>);

impl<I> Drop for RunningGuard<'_, I> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
        self.0.check_released();
    }
}

/// A token not tied to any manager. Clones share state.
pub struct GenericToken<I> {
    state: Arc<TokenState<I>>,
}

impl<I> Clone for GenericToken<I> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<I> GenericToken<I> {
    pub fn new(id: I) -> Self {
        Self {
            state: Arc::new(TokenState {
                id,
                state: AtomicU8::new(ACTIVE),
                terminating: AtomicBool::new(false),
                pending: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                next_controller: AtomicU64::new(0),
                controllers: Mutex::new(HashMap::new()),
                listeners: OneShotListeners::new(),
                signal: ReleaseSignal::new(),
            }),
        }
    }

    /// True between `release()` and the final release notification.
    pub fn is_releasing(&self) -> bool {
        self.state.state.load(Ordering::SeqCst) == RELEASING
    }

    /// Accepted tasks whose cleanup has not run yet.
    pub fn pending_tasks(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Task bodies executing right now.
    pub fn running_tasks(&self) -> usize {
        self.state.running.load(Ordering::SeqCst)
    }
}

impl<I: Send + Sync + 'static> AccessToken<I> for GenericToken<I> {
    fn access_id(&self) -> &I {
        &self.state.id
    }

    fn create_executor(&self, executor: Arc<dyn TaskExecutor>) -> Arc<dyn ContextAwareExecutor> {
        Arc::new(TokenExecutor {
            token: self.state.clone(),
            executor,
        })
    }

    fn is_executing_in_this(&self) -> bool {
        self.state.is_executing_in_this()
    }

    fn add_release_listener(&self, listener: OnceListener) -> ListenerRef {
        self.state.listeners.register_or_notify(listener)
    }

    fn is_released(&self) -> bool {
        self.state.is_released()
    }

    fn release(&self) {
        self.state.release();
    }

    fn release_and_cancel(&self) {
        self.state.release_and_cancel();
    }

    fn await_release(&self, cancel: &CancelToken) -> ArbiterResult<()> {
        self.state.signal.wait_signal(cancel)
    }

    fn try_await_release(&self, cancel: &CancelToken, timeout: Duration) -> ArbiterResult<bool> {
        self.state.signal.try_wait_signal(cancel, timeout)
    }
}

impl<I: fmt::Debug> fmt::Debug for GenericToken<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken{{{:?}}}", self.state.id)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

struct TokenExecutor<I> {
    token: Arc<TokenState<I>>,
    executor: Arc<dyn TaskExecutor>,
}

impl<I: Send + Sync + 'static> TokenExecutor<I> {
    /// Delivers only the cleanup, reporting cancellation.
    fn reject(&self, cleanup: Option<Cleanup>) {
        if let Some(cleanup) = cleanup {
            self.executor.execute(
                CancelToken::uncancelable(),
                noop_task(),
                Some(Box::new(move |_| cleanup(TaskOutcome::cancelled()))),
            );
        }
    }
}

impl<I: Send + Sync + 'static> TaskExecutor for TokenExecutor<I> {
    fn execute(&self, cancel: CancelToken, task: Task, cleanup: Option<Cleanup>) {
        let token = &self.token;

        // Increment first, then check: see the module docs.
        token.pending.fetch_add(1, Ordering::SeqCst);
        if !token.is_accepting() {
            token.finish_pending();
            self.reject(cleanup);
            return;
        }

        let controller = Arc::new(CancellationSource::child_of(&cancel));
        let controller_id = token.add_controller(controller.clone());
        if token.terminating.load(Ordering::SeqCst) {
            // Raced with release_and_cancel() draining the controllers.
            controller.cancel();
        }

        let task_token = token.clone();
        let wrapped_task: Task = Box::new(move |cancel| task_token.run_task(cancel, task));

        let cleanup_token = token.clone();
        let cleanup_controller = controller.clone();
        let wrapped_cleanup: Cleanup = Box::new(move |outcome| {
            cleanup_token.remove_controller(controller_id);
            cleanup_controller.detach();
            cleanup_token.finish_pending();
            if let Some(cleanup) = cleanup {
                cleanup(outcome);
            }
        });

        self.executor
            .execute(controller.token(), wrapped_task, Some(wrapped_cleanup));
    }
}

impl<I: Send + Sync + 'static> ContextAwareExecutor for TokenExecutor<I> {
    fn is_executing_in_this(&self) -> bool {
        self.token.is_executing_in_this()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::executor::run_task;
    use arbiter_core::SyncExecutor;
    use std::collections::VecDeque;

    /// Queues tasks until `run_all` is called.
    #[derive(Default)]
    struct ManualExecutor {
        queue: Mutex<VecDeque<(CancelToken, Task, Option<Cleanup>)>>,
    }

    impl ManualExecutor {
        fn run_all(&self) {
            loop {
                let next = self.queue.lock().pop_front();
                match next {
                    Some((cancel, task, cleanup)) => run_task(&cancel, task, cleanup),
                    None => break,
                }
            }
        }
    }

    impl TaskExecutor for ManualExecutor {
        fn execute(&self, cancel: CancelToken, task: Task, cleanup: Option<Cleanup>) {
            self.queue.lock().push_back((cancel, task, cleanup));
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> OnceListener) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            let c = c.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    fn outcomes() -> (Arc<Mutex<Vec<TaskOutcome>>>, impl Fn() -> Option<Cleanup>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        (seen, move || {
            let s = s.clone();
            Some(Box::new(move |o| s.lock().push(o)) as Cleanup)
        })
    }

    #[test]
    fn idle_release_fires_synchronously_once() {
        let token = GenericToken::new("t");
        let (count, listener) = counter();
        token.add_release_listener(listener());

        token.release();
        token.release();
        token.release_and_cancel();
        assert!(token.is_released());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(token.await_release(&CancelToken::uncancelable()).is_ok());
    }

    #[test]
    fn listener_added_after_release_runs_immediately() {
        let token = GenericToken::new(1);
        token.release();
        let (count, listener) = counter();
        let r = token.add_release_listener(listener());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!r.is_registered());
    }

    #[test]
    fn release_waits_for_pending_tasks() {
        let token = GenericToken::new(1);
        let manual = Arc::new(ManualExecutor::default());
        let exec = token.create_executor(manual.clone());
        let (seen, cleanup) = outcomes();

        exec.execute(CancelToken::uncancelable(), Box::new(|_| Ok(())), cleanup());
        assert_eq!(token.pending_tasks(), 1);

        token.release();
        assert!(token.is_releasing());
        assert!(!token.is_released());

        manual.run_all();
        assert!(token.is_released());
        assert!(seen.lock()[0].is_success());
    }

    #[test]
    fn submissions_after_release_only_run_cleanup() {
        let token = GenericToken::new(1);
        let exec = token.create_executor(Arc::new(SyncExecutor));
        token.release();

        let (seen, cleanup) = outcomes();
        exec.execute(
            CancelToken::uncancelable(),
            Box::new(|_| panic!("must not run")),
            cleanup(),
        );
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].cancelled);
        assert_eq!(token.pending_tasks(), 0);
    }

    #[test]
    fn release_and_cancel_skips_queued_tasks() {
        let token = GenericToken::new(1);
        let manual = Arc::new(ManualExecutor::default());
        let exec = token.create_executor(manual.clone());
        let (seen, cleanup) = outcomes();

        exec.execute(
            CancelToken::uncancelable(),
            Box::new(|_| panic!("must not run")),
            cleanup(),
        );
        token.release_and_cancel();
        // Nothing is running, so release does not wait for the queue.
        assert!(token.is_released());

        manual.run_all();
        assert!(seen.lock()[0].cancelled);
    }

    #[test]
    fn running_task_observes_cancel_and_delays_release() {
        let token = GenericToken::new(1);
        let exec = token.create_executor(Arc::new(SyncExecutor));
        let inner = token.clone();
        let (seen, cleanup) = outcomes();

        exec.execute(
            CancelToken::uncancelable(),
            Box::new(move |cancel| {
                inner.release_and_cancel();
                assert!(cancel.is_cancelled());
                // Still executing, so not yet released.
                assert!(!inner.is_released());
                cancel.check()
            }),
            cleanup(),
        );
        assert!(token.is_released());
        assert!(seen.lock()[0].cancelled);
    }

    #[test]
    fn tracks_execution_context() {
        let token = GenericToken::new(1);
        let other = GenericToken::new(2);
        let exec = token.create_executor(Arc::new(SyncExecutor));

        let t = token.clone();
        let o = other.clone();
        let observed = Arc::new(AtomicBool::new(false));
        let obs = observed.clone();
        exec.execute(
            CancelToken::uncancelable(),
            Box::new(move |_| {
                obs.store(t.is_executing_in_this() && !o.is_executing_in_this(), Ordering::SeqCst);
                Ok(())
            }),
            None,
        );
        assert!(observed.load(Ordering::SeqCst));
        assert!(!token.is_executing_in_this());
    }

    #[test]
    fn panicking_task_still_completes_bookkeeping() {
        let token = GenericToken::new(1);
        let exec = token.create_executor(Arc::new(SyncExecutor));
        let (seen, cleanup) = outcomes();

        exec.execute(
            CancelToken::uncancelable(),
            Box::new(|_| panic!("boom")),
            cleanup(),
        );
        assert_eq!(token.running_tasks(), 0);
        assert_eq!(token.pending_tasks(), 0);
        assert!(matches!(seen.lock()[0].error, Some(ArbiterError::Task(_))));

        token.release();
        assert!(token.is_released());
    }

    #[test]
    fn await_release_is_cancellable() {
        let token = GenericToken::new(1);
        let exec = token.create_executor(Arc::new(ManualExecutor::default()));
        exec.execute(CancelToken::uncancelable(), noop_task(), None);
        token.release();

        let source = CancellationSource::new();
        source.cancel();
        let res = token.await_release(&source.token());
        assert!(matches!(res, Err(ArbiterError::Cancelled)));
        let timed = token
            .try_await_release(&CancelToken::uncancelable(), Duration::from_millis(5))
            .unwrap();
        assert!(!timed);
    }
}
