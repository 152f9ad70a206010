//! AND-composition of two tokens.

use crate::{AccessToken, SharedToken};
use arbiter_core::{
    ArbiterResult, CancelToken, Cleanup, ContextAwareExecutor, ListenerRef, OnceListener,
    OneShotListeners, ReleaseSignal, Task, TaskExecutor,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

struct Countdown {
    remaining: AtomicUsize,
    listeners: OneShotListeners,
    signal: ReleaseSignal,
}

impl Countdown {
    fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.listeners.fire();
            self.signal.signal();
        }
    }
}

/// Released only when both constituents are released. Tasks submitted
/// through its executors pass through both tokens, so they are accepted
/// only while both accept.
pub struct CombinedToken<I1, I2> {
    id: (I1, I2),
    first: SharedToken<I1>,
    second: SharedToken<I2>,
    countdown: Arc<Countdown>,
    refs: [ListenerRef; 2],
}

impl<I1, I2> CombinedToken<I1, I2>
where
    I1: Clone + Send + Sync + 'static,
    I2: Clone + Send + Sync + 'static,
{
    pub fn new(first: SharedToken<I1>, second: SharedToken<I2>) -> Self {
        let countdown = Arc::new(Countdown {
            remaining: AtomicUsize::new(2),
            listeners: OneShotListeners::new(),
            signal: ReleaseSignal::new(),
        });

        let arrive = |weak: Weak<Countdown>| -> OnceListener {
            Box::new(move || {
                if let Some(countdown) = weak.upgrade() {
                    countdown.arrive();
                }
            })
        };
        let refs = [
            first.add_release_listener(arrive(Arc::downgrade(&countdown))),
            second.add_release_listener(arrive(Arc::downgrade(&countdown))),
        ];

        Self {
            id: (first.access_id().clone(), second.access_id().clone()),
            first,
            second,
            countdown,
            refs,
        }
    }
}

impl<I1, I2> CombinedToken<I1, I2> {
    pub fn first(&self) -> &SharedToken<I1> {
        &self.first
    }

    pub fn second(&self) -> &SharedToken<I2> {
        &self.second
    }
}

impl<I1, I2> Drop for CombinedToken<I1, I2> {
    fn drop(&mut self) {
        for r in &self.refs {
            r.unregister();
        }
    }
}

impl<I1, I2> AccessToken<(I1, I2)> for CombinedToken<I1, I2>
where
    I1: Send + Sync + 'static,
    I2: Send + Sync + 'static,
{
    fn access_id(&self) -> &(I1, I2) {
        &self.id
    }

    fn create_executor(&self, executor: Arc<dyn TaskExecutor>) -> Arc<dyn ContextAwareExecutor> {
        let inner: Arc<dyn TaskExecutor> = Arc::new(self.second.create_executor(executor));
        Arc::new(CombinedExecutor {
            outer: self.first.create_executor(inner),
            first: self.first.clone(),
            second: self.second.clone(),
        })
    }

    fn is_executing_in_this(&self) -> bool {
        self.first.is_executing_in_this() && self.second.is_executing_in_this()
    }

    fn add_release_listener(&self, listener: OnceListener) -> ListenerRef {
        self.countdown.listeners.register_or_notify(listener)
    }

    fn is_released(&self) -> bool {
        self.countdown.listeners.is_fired()
    }

    fn release(&self) {
        self.first.release();
        self.second.release();
    }

    fn release_and_cancel(&self) {
        self.first.release_and_cancel();
        self.second.release_and_cancel();
    }

    fn await_release(&self, cancel: &CancelToken) -> ArbiterResult<()> {
        self.countdown.signal.wait_signal(cancel)
    }

    fn try_await_release(&self, cancel: &CancelToken, timeout: Duration) -> ArbiterResult<bool> {
        self.countdown.signal.try_wait_signal(cancel, timeout)
    }
}

impl<I1: fmt::Debug, I2: fmt::Debug> fmt::Debug for CombinedToken<I1, I2> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CombinedToken{{{:?}, {:?}}}", self.id.0, self.id.1)
    }
}

struct CombinedExecutor<I1, I2> {
    outer: Arc<dyn ContextAwareExecutor>,
    first: SharedToken<I1>,
    second: SharedToken<I2>,
}

impl<I1, I2> TaskExecutor for CombinedExecutor<I1, I2>
where
    I1: Send + Sync + 'static,
    I2: Send + Sync + 'static,
{
    fn execute(&self, cancel: CancelToken, task: Task, cleanup: Option<Cleanup>) {
        self.outer.execute(cancel, task, cleanup);
    }
}

impl<I1, I2> ContextAwareExecutor for CombinedExecutor<I1, I2>
where
    I1: Send + Sync + 'static,
    I2: Send + Sync + 'static,
{
    fn is_executing_in_this(&self) -> bool {
        self.first.is_executing_in_this() && self.second.is_executing_in_this()
    }
}
