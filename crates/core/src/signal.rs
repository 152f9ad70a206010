//! Single-fire completion signal with cancellable blocking waits.

use crate::cancel::CancelToken;
use crate::error::{ArbiterError, ArbiterResult};
use crate::listener::ListenerRef;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct SignalInner {
    signaled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl SignalInner {
    fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

/// A latch that goes from unsignaled to signaled exactly once.
///
/// Clones share state: any clone may signal, any number of threads may
/// wait.
#[derive(Clone)]
pub struct ReleaseSignal {
    inner: Arc<SignalInner>,
}

impl Default for ReleaseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                signaled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Idempotent. Wakes every waiter.
    pub fn signal(&self) {
        if !self.inner.signaled.swap(true, Ordering::AcqRel) {
            self.inner.wake_all();
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.inner.signaled.load(Ordering::Acquire)
    }

    /// Blocks until signaled. Fails with `Cancelled` if `cancel` is
    /// cancelled first; an already-signaled latch never reports cancel.
    pub fn wait_signal(&self, cancel: &CancelToken) -> ArbiterResult<()> {
        if self.is_signaled() {
            return Ok(());
        }

        let wakeup = self.wake_on_cancel(cancel);
        let result = {
            let mut guard = self.inner.lock.lock();
            loop {
                if self.is_signaled() {
                    break Ok(());
                }
                if cancel.is_cancelled() {
                    break Err(ArbiterError::Cancelled);
                }
                self.inner.cond.wait(&mut guard);
            }
        };
        wakeup.unregister();
        result
    }

    /// As [`wait_signal`](Self::wait_signal), giving up after `timeout`.
    /// Returns `Ok(false)` on timeout.
    pub fn try_wait_signal(&self, cancel: &CancelToken, timeout: Duration) -> ArbiterResult<bool> {
        if self.is_signaled() {
            return Ok(true);
        }

        let deadline = Instant::now().checked_add(timeout);
        let wakeup = self.wake_on_cancel(cancel);
        let result = {
            let mut guard = self.inner.lock.lock();
            loop {
                if self.is_signaled() {
                    break Ok(true);
                }
                if cancel.is_cancelled() {
                    break Err(ArbiterError::Cancelled);
                }
                match deadline {
                    Some(deadline) => {
                        if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                            if self.is_signaled() {
                                break Ok(true);
                            }
                            if cancel.is_cancelled() {
                                break Err(ArbiterError::Cancelled);
                            }
                            break Ok(false);
                        }
                    }
                    // Overflowing deadline: effectively unbounded.
                    None => self.inner.cond.wait(&mut guard),
                }
            }
        };
        wakeup.unregister();
        result
    }

    fn wake_on_cancel(&self, cancel: &CancelToken) -> ListenerRef {
        let weak = Arc::downgrade(&self.inner);
        cancel.add_listener(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.wake_all();
            }
        }))
    }
}

impl std::fmt::Debug for ReleaseSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseSignal")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
