//! Cooperative cancellation.
//!
//! A [`CancellationSource`] owns the ability to cancel; any number of
//! [`CancelToken`] clones observe it. Cancellation is a one-shot event, so
//! listeners added after the fact run immediately.

use crate::error::{ArbiterError, ArbiterResult};
use crate::listener::{ListenerRef, OnceListener, OneShotListeners};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct CancelState {
    cancelled: AtomicBool,
    listeners: OneShotListeners,
}

impl CancelState {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            listeners: OneShotListeners::new(),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.listeners.fire();
    }
}

/// Read side of a cancellation source. Cheap to clone.
#[derive(Clone)]
pub struct CancelToken {
    state: Option<Arc<CancelState>>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn uncancelable() -> Self {
        Self { state: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.cancelled.load(Ordering::Acquire))
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> ArbiterResult<()> {
        if self.is_cancelled() {
            Err(ArbiterError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs `listener` on cancellation, or immediately if already cancelled.
    /// Never runs for [`uncancelable`](Self::uncancelable) tokens.
    pub fn add_listener(&self, listener: OnceListener) -> ListenerRef {
        match &self.state {
            Some(state) => state.listeners.register_or_notify(listener),
            None => ListenerRef::unregistered(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::uncancelable()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelable", &self.state.is_some())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Write side: requests cancellation of every derived token.
pub struct CancellationSource {
    state: Arc<CancelState>,
    parent_ref: Mutex<Option<ListenerRef>>,
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState::new()),
            parent_ref: Mutex::new(None),
        }
    }

    /// A source that is also cancelled when `parent` is. Call
    /// [`detach`](Self::detach) once the link is no longer needed.
    pub fn child_of(parent: &CancelToken) -> Self {
        let source = Self::new();
        let weak = Arc::downgrade(&source.state);
        let link = parent.add_listener(Box::new(move || {
            if let Some(state) = weak.upgrade() {
                state.cancel();
            }
        }));
        *source.parent_ref.lock() = Some(link);
        source
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: Some(self.state.clone()),
        }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Unlinks from the parent token, if any.
    pub fn detach(&self) {
        let link = self.parent_ref.lock().take();
        if let Some(link) = link {
            link.unregister();
        }
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
