//! Listener registration primitives.
//!
//! - [`ListenerRef`]: handle returned by every registration, with
//!   `is_registered()` / `unregister()`.
//! - [`OneShotListeners`]: `{Pending, Fired}` state machine. Registering
//!   after the event runs the listener synchronously instead of storing it,
//!   so no listener can miss the event.
//! - [`ListenerRegistry`]: plain multi-fire list with snapshot iteration.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A listener invoked at most once.
pub type OnceListener = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// ListenerRef
// ---------------------------------------------------------------------------

type Unregister = Box<dyn FnOnce() + Send>;

/// Handle to a registered listener.
pub struct ListenerRef {
    registered: Arc<AtomicBool>,
    unregister: Mutex<Option<Unregister>>,
}

impl ListenerRef {
    pub fn new(unregister: impl FnOnce() + Send + 'static) -> Self {
        Self::with_flag(Arc::new(AtomicBool::new(true)), unregister)
    }

    /// A handle whose `registered` flag may also be cleared by the owner,
    /// e.g. when a one-shot listener fires.
    fn with_flag(registered: Arc<AtomicBool>, unregister: impl FnOnce() + Send + 'static) -> Self {
        Self {
            registered,
            unregister: Mutex::new(Some(Box::new(unregister))),
        }
    }

    /// A handle for a listener that was never stored (or already ran).
    pub fn unregistered() -> Self {
        Self {
            registered: Arc::new(AtomicBool::new(false)),
            unregister: Mutex::new(None),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Idempotent.
    pub fn unregister(&self) {
        let f = self.unregister.lock().take();
        if let Some(f) = f {
            f();
        }
        self.registered.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ListenerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRef")
            .field("registered", &self.is_registered())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// One-shot
// ---------------------------------------------------------------------------

enum OneShotState {
    Pending {
        next_id: u64,
        listeners: Vec<(u64, Arc<AtomicBool>, OnceListener)>,
    },
    Fired,
}

/// Listeners for an event that happens exactly once.
pub struct OneShotListeners {
    state: Arc<Mutex<OneShotState>>,
}

impl Default for OneShotListeners {
    fn default() -> Self {
        Self::new()
    }
}

impl OneShotListeners {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(OneShotState::Pending {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn is_fired(&self) -> bool {
        matches!(*self.state.lock(), OneShotState::Fired)
    }

    /// Stores `listener`, or runs it in the calling thread if the event has
    /// already fired.
    pub fn register_or_notify(&self, listener: OnceListener) -> ListenerRef {
        let mut state = self.state.lock();
        if let OneShotState::Pending { next_id, listeners } = &mut *state {
            let id = *next_id;
            *next_id += 1;
            let flag = Arc::new(AtomicBool::new(true));
            listeners.push((id, flag.clone(), listener));

            let weak: Weak<Mutex<OneShotState>> = Arc::downgrade(&self.state);
            return ListenerRef::with_flag(flag, move || {
                if let Some(state) = weak.upgrade() {
                    if let OneShotState::Pending { listeners, .. } = &mut *state.lock() {
                        listeners.retain(|(i, _, _)| *i != id);
                    }
                }
            });
        }
        drop(state);

        listener();
        ListenerRef::unregistered()
    }

    /// Moves to `Fired` and runs every pending listener in registration
    /// order. Returns `false` if the event had already fired.
    ///
    /// A panicking listener does not stop the rest; the first panic is
    /// resumed after all listeners ran.
    pub fn fire(&self) -> bool {
        let listeners = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, OneShotState::Fired) {
                OneShotState::Pending { listeners, .. } => listeners,
                OneShotState::Fired => return false,
            }
        };

        let mut first_panic = None;
        for (_, flag, listener) in listeners {
            flag.store(false, Ordering::Release);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(listener)) {
                if first_panic.is_none() {
                    first_panic = Some(payload);
                } else {
                    tracing::warn!("additional one-shot listener panicked");
                }
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Multi-fire registry
// ---------------------------------------------------------------------------

struct RegistryInner<F: ?Sized> {
    next_id: u64,
    listeners: Vec<(u64, Arc<F>)>,
}

/// A list of listeners notified any number of times.
pub struct ListenerRegistry<F: ?Sized> {
    inner: Arc<Mutex<RegistryInner<F>>>,
}

impl<F: ?Sized> Default for ListenerRegistry<F> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> ListenerRegistry<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<F>) -> ListenerRef {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.push((id, listener));
            id
        };
        let weak = Arc::downgrade(&self.inner);
        ListenerRef::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().listeners.retain(|(i, _)| *i != id);
            }
        })
    }

    /// Listeners registered at the time of the call, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.inner
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

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

    #[test]
    fn fires_pending_listeners_once() {
        let (count, make) = counter();
        let l = OneShotListeners::new();
        let r = l.register_or_notify(make());
        assert!(r.is_registered());

        assert!(l.fire());
        assert!(!l.fire());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!r.is_registered());
    }

    #[test]
    fn late_registration_runs_immediately() {
        let (count, make) = counter();
        let l = OneShotListeners::new();
        l.fire();

        let r = l.register_or_notify(make());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!r.is_registered());
    }

    #[test]
    fn unregistered_listener_is_skipped() {
        let (count, make) = counter();
        let l = OneShotListeners::new();
        let r = l.register_or_notify(make());
        r.unregister();
        r.unregister();
        l.fire();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_does_not_starve_siblings() {
        let (count, make) = counter();
        let l = OneShotListeners::new();
        l.register_or_notify(Box::new(|| panic!("first")));
        l.register_or_notify(make());

        let res = panic::catch_unwind(AssertUnwindSafe(|| l.fire()));
        assert!(res.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(l.is_fired());
    }

    #[test]
    fn registry_snapshot_reflects_unregister() {
        let reg: ListenerRegistry<dyn Fn() -> u32 + Send + Sync> = ListenerRegistry::new();
        let a = reg.register(Arc::new(|| 1));
        let _b = reg.register(Arc::new(|| 2));
        assert_eq!(reg.snapshot().iter().map(|f| f()).collect::<Vec<_>>(), vec![1, 2]);

        a.unregister();
        assert_eq!(reg.snapshot().iter().map(|f| f()).collect::<Vec<_>>(), vec![2]);
        assert_eq!(reg.len(), 1);
    }
}
