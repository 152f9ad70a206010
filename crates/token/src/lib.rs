//! Access tokens: live handles for granted (or pending) rights.
//!
//! A token gates task execution through the executors it creates and
//! notifies its release listeners exactly once, when no task is executing
//! and none can be accepted anymore.

pub mod combined;
pub mod generic;
pub mod runtime;
pub mod scheduled;

use arbiter_core::{
    ArbiterResult, CancelToken, ContextAwareExecutor, ListenerRef, OnceListener, TaskExecutor,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use combined::CombinedToken;
pub use generic::GenericToken;
pub use runtime::{released, RayonExecutor, TokioExecutor};
pub use scheduled::ScheduledAccessToken;

pub trait AccessToken<I>: Send + Sync {
    /// Stable for the lifetime of the token.
    fn access_id(&self) -> &I;

    /// Wraps `executor` so that submitted tasks are tracked by this token
    /// and refused once it starts releasing.
    fn create_executor(&self, executor: Arc<dyn TaskExecutor>) -> Arc<dyn ContextAwareExecutor>;

    /// True inside a task submitted through an executor of this token.
    fn is_executing_in_this(&self) -> bool;

    /// Registers a one-shot listener. If the token is already released the
    /// listener runs immediately in the calling thread.
    fn add_release_listener(&self, listener: OnceListener) -> ListenerRef;

    fn is_released(&self) -> bool;

    /// Stops accepting tasks and releases once running tasks finish.
    /// Idempotent.
    fn release(&self);

    /// As [`release`](Self::release), also cancelling running and queued
    /// tasks.
    fn release_and_cancel(&self);

    fn await_release(&self, cancel: &CancelToken) -> ArbiterResult<()>;

    /// `Ok(false)` if `timeout` elapsed first.
    fn try_await_release(&self, cancel: &CancelToken, timeout: Duration) -> ArbiterResult<bool>;
}

/// A client-visible token handle. Identity is the allocation, not the id.
pub type SharedToken<I> = Arc<dyn AccessToken<I>>;

/// Address of the token allocation, ignoring the vtable.
pub fn token_key<I>(token: &SharedToken<I>) -> usize {
    Arc::as_ptr(token) as *const () as usize
}

pub fn same_token<I>(a: &SharedToken<I>, b: &SharedToken<I>) -> bool {
    token_key(a) == token_key(b)
}

// ---------------------------------------------------------------------------
// Token sets
// ---------------------------------------------------------------------------

/// Insertion-ordered set of tokens, deduplicated by identity.
pub struct TokenSet<I> {
    keys: HashSet<usize>,
    tokens: Vec<SharedToken<I>>,
}

impl<I> Default for TokenSet<I> {
    fn default() -> Self {
        Self {
            keys: HashSet::new(),
            tokens: Vec::new(),
        }
    }
}

impl<I> Clone for TokenSet<I> {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            tokens: self.tokens.clone(),
        }
    }
}

impl<I> TokenSet<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the same token was already present.
    pub fn insert(&mut self, token: SharedToken<I>) -> bool {
        if self.keys.insert(token_key(&token)) {
            self.tokens.push(token);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, token: &SharedToken<I>) -> bool {
        self.keys.contains(&token_key(token))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SharedToken<I>> {
        self.tokens.iter()
    }

    pub fn as_slice(&self) -> &[SharedToken<I>] {
        &self.tokens
    }

    pub fn into_vec(self) -> Vec<SharedToken<I>> {
        self.tokens
    }
}

impl<I> FromIterator<SharedToken<I>> for TokenSet<I> {
    fn from_iter<T: IntoIterator<Item = SharedToken<I>>>(iter: T) -> Self {
        let mut set = TokenSet::new();
        for token in iter {
            set.insert(token);
        }
        set
    }
}

impl<'a, I> IntoIterator for &'a TokenSet<I> {
    type Item = &'a SharedToken<I>;
    type IntoIter = std::slice::Iter<'a, SharedToken<I>>;

    fn into_iter(self) -> Self::IntoIter {
        self.tokens.iter()
    }
}

impl<I: fmt::Debug> fmt::Debug for TokenSet<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tokens.iter().map(|t| t.access_id()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A standalone token not tied to any manager.
pub fn create_token<I>(id: I) -> SharedToken<I>
where
    I: Send + Sync + 'static,
{
    Arc::new(GenericToken::new(id))
}

/// AND-composition: released once both tokens are released.
pub fn combine<I1, I2>(first: SharedToken<I1>, second: SharedToken<I2>) -> SharedToken<(I1, I2)>
where
    I1: Clone + Send + Sync + 'static,
    I2: Clone + Send + Sync + 'static,
{
    Arc::new(CombinedToken::new(first, second))
}

pub fn release_tokens<'a, I: 'a>(tokens: impl IntoIterator<Item = &'a SharedToken<I>>) {
    for token in tokens {
        token.release();
    }
}

pub fn release_and_cancel_tokens<'a, I: 'a>(tokens: impl IntoIterator<Item = &'a SharedToken<I>>) {
    for token in tokens {
        token.release_and_cancel();
    }
}
