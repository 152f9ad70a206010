//! Hierarchical access manager.
//!
//! All trie mutation and conflict queries happen under one lock. Events
//! (access changes, right state changes) are queued on a [`TaskScheduler`]
//! while the lock is held and dispatched after it is released, in the
//! order they were queued.

use crate::result::AccessResult;
use crate::tree::{minimize_rights, RightTree, TreeRef};
use arbiter_core::scheduler::ScheduledTask;
use arbiter_core::{
    AccessMode, AccessRequest, AccessState, ArbiterResult, ErrorCollector, ListenerRef,
    ListenerRegistry, Right, RightsSnapshot, TaskScheduler,
};
use arbiter_token::{AccessToken, GenericToken, ScheduledAccessToken, SharedToken, TokenSet};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

/// Notified with the request and `true` when access is granted, `false`
/// when the granted token is released.
pub type AccessChangeListener<I> =
    dyn Fn(&AccessRequest<I>, bool) -> ArbiterResult<()> + Send + Sync;

/// Receives per-right state transitions.
pub trait AccessStateListener: Send + Sync {
    fn on_enter_state(&self, right: &Right, state: AccessState) -> ArbiterResult<()>;
}

impl<F> AccessStateListener for F
where
    F: Fn(&Right, AccessState) -> ArbiterResult<()> + Send + Sync,
{
    fn on_enter_state(&self, right: &Right, state: AccessState) -> ArbiterResult<()> {
        self(right, state)
    }
}

/// Tree sizes, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub read_nodes: usize,
    pub write_nodes: usize,
}

// ---------------------------------------------------------------------------
// Internal tokens
// ---------------------------------------------------------------------------

struct ManagedToken<I> {
    token: GenericToken<I>,
    request: Arc<AccessRequest<I>>,
    refs: Mutex<Vec<(AccessMode, TreeRef)>>,
    /// The handle handed to clients; set before the token enters a tree.
    shared: OnceLock<SharedToken<I>>,
}

impl<I: Clone> ManagedToken<I> {
    fn new(request: Arc<AccessRequest<I>>) -> Self {
        Self {
            token: GenericToken::new(request.id().clone()),
            request,
            refs: Mutex::new(Vec::new()),
            shared: OnceLock::new(),
        }
    }
}

type Entry<I> = Arc<ManagedToken<I>>;

struct Trees<I> {
    read: RightTree<Entry<I>>,
    write: RightTree<Entry<I>>,
}

impl<I> Trees<I> {
    fn tree_mut(&mut self, mode: AccessMode) -> &mut RightTree<Entry<I>> {
        match mode {
            AccessMode::Read => &mut self.read,
            AccessMode::Write => &mut self.write,
        }
    }

    /// Tokens conflicting with the requested rights. Read never conflicts
    /// with read.
    fn blocking(&self, read: &[Right], write: &[Right]) -> Vec<Entry<I>> {
        let mut out = Vec::new();
        for right in write {
            self.read.blocking(right, &mut out);
            self.write.blocking(right, &mut out);
        }
        for right in read {
            self.write.blocking(right, &mut out);
        }
        out
    }

    fn is_available(&self, read: &[Right], write: &[Right]) -> bool {
        !write
            .iter()
            .any(|r| self.read.has_conflict(r) || self.write.has_conflict(r))
            && !read.iter().any(|r| self.write.has_conflict(r))
    }
}

fn unique_shared<I>(entries: Vec<Entry<I>>) -> TokenSet<I> {
    entries
        .into_iter()
        .filter_map(|e| e.shared.get().cloned())
        .collect()
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct ManagerInner<I> {
    trees: Mutex<Trees<I>>,
    events: TaskScheduler,
    change_listeners: ListenerRegistry<AccessChangeListener<I>>,
    state_listener: Option<Arc<dyn AccessStateListener>>,
}

/// Grants read and write access to hierarchical rights.
///
/// Cloning yields another handle to the same manager.
pub struct HierarchicalAccessManager<I> {
    inner: Arc<ManagerInner<I>>,
}

impl<I> Clone for HierarchicalAccessManager<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I> Default for HierarchicalAccessManager<I>
where
    I: Clone + fmt::Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<I> HierarchicalAccessManager<I>
where
    I: Clone + fmt::Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A manager reporting right state transitions to `listener`.
    pub fn with_state_listener(listener: impl AccessStateListener + 'static) -> Self {
        let listener: Arc<dyn AccessStateListener> = Arc::new(listener);
        Self::build(Some(listener))
    }

    fn build(state_listener: Option<Arc<dyn AccessStateListener>>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                trees: Mutex::new(Trees {
                    read: RightTree::new(),
                    write: RightTree::new(),
                }),
                events: TaskScheduler::new(),
                change_listeners: ListenerRegistry::new(),
                state_listener,
            }),
        }
    }

    /// Registers a listener for grants and releases.
    pub fn add_access_change_listener(
        &self,
        listener: impl Fn(&AccessRequest<I>, bool) -> ArbiterResult<()> + Send + Sync + 'static,
    ) -> ListenerRef {
        let listener: Arc<AccessChangeListener<I>> = Arc::new(listener);
        self.inner.change_listeners.register(listener)
    }

    /// Tries to grant `request` immediately.
    ///
    /// Nothing is registered when any held token conflicts; the result then
    /// lists the blockers instead of a token.
    pub fn try_get_access(&self, request: AccessRequest<I>) -> AccessResult<I> {
        let managed = Arc::new(ManagedToken::new(Arc::new(request)));
        let shared: SharedToken<I> = Arc::new(managed.token.clone());
        let _ = managed.shared.set(shared.clone());

        let blocking = {
            let mut trees = self.inner.trees.lock();
            let request = &managed.request;
            let blocking = trees.blocking(request.read_rights(), request.write_rights());
            if blocking.is_empty() {
                self.inner.register(&mut trees, &managed);
            }
            blocking
        };

        if blocking.is_empty() {
            tracing::debug!(access_id = ?managed.request.id(), "access granted");
            self.inner.watch_release(&managed);
            self.inner.dispatch_events();
            AccessResult::granted(shared)
        } else {
            let blocking = unique_shared(blocking);
            tracing::debug!(
                access_id = ?managed.request.id(),
                blockers = ?blocking,
                "access denied"
            );
            AccessResult::denied(blocking)
        }
    }

    /// Reserves the rights of `request` right away and returns a token whose
    /// tasks run once every currently conflicting token has released.
    pub fn get_scheduled_access(&self, request: AccessRequest<I>) -> AccessResult<I> {
        let managed = Arc::new(ManagedToken::new(Arc::new(request)));
        let origin: SharedToken<I> = Arc::new(managed.token.clone());
        let scheduled = ScheduledAccessToken::new_pending(origin);
        let shared: SharedToken<I> = Arc::new(scheduled.clone());
        let _ = managed.shared.set(shared.clone());

        let blocking = {
            let mut trees = self.inner.trees.lock();
            let request = &managed.request;
            let blocking = trees.blocking(request.read_rights(), request.write_rights());
            self.inner.register(&mut trees, &managed);
            blocking
        };

        self.inner.watch_release(&managed);
        self.inner.dispatch_events();

        let blocking = unique_shared(blocking);
        tracing::debug!(
            access_id = ?managed.request.id(),
            blockers = ?blocking,
            "access scheduled"
        );
        // Outside the lock: blockers that already released notify inline
        // and may flush queued tasks.
        if let Err(e) = scheduled.start_waiting(blocking.as_slice()) {
            tracing::error!(error = %e, "scheduled token started twice");
        }
        AccessResult::scheduled(shared, blocking)
    }

    /// Client-visible tokens conflicting with the given rights.
    pub fn get_blocking_tokens(&self, read: &[Right], write: &[Right]) -> TokenSet<I> {
        let blocking = self.inner.trees.lock().blocking(read, write);
        unique_shared(blocking)
    }

    pub fn is_available(&self, read: &[Right], write: &[Right]) -> bool {
        self.inner.trees.lock().is_available(read, write)
    }

    /// Current state of a single right.
    pub fn access_state(&self, right: &Right) -> AccessState {
        let trees = self.inner.trees.lock();
        if trees.write.has_conflict(right) {
            AccessState::Unavailable
        } else if trees.read.has_conflict(right) {
            AccessState::ReadOnly
        } else {
            AccessState::Available
        }
    }

    /// Rights currently registered, per tree.
    pub fn rights(&self) -> RightsSnapshot {
        let trees = self.inner.trees.lock();
        RightsSnapshot {
            read: trees.read.rights(),
            write: trees.write.rights(),
        }
    }

    pub fn stats(&self) -> ManagerStats {
        let trees = self.inner.trees.lock();
        ManagerStats {
            read_nodes: trees.read.node_count(),
            write_nodes: trees.write.node_count(),
        }
    }
}

impl<I> ManagerInner<I>
where
    I: Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Adds the token's rights to both trees. Caller holds the lock.
    fn register(&self, trees: &mut Trees<I>, managed: &Entry<I>) {
        let request = &managed.request;
        let mut refs = Vec::with_capacity(request.read_rights().len() + request.write_rights().len());
        let mut new_read = Vec::new();
        let mut new_write = Vec::new();

        for right in request.read_rights() {
            let (reference, newly) = trees.read.add(right, managed.clone());
            refs.push((AccessMode::Read, reference));
            if newly {
                new_read.push(right.clone());
            }
        }
        for right in request.write_rights() {
            let (reference, newly) = trees.write.add(right, managed.clone());
            refs.push((AccessMode::Write, reference));
            if newly {
                new_write.push(right.clone());
            }
        }
        *managed.refs.lock() = refs;

        if self.state_listener.is_some() {
            new_write.sort();
            new_write.dedup();
            new_read.sort();
            new_read.dedup();
            new_read.retain(|r| new_write.binary_search(r).is_err() && !trees.write.has_right(r));
            self.schedule_state_events(new_write, AccessState::Unavailable);
            self.schedule_state_events(new_read, AccessState::ReadOnly);
        }
        self.schedule_change_event(request, true);
    }

    /// Installs the listener that removes the token's rights on release.
    fn watch_release(self: &Arc<Self>, managed: &Entry<I>) {
        let manager = Arc::downgrade(self);
        let token: Weak<ManagedToken<I>> = Arc::downgrade(managed);
        managed.token.add_release_listener(Box::new(move || {
            if let (Some(manager), Some(token)) = (manager.upgrade(), token.upgrade()) {
                manager.remove_token(&token);
            }
        }));
    }

    fn remove_token(&self, managed: &Entry<I>) {
        let refs = std::mem::take(&mut *managed.refs.lock());
        let request = &managed.request;

        {
            let mut trees = self.trees.lock();
            let mut removed_read = Vec::new();
            let mut removed_write = Vec::new();

            for (mode, reference) in refs {
                if let Some((_, Some(pruned))) = trees.tree_mut(mode).remove(reference) {
                    match mode {
                        AccessMode::Read => removed_read.push(pruned),
                        AccessMode::Write => removed_write.push(pruned),
                    }
                }
            }

            // The root is never pruned, so a released universal right is
            // reported here instead.
            let universal = Right::universal();
            if request.read_rights().iter().any(Right::is_universal)
                && !trees.read.has_conflict(&universal)
            {
                removed_read.push(universal.clone());
            }
            if request.write_rights().iter().any(Right::is_universal)
                && !trees.write.has_conflict(&universal)
            {
                removed_write.push(universal);
            }

            if self.state_listener.is_some() {
                self.schedule_downgrade(&trees, removed_read, removed_write);
            }
            self.schedule_change_event(request, false);
        }

        tracing::debug!(access_id = ?request.id(), "access released");
        self.dispatch_events();
    }

    /// Reports rights whose hold weakened: write to read-only, or to
    /// available. Caller holds the lock.
    fn schedule_downgrade(&self, trees: &Trees<I>, removed_read: Vec<Right>, removed_write: Vec<Right>) {
        let mut to_available = Vec::new();
        let mut to_read_only = Vec::new();

        for right in removed_read {
            if !trees.read.has_conflict(&right) && !trees.write.has_conflict(&right) {
                to_available.push(right);
            }
        }
        for right in removed_write {
            if !trees.write.has_conflict(&right) {
                if trees.read.has_conflict(&right) {
                    to_read_only.push(right);
                } else {
                    to_available.push(right);
                }
            }
        }

        self.schedule_state_events(minimize_rights(to_read_only), AccessState::ReadOnly);
        self.schedule_state_events(minimize_rights(to_available), AccessState::Available);
    }

    fn schedule_state_events(&self, rights: Vec<Right>, state: AccessState) {
        let Some(listener) = &self.state_listener else {
            return;
        };
        self.events.schedule_tasks(rights.into_iter().map(|right| {
            let listener = listener.clone();
            Box::new(move || listener.on_enter_state(&right, state)) as ScheduledTask
        }));
    }

    fn schedule_change_event(&self, request: &Arc<AccessRequest<I>>, acquired: bool) {
        let listeners = self.change_listeners.snapshot();
        if listeners.is_empty() {
            return;
        }
        let request = request.clone();
        self.events.schedule_task(Box::new(move || {
            let mut errors = ErrorCollector::new();
            for listener in listeners {
                errors.run(|| listener(&request, acquired));
            }
            errors.finish()
        }));
    }

    /// Failures have no caller to go to: requests never fail and releases
    /// happen inside listeners. They are logged.
    fn dispatch_events(&self) {
        if let Err(e) = self.events.dispatch_tasks() {
            tracing::warn!(error = %e, "access event listener failed");
        }
    }
}

impl<I> fmt::Display for HierarchicalAccessManager<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trees = self.inner.trees.lock();
        let join = |rights: Vec<Right>| {
            rights
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "HierarchicalAccessManager{{read rights: [{}], write rights: [{}]}}",
            join(trees.read.rights()),
            join(trees.write.rights())
        )
    }
}

impl<I> fmt::Debug for HierarchicalAccessManager<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
