//! Right-group availability tracking.
//!
//! Groups are indexed in their own right trie, under every read and write
//! right they mention. On each manager access change only the groups whose
//! rights conflict with the changed ones (ancestors and descendants, the
//! same walk as the conflict tree) are re-evaluated.
//!
//! The group index has its own lock, never held while calling the manager
//! or a group action.

use crate::manager::HierarchicalAccessManager;
use crate::tree::{RightTree, TreeRef};
use arbiter_core::{AccessRequest, ArbiterResult, ErrorCollector, ListenerRef, Right};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Called with `true` when a group's rights become available, `false` when
/// they become unavailable.
pub type GroupAction = Arc<dyn Fn(bool) -> ArbiterResult<()> + Send + Sync>;

const NEVER_NOTIFIED: u8 = 0;
const AVAILABLE: u8 = 1;
const UNAVAILABLE: u8 = 2;

struct RightGroup {
    read: Vec<Right>,
    write: Vec<Right>,
    action: GroupAction,
    last_state: AtomicU8,
    /// Edge-triggered: only report actual changes.
    lazy: bool,
    enabled: AtomicBool,
}

impl RightGroup {
    fn update<I>(&self, manager: &HierarchicalAccessManager<I>) -> ArbiterResult<()>
    where
        I: Clone + fmt::Debug + Send + Sync + 'static,
    {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let available = manager.is_available(&self.read, &self.write);
        let next = if available { AVAILABLE } else { UNAVAILABLE };
        let prev = self.last_state.swap(next, Ordering::AcqRel);
        if prev != next || !self.lazy {
            (self.action)(available)
        } else {
            Ok(())
        }
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }
}

struct GroupIndex {
    tree: RightTree<Arc<RightGroup>>,
    attached: bool,
}

struct NotifierInner<I> {
    manager: HierarchicalAccessManager<I>,
    groups: Mutex<GroupIndex>,
    registration: Mutex<Option<ListenerRef>>,
}

impl<I> NotifierInner<I>
where
    I: Clone + fmt::Debug + Send + Sync + 'static,
{
    fn on_access_change(&self, request: &AccessRequest<I>) -> ArbiterResult<()> {
        let affected = {
            let groups = self.groups.lock();
            let mut found = Vec::new();
            for right in request.read_rights().iter().chain(request.write_rights()) {
                groups.tree.blocking(right, &mut found);
            }
            dedup_groups(found)
        };
        update_groups(&self.manager, affected)
    }
}

fn dedup_groups(groups: Vec<Arc<RightGroup>>) -> Vec<Arc<RightGroup>> {
    let mut seen = HashSet::new();
    groups
        .into_iter()
        .filter(|g| seen.insert(Arc::as_ptr(g) as usize))
        .collect()
}

/// Every group is updated; the first failure is returned with the rest
/// attached.
fn update_groups<I>(
    manager: &HierarchicalAccessManager<I>,
    groups: Vec<Arc<RightGroup>>,
) -> ArbiterResult<()>
where
    I: Clone + fmt::Debug + Send + Sync + 'static,
{
    let mut errors = ErrorCollector::new();
    for group in groups {
        errors.run(|| group.update(manager));
    }
    errors.finish()
}

/// Notifies interested parties when a group of rights becomes available
/// or unavailable in a [`HierarchicalAccessManager`].
pub struct AvailabilityNotifier<I> {
    inner: Arc<NotifierInner<I>>,
}

impl<I> AvailabilityNotifier<I>
where
    I: Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Starts listening to `manager`'s access changes.
    pub fn attach(manager: &HierarchicalAccessManager<I>) -> Self {
        let inner = Arc::new(NotifierInner {
            manager: manager.clone(),
            groups: Mutex::new(GroupIndex {
                tree: RightTree::new(),
                attached: true,
            }),
            registration: Mutex::new(None),
        });

        let weak: Weak<NotifierInner<I>> = Arc::downgrade(&inner);
        let registration = manager.add_access_change_listener(move |request, _acquired| {
            match weak.upgrade() {
                Some(inner) => inner.on_access_change(request),
                None => Ok(()),
            }
        });
        *inner.registration.lock() = Some(registration);

        Self { inner }
    }

    /// Registers `action` for the group of rights.
    ///
    /// A lazy group is only notified when its availability changes; a
    /// non-lazy one on every access change touching its rights. The first
    /// notification is always delivered. After [`detach`](Self::detach) the
    /// group is not stored and the returned handle is unregistered.
    pub fn add_group_listener(
        &self,
        read: Vec<Right>,
        write: Vec<Right>,
        lazy: bool,
        action: GroupAction,
    ) -> ListenerRef {
        let group = Arc::new(RightGroup {
            read,
            write,
            action,
            last_state: AtomicU8::new(NEVER_NOTIFIED),
            lazy,
            enabled: AtomicBool::new(true),
        });

        let refs: Vec<TreeRef> = {
            let mut groups = self.inner.groups.lock();
            if !groups.attached {
                return ListenerRef::unregistered();
            }
            group
                .read
                .iter()
                .chain(&group.write)
                .map(|right| groups.tree.add(right, group.clone()).0)
                .collect()
        };

        let weak = Arc::downgrade(&self.inner);
        ListenerRef::new(move || {
            group.disable();
            if let Some(inner) = weak.upgrade() {
                let mut groups = inner.groups.lock();
                for reference in refs {
                    groups.tree.remove(reference);
                }
            }
        })
    }

    /// Re-evaluates every group now, e.g. to deliver initial states.
    pub fn refresh(&self) -> ArbiterResult<()> {
        let all = {
            let groups = self.inner.groups.lock();
            dedup_groups(groups.tree.values())
        };
        update_groups(&self.inner.manager, all)
    }

    /// Stops listening and drops every group. Idempotent.
    pub fn detach(&self) {
        if let Some(registration) = self.inner.registration.lock().take() {
            registration.unregister();
        }

        let mut groups = self.inner.groups.lock();
        for group in groups.tree.values() {
            group.disable();
        }
        groups.tree = RightTree::new();
        groups.attached = false;
    }

    pub fn group_count(&self) -> usize {
        dedup_groups(self.inner.groups.lock().tree.values()).len()
    }
}

impl<I> Drop for AvailabilityNotifier<I> {
    fn drop(&mut self) {
        if let Some(registration) = self.inner.registration.lock().take() {
            registration.unregister();
        }
    }
}

/// Combines actions into one that runs all of them in order. Every action
/// runs even if an earlier one fails; the first failure is returned with
/// the rest attached.
pub fn multi_action(actions: Vec<GroupAction>) -> GroupAction {
    Arc::new(move |available| {
        let mut errors = ErrorCollector::new();
        for action in &actions {
            errors.run(|| action(available));
        }
        errors.finish()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::ArbiterError;

    fn r(path: &[&str]) -> Right {
        Right::new(path.iter().copied())
    }

    fn recorder() -> (Arc<Mutex<Vec<bool>>>, GroupAction) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        (
            log,
            Arc::new(move |available| {
                l.lock().push(available);
                Ok(())
            }),
        )
    }

    #[test]
    fn lazy_group_reports_transitions_only() {
        let m = HierarchicalAccessManager::new();
        let notifier = AvailabilityNotifier::attach(&m);
        let (log, action) = recorder();
        notifier.add_group_listener(vec![], vec![r(&["a", "x"])], true, action);

        let holder = m.try_get_access(AccessRequest::read(1, r(&["a"])));
        let other = m.try_get_access(AccessRequest::read(2, r(&["a"])));
        holder.release();
        other.release();

        assert_eq!(*log.lock(), vec![false, true]);
    }

    #[test]
    fn eager_group_reports_every_touching_change() {
        let m = HierarchicalAccessManager::new();
        let notifier = AvailabilityNotifier::attach(&m);
        let (log, action) = recorder();
        notifier.add_group_listener(vec![r(&["a"])], vec![], false, action);

        let a = m.try_get_access(AccessRequest::read(1, r(&["a", "b"])));
        let b = m.try_get_access(AccessRequest::write(2, r(&["a", "c"])));
        a.release();
        b.release();

        // Reads never block the group's read; only the write does.
        assert_eq!(*log.lock(), vec![true, false, false, true]);
    }

    #[test]
    fn unrelated_rights_do_not_notify() {
        let m = HierarchicalAccessManager::new();
        let notifier = AvailabilityNotifier::attach(&m);
        let (log, action) = recorder();
        notifier.add_group_listener(vec![], vec![r(&["a", "x"])], false, action);

        let sibling = m.try_get_access(AccessRequest::write(1, r(&["a", "y"])));
        sibling.release();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn unregister_and_detach_stop_notifications() {
        let m = HierarchicalAccessManager::new();
        let notifier = AvailabilityNotifier::attach(&m);
        let (log, action) = recorder();
        let registration = notifier.add_group_listener(vec![], vec![r(&["a"])], false, action.clone());
        assert_eq!(notifier.group_count(), 1);

        registration.unregister();
        assert!(!registration.is_registered());
        assert_eq!(notifier.group_count(), 0);
        m.try_get_access(AccessRequest::write(1, r(&["a"]))).release();
        assert!(log.lock().is_empty());

        notifier.add_group_listener(vec![], vec![r(&["a"])], false, action.clone());
        notifier.detach();
        m.try_get_access(AccessRequest::write(2, r(&["a"]))).release();
        assert!(log.lock().is_empty());

        let late = notifier.add_group_listener(vec![], vec![r(&["a"])], false, action);
        assert!(!late.is_registered());
    }

    #[test]
    fn refresh_aggregates_group_failures() {
        let m: HierarchicalAccessManager<u8> = HierarchicalAccessManager::new();
        let notifier = AvailabilityNotifier::attach(&m);
        let (log, ok) = recorder();
        let failing: GroupAction = Arc::new(|_| Err(ArbiterError::task("first")));
        let also_failing: GroupAction = Arc::new(|_| Err(ArbiterError::task("second")));

        notifier.add_group_listener(vec![r(&["a"])], vec![], true, failing);
        notifier.add_group_listener(vec![r(&["b"])], vec![], true, ok);
        notifier.add_group_listener(vec![r(&["c"])], vec![], true, also_failing);

        let err = notifier.refresh().unwrap_err();
        assert_eq!(err.suppressed().len(), 1);
        assert_eq!(*log.lock(), vec![true]);
    }

    #[test]
    fn multi_action_runs_all_and_keeps_first_error() {
        let (log, ok) = recorder();
        let boom: GroupAction = Arc::new(|_| Err(ArbiterError::task("boom")));
        let later: GroupAction = Arc::new(|_| Err(ArbiterError::task("later")));
        let combined = multi_action(vec![boom, ok.clone(), later, ok]);

        let err = combined(true).unwrap_err();
        assert_eq!(*log.lock(), vec![true, true]);
        match err {
            ArbiterError::Aggregate { first, suppressed } => {
                assert!(first.to_string().contains("boom"));
                assert_eq!(suppressed.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn panicking_group_does_not_silence_others() {
        let m = HierarchicalAccessManager::new();
        let notifier = AvailabilityNotifier::attach(&m);
        let panicking: GroupAction = Arc::new(|_: bool| -> ArbiterResult<()> { panic!("group action panicked") });
        let (log, action) = recorder();
        notifier.add_group_listener(vec![], vec![r(&["a"])], false, panicking);
        notifier.add_group_listener(vec![], vec![r(&["a"])], false, action);

        m.try_get_access(AccessRequest::write(1, r(&["a"]))).release();
        m.try_get_access(AccessRequest::write(2, r(&["a"]))).release();
        assert_eq!(*log.lock(), vec![false, true, false, true]);

        let inner: GroupAction = Arc::new(|_: bool| -> ArbiterResult<()> { panic!("inner") });
        let (after, counted) = recorder();
        let err = multi_action(vec![inner, counted])(true).unwrap_err();
        assert_eq!(*after.lock(), vec![true]);
        assert!(err.to_string().contains("inner"));
    }
}
