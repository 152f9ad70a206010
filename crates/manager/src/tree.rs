//! Right trie: maps hierarchical rights to the values registered at them.
//!
//! Nodes live in an arena addressed by index; the parent link is only used
//! to walk back up when pruning. A value registered at node N holds N's
//! right and, implicitly, every right below it.
//!
//! Invariant: apart from the root, every live node has entries or
//! children. [`RightTree::remove`] prunes immediately, so lookup cost tracks
//! the rights in use rather than every right ever registered.

use arbiter_core::{Right, Segment};
use smallvec::SmallVec;
use std::collections::HashMap;

const ROOT: usize = 0;

/// Removable handle returned by [`RightTree::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRef {
    node: usize,
    entry: u64,
}

struct Node<T> {
    segment: Option<Segment>,
    parent: Option<usize>,
    children: HashMap<Segment, usize>,
    entries: Vec<(u64, T)>,
}

impl<T> Node<T> {
    fn new(segment: Option<Segment>, parent: Option<usize>) -> Self {
        Self {
            segment,
            parent,
            children: HashMap::new(),
            entries: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.children.is_empty()
    }
}

pub struct RightTree<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    next_entry: u64,
}

impl<T> Default for RightTree<T> {
    fn default() -> Self {
        Self {
            nodes: vec![Some(Node::new(None, None))],
            free: Vec::new(),
            next_entry: 0,
        }
    }
}

impl<T> RightTree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, idx: usize) -> Option<&Node<T>> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<T>> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    fn child(&self, idx: usize, segment: &Segment) -> Option<usize> {
        self.node(idx).and_then(|n| n.children.get(segment).copied())
    }

    fn alloc(&mut self, node: Node<T>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    /// Live nodes, the root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node(ROOT).map_or(true, Node::is_empty)
    }

    /// Registers `value` at `right`.
    ///
    /// The flag is `true` when the right was not covered before: no value
    /// at `right` itself nor at any ancestor. Descendants do not count.
    pub fn add(&mut self, right: &Right, value: T) -> (TreeRef, bool) {
        let mut current = ROOT;
        let mut covered = false;

        for segment in right.segments() {
            if self.node(current).is_some_and(|n| !n.entries.is_empty()) {
                covered = true;
            }
            current = match self.child(current, segment) {
                Some(next) => next,
                None => {
                    let next = self.alloc(Node::new(Some(segment.clone()), Some(current)));
                    if let Some(node) = self.node_mut(current) {
                        node.children.insert(segment.clone(), next);
                    }
                    next
                }
            };
        }

        let entry = self.next_entry;
        self.next_entry += 1;

        let newly_covered = match self.node_mut(current) {
            Some(node) => {
                let was_empty = node.entries.is_empty();
                node.entries.push((entry, value));
                !covered && was_empty
            }
            None => false,
        };

        (
            TreeRef {
                node: current,
                entry,
            },
            newly_covered,
        )
    }

    /// Removes the value behind `reference` and prunes every node left
    /// without entries or children.
    ///
    /// Returns the value and, if anything was pruned, the right of the
    /// topmost pruned node. Stale references return `None`.
    pub fn remove(&mut self, reference: TreeRef) -> Option<(T, Option<Right>)> {
        let node = self.node_mut(reference.node)?;
        let pos = node.entries.iter().position(|(id, _)| *id == reference.entry)?;
        let (_, value) = node.entries.remove(pos);

        let mut pruned = None;
        let mut current = reference.node;
        while current != ROOT {
            let removable = self.node(current).is_some_and(Node::is_empty);
            if !removable {
                break;
            }
            let right = self.right_of(current);
            let Some(node) = self.nodes[current].take() else {
                break;
            };
            self.free.push(current);

            let parent = node.parent.unwrap_or(ROOT);
            if let (Some(segment), Some(parent_node)) = (node.segment, self.node_mut(parent)) {
                parent_node.children.remove(&segment);
            }
            pruned = Some(right);
            current = parent;
        }

        if let Some(right) = &pruned {
            tracing::trace!(%right, "pruned right subtree");
        }
        Some((value, pruned))
    }

    fn right_of(&self, idx: usize) -> Right {
        let mut segments: SmallVec<[Segment; 8]> = SmallVec::new();
        let mut current = Some(idx);
        while let Some(i) = current {
            let Some(node) = self.node(i) else { break };
            if let Some(segment) = &node.segment {
                segments.push(segment.clone());
            }
            current = node.parent;
        }
        segments.reverse();
        Right::new(segments)
    }

    /// Node indices along `right`'s path, root first. Stops early at the
    /// first missing segment; the flag tells whether the whole path exists.
    fn walk(&self, right: &Right) -> (SmallVec<[usize; 8]>, bool) {
        let mut path = SmallVec::new();
        let mut current = ROOT;
        path.push(current);
        for segment in right.segments() {
            match self.child(current, segment) {
                Some(next) => {
                    current = next;
                    path.push(current);
                }
                None => return (path, false),
            }
        }
        (path, true)
    }

    fn subtree_has_entries(&self, idx: usize) -> bool {
        let mut stack = vec![idx];
        while let Some(i) = stack.pop() {
            if let Some(node) = self.node(i) {
                if !node.entries.is_empty() {
                    return true;
                }
                stack.extend(node.children.values().copied());
            }
        }
        false
    }

    /// True if any value is registered at `right`, an ancestor, or a
    /// descendant of it.
    pub fn has_conflict(&self, right: &Right) -> bool {
        let (path, reached) = self.walk(right);
        let (last, ancestors) = match path.split_last() {
            Some(split) => split,
            None => return false,
        };
        if !reached {
            // The last node is an ancestor; nothing exists below the gap.
            return path
                .iter()
                .any(|&i| self.node(i).is_some_and(|n| !n.entries.is_empty()));
        }
        ancestors
            .iter()
            .any(|&i| self.node(i).is_some_and(|n| !n.entries.is_empty()))
            || self.subtree_has_entries(*last)
    }

    /// True if `right` is covered: a value sits at it or at an ancestor.
    pub fn has_right(&self, right: &Right) -> bool {
        // Whether or not the full path exists, every walked node is the right
        // itself or one of its ancestors.
        let (path, _) = self.walk(right);
        path.iter()
            .any(|&i| self.node(i).is_some_and(|n| !n.entries.is_empty()))
    }

    /// Every right with at least one value, in lexicographic order.
    pub fn rights(&self) -> Vec<Right> {
        let mut result: Vec<Right> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.as_ref().is_some_and(|n| !n.entries.is_empty()))
            .map(|(i, _)| self.right_of(i))
            .collect();
        result.sort();
        result
    }
}

impl<T: Clone> RightTree<T> {
    /// Appends every value conflicting with `right`: values at each node
    /// along the path (ancestors and the right itself), then every value in
    /// the subtree below the terminal node (descendants).
    pub fn blocking(&self, right: &Right, out: &mut Vec<T>) {
        let (path, reached) = self.walk(right);
        for &i in &path {
            if let Some(node) = self.node(i) {
                out.extend(node.entries.iter().map(|(_, v)| v.clone()));
            }
        }
        if !reached {
            return;
        }
        if let Some(&last) = path.last() {
            let mut stack: Vec<usize> = self
                .node(last)
                .map(|n| n.children.values().copied().collect())
                .unwrap_or_default();
            while let Some(i) = stack.pop() {
                if let Some(node) = self.node(i) {
                    out.extend(node.entries.iter().map(|(_, v)| v.clone()));
                    stack.extend(node.children.values().copied());
                }
            }
        }
    }

    /// All registered values, in arena order.
    pub fn values(&self) -> Vec<T> {
        self.nodes
            .iter()
            .flatten()
            .flat_map(|n| n.entries.iter().map(|(_, v)| v.clone()))
            .collect()
    }
}

/// Reduces `rights` to the minimal set covering the same scope: duplicates
/// and rights below another listed right are dropped. A universal right
/// absorbs everything.
pub fn minimize_rights(mut rights: Vec<Right>) -> Vec<Right> {
    rights.sort_by_key(Right::depth);
    let mut kept: Vec<Right> = Vec::with_capacity(rights.len());
    for right in rights {
        if !kept.iter().any(|k| k.is_ancestor_of(&right)) {
            kept.push(right);
        }
    }
    kept.sort();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(path: &[&str]) -> Right {
        Right::new(path.iter().copied())
    }

    fn blocking(tree: &RightTree<u32>, right: &Right) -> Vec<u32> {
        let mut out = Vec::new();
        tree.blocking(right, &mut out);
        out.sort();
        out
    }

    #[test]
    fn blocking_walk_collects_ancestors_and_descendants() {
        let mut tree = RightTree::new();
        tree.add(&r(&["a"]), 1);
        tree.add(&r(&["a", "x"]), 2);
        tree.add(&r(&["a", "x", "z"]), 3);
        tree.add(&r(&["a", "y"]), 4);
        tree.add(&r(&["b"]), 5);

        assert_eq!(blocking(&tree, &r(&["a", "x"])), vec![1, 2, 3]);
        assert_eq!(blocking(&tree, &r(&["a"])), vec![1, 2, 3, 4]);
        assert_eq!(blocking(&tree, &r(&["a", "y", "q"])), vec![1, 4]);
        assert_eq!(blocking(&tree, &r(&["c"])), Vec::<u32>::new());
        assert_eq!(blocking(&tree, &Right::universal()), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn has_conflict_matches_blocking_walk() {
        let mut tree = RightTree::new();
        tree.add(&r(&["a", "x"]), 1);

        assert!(tree.has_conflict(&r(&["a"])));
        assert!(tree.has_conflict(&r(&["a", "x"])));
        assert!(tree.has_conflict(&r(&["a", "x", "z"])));
        assert!(!tree.has_conflict(&r(&["a", "y"])));
        assert!(!tree.has_conflict(&r(&["b", "x"])));
        assert!(tree.has_conflict(&Right::universal()));
    }

    #[test]
    fn has_right_only_looks_upward() {
        let mut tree = RightTree::new();
        tree.add(&r(&["a", "x"]), 1);

        assert!(tree.has_right(&r(&["a", "x"])));
        assert!(tree.has_right(&r(&["a", "x", "deep"])));
        assert!(!tree.has_right(&r(&["a"])));
        assert!(!tree.has_right(&Right::universal()));
    }

    #[test]
    fn add_reports_newly_covered_rights() {
        let mut tree = RightTree::new();
        assert!(tree.add(&r(&["a", "x"]), 1).1);
        assert!(!tree.add(&r(&["a", "x"]), 2).1);
        assert!(!tree.add(&r(&["a", "x", "z"]), 3).1);
        // A broader right is new even though descendants exist.
        assert!(tree.add(&r(&["a"]), 4).1);
    }

    #[test]
    fn removing_everything_compacts_to_root() {
        let mut tree = RightTree::new();
        let rights = [
            r(&["a"]),
            r(&["a", "x"]),
            r(&["a", "x", "z"]),
            r(&["b", "y"]),
            Right::new([Segment::Index(7), Segment::from("k")]),
        ];
        let refs: Vec<TreeRef> = rights
            .iter()
            .enumerate()
            .map(|(i, right)| tree.add(right, i as u32).0)
            .collect();
        assert!(tree.node_count() > 1);

        for reference in refs {
            assert!(tree.remove(reference).is_some());
        }
        assert_eq!(tree.node_count(), 1);
        assert!(tree.is_empty());
        assert!(tree.rights().is_empty());
    }

    #[test]
    fn remove_reports_topmost_pruned_right() {
        let mut tree = RightTree::new();
        let (deep, _) = tree.add(&r(&["a", "x", "z"]), 1);
        let (sibling, _) = tree.add(&r(&["a", "y"]), 2);

        // ["a"] still has ["a","y"], so pruning stops at ["a","x"].
        let (value, pruned) = tree.remove(deep).unwrap();
        assert_eq!(value, 1);
        assert_eq!(pruned, Some(r(&["a", "x"])));

        let (_, pruned) = tree.remove(sibling).unwrap();
        assert_eq!(pruned, Some(r(&["a"])));
        assert!(tree.remove(sibling).is_none());
    }

    #[test]
    fn shared_node_is_kept_until_last_entry_leaves() {
        let mut tree = RightTree::new();
        let (first, _) = tree.add(&r(&["a"]), 1);
        let (second, _) = tree.add(&r(&["a"]), 2);

        assert_eq!(tree.remove(first).unwrap().1, None);
        assert_eq!(tree.rights(), vec![r(&["a"])]);
        assert_eq!(tree.remove(second).unwrap().1, Some(r(&["a"])));
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut tree = RightTree::new();
        let (a, _) = tree.add(&r(&["a", "b"]), 1);
        tree.remove(a);
        tree.add(&r(&["c", "d"]), 2);
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.nodes.len(), 3);
    }

    #[test]
    fn minimize_drops_covered_rights() {
        let minimal = minimize_rights(vec![
            r(&["a", "x"]),
            r(&["a"]),
            r(&["b", "y"]),
            r(&["a", "x", "z"]),
            r(&["b", "y"]),
        ]);
        assert_eq!(minimal, vec![r(&["a"]), r(&["b", "y"])]);
        assert_eq!(
            minimize_rights(vec![r(&["q"]), Right::universal()]),
            vec![Right::universal()]
        );
    }
}
