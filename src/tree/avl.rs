//! AVL tree with structural change notification
//!
//! Nodes own their children through `Box`, so removing an edge drops the
//! subtree unless it is re-attached in the same step. Child pointer rewrites
//! are detected by comparing node allocations before and after each step;
//! only pointers that actually moved produce events.

use std::cmp::Ordering;
use std::fmt;

use super::compare::{Comparator, NaturalOrder};
use super::events::{TreeEvent, TreeObserver};

type Link<K, V> = Option<Box<Node<K, V>>>;

/// Allocation identity of a linked node
type Addr<K, V> = Option<*const Node<K, V>>;

struct Node<K, V> {
    key: K,
    value: V,
    height: usize,
    left: Link<K, V>,
    right: Link<K, V>,
}

fn addr<K, V>(link: &Link<K, V>) -> Addr<K, V> {
    link.as_deref().map(|node| node as *const Node<K, V>)
}

fn height<K, V>(link: &Link<K, V>) -> usize {
    link.as_ref().map_or(0, |node| node.height)
}

impl<K, V> Node<K, V> {
    fn leaf(key: K, value: V) -> Box<Self> {
        Box::new(Self {
            key,
            value,
            height: 1,
            left: None,
            right: None,
        })
    }

    fn update_height(&mut self) {
        self.height = 1 + height(&self.left).max(height(&self.right));
    }

    fn balance(&self) -> isize {
        height(&self.left) as isize - height(&self.right) as isize
    }

    fn emit_left<O: TreeObserver<V>>(&self, observer: &mut O) {
        observer.on_event(TreeEvent::LeftChanged {
            parent: &self.value,
            child: self.left.as_deref().map(|child| &child.value),
        });
    }

    fn emit_right<O: TreeObserver<V>>(&self, observer: &mut O) {
        observer.on_event(TreeEvent::RightChanged {
            parent: &self.value,
            child: self.right.as_deref().map(|child| &child.value),
        });
    }

    fn emit_left_if_moved<O: TreeObserver<V>>(&self, before: Addr<K, V>, observer: &mut O) {
        if addr(&self.left) != before {
            self.emit_left(observer);
        }
    }

    fn emit_right_if_moved<O: TreeObserver<V>>(&self, before: Addr<K, V>, observer: &mut O) {
        if addr(&self.right) != before {
            self.emit_right(observer);
        }
    }
}

fn rotate_right<K, V, O: TreeObserver<V>>(
    mut node: Box<Node<K, V>>,
    observer: &mut O,
) -> Box<Node<K, V>> {
    let Some(mut pivot) = node.left.take() else {
        return node;
    };

    node.left = pivot.right.take();
    node.update_height();
    node.emit_left(observer);

    pivot.right = Some(node);
    pivot.update_height();
    pivot.emit_right(observer);
    pivot
}

fn rotate_left<K, V, O: TreeObserver<V>>(
    mut node: Box<Node<K, V>>,
    observer: &mut O,
) -> Box<Node<K, V>> {
    let Some(mut pivot) = node.right.take() else {
        return node;
    };

    node.right = pivot.left.take();
    node.update_height();
    node.emit_right(observer);

    pivot.left = Some(node);
    pivot.update_height();
    pivot.emit_left(observer);
    pivot
}

/// Restore the height-difference bound at `node`, rotating if needed
fn rebalance<K, V, O: TreeObserver<V>>(
    mut node: Box<Node<K, V>>,
    observer: &mut O,
) -> Box<Node<K, V>> {
    node.update_height();

    match node.balance() {
        b if b > 1 => {
            // Left-right case
            if node.left.as_ref().is_some_and(|left| left.balance() < 0) {
                node.left = node.left.take().map(|left| rotate_left(left, observer));
                node.emit_left(observer);
            }
            rotate_right(node, observer)
        }
        b if b < -1 => {
            // Right-left case
            if node.right.as_ref().is_some_and(|right| right.balance() > 0) {
                node.right = node.right.take().map(|right| rotate_right(right, observer));
                node.emit_right(observer);
            }
            rotate_left(node, observer)
        }
        _ => node,
    }
}

fn insert_at<K, V, C, O>(
    link: Link<K, V>,
    key: K,
    value: V,
    cmp: &C,
    observer: &mut O,
    replaced: &mut Option<V>,
) -> Box<Node<K, V>>
where
    C: Comparator<K>,
    O: TreeObserver<V>,
{
    let Some(mut node) = link else {
        return Node::leaf(key, value);
    };

    match cmp.compare(&key, &node.key) {
        Ordering::Less => {
            let before = addr(&node.left);
            let child = insert_at(node.left.take(), key, value, cmp, observer, replaced);
            node.left = Some(child);
            node.emit_left_if_moved(before, observer);
        }
        Ordering::Greater => {
            let before = addr(&node.right);
            let child = insert_at(node.right.take(), key, value, cmp, observer, replaced);
            node.right = Some(child);
            node.emit_right_if_moved(before, observer);
        }
        Ordering::Equal => {
            *replaced = Some(std::mem::replace(&mut node.value, value));
            return node;
        }
    }

    rebalance(node, observer)
}

/// Detach the minimum node of a subtree
///
/// Returns the remaining subtree, the detached node (with its right link
/// cleared) and the allocation its right link pointed at before detaching.
fn take_min<K, V, O: TreeObserver<V>>(
    mut node: Box<Node<K, V>>,
    observer: &mut O,
) -> (Link<K, V>, Box<Node<K, V>>, Addr<K, V>) {
    match node.left.take() {
        None => {
            let old_right = addr(&node.right);
            let rest = node.right.take();
            (rest, node, old_right)
        }
        Some(left) => {
            let before: Addr<K, V> = Some(&*left as *const Node<K, V>);
            let (rest, min, old_right) = take_min(left, observer);
            node.left = rest;
            node.emit_left_if_moved(before, observer);
            (Some(rebalance(node, observer)), min, old_right)
        }
    }
}

fn remove_at<K, V, C, O>(
    link: Link<K, V>,
    key: &K,
    cmp: &C,
    observer: &mut O,
    removed: &mut Option<V>,
) -> Link<K, V>
where
    C: Comparator<K>,
    O: TreeObserver<V>,
{
    let mut node = link?;

    match cmp.compare(key, &node.key) {
        Ordering::Less => {
            let before = addr(&node.left);
            node.left = remove_at(node.left.take(), key, cmp, observer, removed);
            node.emit_left_if_moved(before, observer);
        }
        Ordering::Greater => {
            let before = addr(&node.right);
            node.right = remove_at(node.right.take(), key, cmp, observer, removed);
            node.emit_right_if_moved(before, observer);
        }
        Ordering::Equal => {
            let Node {
                value, left, right, ..
            } = *node;
            // The removed node's links leave with it
            if left.is_some() {
                observer.on_event(TreeEvent::LeftChanged {
                    parent: &value,
                    child: None,
                });
            }
            if right.is_some() {
                observer.on_event(TreeEvent::RightChanged {
                    parent: &value,
                    child: None,
                });
            }
            *removed = Some(value);

            return match (left, right) {
                (None, None) => None,
                (Some(child), None) | (None, Some(child)) => Some(child),
                (Some(left), Some(right)) => {
                    // Splice in the in-order successor
                    let (rest, mut successor, old_right) = take_min(right, observer);
                    successor.left = Some(left);
                    successor.emit_left(observer);
                    successor.right = rest;
                    successor.emit_right_if_moved(old_right, observer);
                    Some(rebalance(successor, observer))
                }
            };
        }
    }

    Some(rebalance(node, observer))
}

/// Structural defect found by [`AvlTree::check_invariants`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Subtree heights differ by more than one
    Unbalanced,
    /// Cached height does not match the subtree
    StaleHeight,
    /// In-order traversal is not strictly increasing
    OutOfOrder,
    /// Cached length does not match the node count
    LengthMismatch,
}

/// Self-balancing binary search tree
///
/// Mutations come in two flavors: plain (`insert`, `delete`) and observed
/// (`insert_with`, `delete_with`). Observed mutations report every child
/// pointer rewrite to the observer before returning, followed by one
/// [`TreeEvent::Settled`].
pub struct AvlTree<K, V, C = NaturalOrder> {
    root: Link<K, V>,
    len: usize,
    cmp: C,
}

impl<K: fmt::Debug, V: fmt::Debug, C> fmt::Debug for AvlTree<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries = Iter { stack: Vec::new() };
        entries.push_left(self.root.as_deref());
        f.debug_map().entries(entries).finish()
    }
}

impl<K: Ord, V> AvlTree<K, V, NaturalOrder> {
    /// Create an empty tree ordered by `Ord`
    pub fn new() -> Self {
        Self::with_comparator(NaturalOrder)
    }
}

impl<K: Ord, V> Default for AvlTree<K, V, NaturalOrder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C: Comparator<K>> AvlTree<K, V, C> {
    /// Create an empty tree with a custom comparator
    pub fn with_comparator(cmp: C) -> Self {
        Self {
            root: None,
            len: 0,
            cmp,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the tree is empty
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Height of the tree (0 when empty)
    pub fn height(&self) -> usize {
        height(&self.root)
    }

    /// Root entry
    pub fn root(&self) -> Option<(&K, &V)> {
        self.root.as_deref().map(|node| (&node.key, &node.value))
    }

    /// Insert without observing structural changes
    ///
    /// Returns the previous payload if the key was already present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.insert_with(key, value, &mut ())
    }

    /// Insert, reporting structural changes to `observer`
    pub fn insert_with<O: TreeObserver<V>>(
        &mut self,
        key: K,
        value: V,
        observer: &mut O,
    ) -> Option<V> {
        let before = addr(&self.root);
        let mut replaced = None;

        let root = insert_at(self.root.take(), key, value, &self.cmp, observer, &mut replaced);
        self.root = Some(root);

        if replaced.is_none() {
            self.len += 1;
        }
        self.settle(before, observer);
        replaced
    }

    /// Delete without observing structural changes
    ///
    /// Deleting an absent key is a no-op and returns `None`.
    pub fn delete(&mut self, key: &K) -> Option<V> {
        self.delete_with(key, &mut ())
    }

    /// Delete, reporting structural changes to `observer`
    pub fn delete_with<O: TreeObserver<V>>(&mut self, key: &K, observer: &mut O) -> Option<V> {
        let before = addr(&self.root);
        let mut removed = None;

        self.root = remove_at(self.root.take(), key, &self.cmp, observer, &mut removed);

        if removed.is_some() {
            self.len -= 1;
        }
        self.settle(before, observer);
        removed
    }

    fn settle<O: TreeObserver<V>>(&self, before: Addr<K, V>, observer: &mut O) {
        if addr(&self.root) != before {
            observer.on_event(TreeEvent::RootChanged(
                self.root.as_deref().map(|node| &node.value),
            ));
        }
        observer.on_event(TreeEvent::Settled);
    }

    /// Remove every entry without emitting events
    pub fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }

    fn find(&self, key: &K) -> Option<&Node<K, V>> {
        let mut current = self.root.as_deref();
        while let Some(node) = current {
            current = match self.cmp.compare(key, &node.key) {
                Ordering::Less => node.left.as_deref(),
                Ordering::Greater => node.right.as_deref(),
                Ordering::Equal => return Some(node),
            };
        }
        None
    }

    /// Look up a payload by key
    pub fn get(&self, key: &K) -> Option<&V> {
        self.find(key).map(|node| &node.value)
    }

    /// Check if a key is present
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Payload of the parent of `key` (`None` for the root or an absent key)
    pub fn parent_of(&self, key: &K) -> Option<&V> {
        let mut parent = None;
        let mut current = self.root.as_deref();

        while let Some(node) = current {
            current = match self.cmp.compare(key, &node.key) {
                Ordering::Less => node.left.as_deref(),
                Ordering::Greater => node.right.as_deref(),
                Ordering::Equal => return parent,
            };
            parent = Some(&node.value);
        }
        None
    }

    /// Left and right child payloads of `key`
    pub fn children_of(&self, key: &K) -> Option<(Option<&V>, Option<&V>)> {
        self.find(key).map(|node| {
            (
                node.left.as_deref().map(|child| &child.value),
                node.right.as_deref().map(|child| &child.value),
            )
        })
    }

    /// Depth of `key`, counting the root as 1
    pub fn depth_of(&self, key: &K) -> Option<usize> {
        let mut depth = 1;
        let mut current = self.root.as_deref();

        while let Some(node) = current {
            current = match self.cmp.compare(key, &node.key) {
                Ordering::Less => node.left.as_deref(),
                Ordering::Greater => node.right.as_deref(),
                Ordering::Equal => return Some(depth),
            };
            depth += 1;
        }
        None
    }

    /// In-order iterator over entries
    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut iter = Iter { stack: Vec::new() };
        iter.push_left(self.root.as_deref());
        iter
    }

    /// Verify ordering, balance, cached heights and length
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        fn check<K, V>(link: &Link<K, V>) -> Result<usize, InvariantViolation> {
            let Some(node) = link.as_deref() else {
                return Ok(0);
            };
            let left = check(&node.left)?;
            let right = check(&node.right)?;
            if left.abs_diff(right) > 1 {
                return Err(InvariantViolation::Unbalanced);
            }
            let height = 1 + left.max(right);
            if height != node.height {
                return Err(InvariantViolation::StaleHeight);
            }
            Ok(height)
        }

        check(&self.root)?;

        let mut count = 0;
        let mut previous: Option<&K> = None;
        for (key, _) in self.iter() {
            if let Some(prev) = previous {
                if self.cmp.compare(prev, key) != Ordering::Less {
                    return Err(InvariantViolation::OutOfOrder);
                }
            }
            previous = Some(key);
            count += 1;
        }

        if count != self.len {
            return Err(InvariantViolation::LengthMismatch);
        }
        Ok(())
    }
}

/// In-order iterator returned by [`AvlTree::iter`]
pub struct Iter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
}

impl<'a, K, V> Iter<'a, K, V> {
    fn push_left(&mut self, mut current: Option<&'a Node<K, V>>) {
        while let Some(node) = current {
            self.stack.push(node);
            current = node.left.as_deref();
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left(node.right.as_deref());
        Some((&node.key, &node.value))
    }
}
