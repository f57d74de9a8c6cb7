//! Change batching
//!
//! [`ChangeCollector`] buffers the events of one mutation into a
//! [`ChangeBatch`] keyed by payload identity and releases it on `Settled`.
//! Later events for the same slot overwrite earlier ones, and slots whose
//! final child equals the one before the mutation are dropped, so a released
//! batch holds exactly the links the mutation changed.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;

use super::avl::AvlTree;
use super::compare::Comparator;
use super::events::{TreeEvent, TreeObserver};

/// Payloads that can be named by a stable identity
pub trait Identity {
    /// Identity type
    type Id: Clone + Eq + Hash + Debug;

    /// The payload's identity
    fn identity(&self) -> Self::Id;
}

/// Final child slots of one parent within a batch
///
/// The outer `Option` tells whether the slot changed, the inner one what it
/// now holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeChange<I> {
    pub left: Option<Option<I>>,
    pub right: Option<Option<I>>,
}

impl<I> Default for EdgeChange<I> {
    fn default() -> Self {
        Self {
            left: None,
            right: None,
        }
    }
}

/// Structural delta of one settled mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch<I> {
    root: Option<Option<I>>,
    edges: Vec<(I, EdgeChange<I>)>,
}

impl<I> Default for ChangeBatch<I> {
    fn default() -> Self {
        Self {
            root: None,
            edges: Vec::new(),
        }
    }
}

impl<I: Clone + Eq> ChangeBatch<I> {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if nothing changed
    pub fn is_empty(&self) -> bool {
        self.root.is_none() && self.edges.is_empty()
    }

    /// New root, if the root changed (`Some(None)` means the tree emptied)
    pub fn root_change(&self) -> Option<Option<&I>> {
        self.root.as_ref().map(Option::as_ref)
    }

    /// Parents whose child slots changed, in first-touched order
    pub fn edges(&self) -> impl Iterator<Item = (&I, &EdgeChange<I>)> {
        self.edges.iter().map(|(parent, change)| (parent, change))
    }

    /// Slot changes of one parent
    pub fn edge(&self, parent: &I) -> Option<&EdgeChange<I>> {
        self.edges
            .iter()
            .find(|(id, _)| id == parent)
            .map(|(_, change)| change)
    }

    fn entry(&mut self, parent: I) -> &mut EdgeChange<I> {
        let index = match self.edges.iter().position(|(id, _)| *id == parent) {
            Some(index) => index,
            None => {
                self.edges.push((parent, EdgeChange::default()));
                self.edges.len() - 1
            }
        };
        &mut self.edges[index].1
    }

    /// Record a root change
    pub fn set_root(&mut self, root: Option<I>) {
        self.root = Some(root);
    }

    /// Record a left slot change
    pub fn set_left(&mut self, parent: I, child: Option<I>) {
        self.entry(parent).left = Some(child);
    }

    /// Record a right slot change
    pub fn set_right(&mut self, parent: I, child: Option<I>) {
        self.entry(parent).right = Some(child);
    }
}

/// Observer that turns tree events into [`ChangeBatch`]es
///
/// Keeps the child slots of every node as of the last settle, so a slot that
/// a rotation rewrites and then restores is left out of the released batch.
/// The collector must observe every mutation of its tree from the first one.
#[derive(Debug)]
pub struct ChangeCollector<I> {
    pending: ChangeBatch<I>,
    settled: VecDeque<ChangeBatch<I>>,
    /// Slots at the last settle; childless nodes are absent
    shape: HashMap<I, (Option<I>, Option<I>)>,
}

impl<I> Default for ChangeCollector<I> {
    fn default() -> Self {
        Self {
            pending: ChangeBatch::default(),
            settled: VecDeque::new(),
            shape: HashMap::new(),
        }
    }
}

impl<I: Clone + Eq + Hash> ChangeCollector<I> {
    /// Create an idle collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the oldest settled batch
    pub fn take_settled(&mut self) -> Option<ChangeBatch<I>> {
        self.settled.pop_front()
    }

    /// Check if a mutation is mid-flight (events buffered, not yet settled)
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop buffered and settled batches along with the tracked shape
    pub fn reset(&mut self) {
        self.pending = ChangeBatch::default();
        self.settled.clear();
        self.shape.clear();
    }

    fn settle(&mut self) {
        let mut batch = std::mem::take(&mut self.pending);

        for (parent, change) in batch.edges.iter_mut() {
            let (mut left, mut right) = self.shape.remove(&*parent).unwrap_or((None, None));

            if change.left.as_ref() == Some(&left) {
                change.left = None;
            } else if let Some(child) = &change.left {
                left = child.clone();
            }
            if change.right.as_ref() == Some(&right) {
                change.right = None;
            } else if let Some(child) = &change.right {
                right = child.clone();
            }

            if left.is_some() || right.is_some() {
                self.shape.insert(parent.clone(), (left, right));
            }
        }
        batch
            .edges
            .retain(|(_, change)| change.left.is_some() || change.right.is_some());

        self.settled.push_back(batch);
    }
}

impl<V: Identity> TreeObserver<V> for ChangeCollector<V::Id> {
    fn on_event(&mut self, event: TreeEvent<'_, V>) {
        match event {
            TreeEvent::RootChanged(root) => {
                self.pending.set_root(root.map(Identity::identity));
            }
            TreeEvent::LeftChanged { parent, child } => {
                self.pending
                    .set_left(parent.identity(), child.map(Identity::identity));
            }
            TreeEvent::RightChanged { parent, child } => {
                self.pending
                    .set_right(parent.identity(), child.map(Identity::identity));
            }
            TreeEvent::Settled => self.settle(),
        }
    }
}

/// Root plus child links, keyed by identity
///
/// Only nodes with at least one child carry an entry. Can be captured from a
/// live tree or rebuilt by replaying batches onto an empty topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology<I: Eq + Hash> {
    root: Option<I>,
    children: HashMap<I, (Option<I>, Option<I>)>,
}

impl<I: Eq + Hash> Default for Topology<I> {
    fn default() -> Self {
        Self {
            root: None,
            children: HashMap::new(),
        }
    }
}

impl<I: Clone + Eq + Hash> Topology<I> {
    /// Create an empty topology
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the shape of a live tree
    pub fn capture<K, V, C>(tree: &AvlTree<K, V, C>) -> Self
    where
        V: Identity<Id = I>,
        C: Comparator<K>,
    {
        let mut topology = Self::new();
        topology.root = tree.root().map(|(_, value)| value.identity());

        for (key, value) in tree.iter() {
            if let Some((left, right)) = tree.children_of(key) {
                if left.is_some() || right.is_some() {
                    topology.children.insert(
                        value.identity(),
                        (left.map(Identity::identity), right.map(Identity::identity)),
                    );
                }
            }
        }
        topology
    }

    /// Replay a batch
    pub fn apply(&mut self, batch: &ChangeBatch<I>) {
        if let Some(root) = batch.root_change() {
            self.root = root.cloned();
        }

        for (parent, change) in batch.edges() {
            let slots = self.children.entry(parent.clone()).or_insert((None, None));
            if let Some(left) = &change.left {
                slots.0 = left.clone();
            }
            if let Some(right) = &change.right {
                slots.1 = right.clone();
            }
        }

        // Forget removed nodes and childless entries
        let reachable = self.depths();
        self.children.retain(|id, (left, right)| {
            reachable.contains_key(id) && (left.is_some() || right.is_some())
        });
    }

    /// Current root
    pub fn root(&self) -> Option<&I> {
        self.root.as_ref()
    }

    /// Child slots of a node
    pub fn children(&self, id: &I) -> (Option<&I>, Option<&I>) {
        match self.children.get(id) {
            Some((left, right)) => (left.as_ref(), right.as_ref()),
            None => (None, None),
        }
    }

    /// Parent of a node (`None` for the root or an unknown id)
    pub fn parent_of(&self, id: &I) -> Option<&I> {
        self.children.iter().find_map(|(parent, (left, right))| {
            (left.as_ref() == Some(id) || right.as_ref() == Some(id)).then_some(parent)
        })
    }

    /// Hop count of every reachable node, the root being one hop from the source
    pub fn depths(&self) -> HashMap<I, usize> {
        let mut depths = HashMap::new();
        let mut queue = VecDeque::new();

        if let Some(root) = &self.root {
            queue.push_back((root.clone(), 1));
        }
        while let Some((id, depth)) = queue.pop_front() {
            if depths.contains_key(&id) {
                continue;
            }
            let (left, right) = self.children(&id);
            for child in [left, right].into_iter().flatten() {
                queue.push_back((child.clone(), depth + 1));
            }
            depths.insert(id, depth);
        }
        depths
    }

    /// Number of reachable nodes
    pub fn len(&self) -> usize {
        self.depths().len()
    }

    /// Check if there is no root
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::tree::compare::ReversedOrder;

    impl Identity for u32 {
        type Id = u32;

        fn identity(&self) -> u32 {
            *self
        }
    }

    #[test]
    fn test_collector_releases_only_on_settle() {
        let mut collector: ChangeCollector<u32> = ChangeCollector::new();
        let parent = 1u32;
        let child = 2u32;

        collector.on_event(TreeEvent::LeftChanged {
            parent: &parent,
            child: Some(&child),
        });
        assert!(collector.has_pending());
        assert!(collector.take_settled().is_none());

        TreeObserver::<u32>::on_event(&mut collector, TreeEvent::Settled);
        let batch = collector.take_settled().unwrap();
        assert_eq!(batch.edge(&1).unwrap().left, Some(Some(2)));
        assert_eq!(batch.edge(&1).unwrap().right, None);
        assert!(!collector.has_pending());
    }

    #[test]
    fn test_restored_slot_is_dropped() {
        let mut collector: ChangeCollector<u32> = ChangeCollector::new();
        let (parent, child) = (1u32, 2u32);

        collector.on_event(TreeEvent::LeftChanged {
            parent: &parent,
            child: Some(&child),
        });
        TreeObserver::<u32>::on_event(&mut collector, TreeEvent::Settled);
        assert!(collector.take_settled().unwrap().edge(&1).is_some());

        // A rotation moves the child away and puts it back
        collector.on_event(TreeEvent::LeftChanged {
            parent: &parent,
            child: None,
        });
        collector.on_event(TreeEvent::RightChanged {
            parent: &parent,
            child: Some(&3),
        });
        collector.on_event(TreeEvent::LeftChanged {
            parent: &parent,
            child: Some(&child),
        });
        TreeObserver::<u32>::on_event(&mut collector, TreeEvent::Settled);

        let batch = collector.take_settled().unwrap();
        assert_eq!(
            batch.edge(&1),
            Some(&EdgeChange {
                left: None,
                right: Some(Some(3)),
            })
        );
    }

    #[test]
    fn test_batch_keeps_last_write() {
        let mut batch = ChangeBatch::new();
        batch.set_left(7u32, Some(1));
        batch.set_left(7, Some(3));
        batch.set_right(7, None);

        assert_eq!(batch.edges().count(), 1);
        assert_eq!(
            batch.edge(&7),
            Some(&EdgeChange {
                left: Some(Some(3)),
                right: Some(None),
            })
        );
    }

    #[test]
    fn test_replay_four_increasing_joins() {
        // Newest-first ordering as used by the coordinator
        let mut tree = AvlTree::with_comparator(ReversedOrder);
        let mut collector: ChangeCollector<u32> = ChangeCollector::new();
        let mut model = Topology::new();

        for peer in 1..=4u32 {
            tree.insert_with(peer, peer, &mut collector);
            let batch = collector.take_settled().unwrap();
            assert!(collector.take_settled().is_none());

            model.apply(&batch);
            assert_eq!(model, Topology::capture(&tree));
        }

        assert_eq!(model.root(), Some(&2));
        assert_eq!(model.children(&2), (Some(&3), Some(&1)));
        assert_eq!(model.children(&3), (Some(&4), None));
        assert_eq!(model.parent_of(&4), Some(&3));
        assert_eq!(model.len(), 4);
    }

    #[test]
    fn test_replay_delete_of_inner_node() {
        let mut tree = AvlTree::new();
        let mut collector: ChangeCollector<u32> = ChangeCollector::new();
        let mut model = Topology::new();

        for peer in [4u32, 2, 6, 1, 3, 5, 7] {
            tree.insert_with(peer, peer, &mut collector);
        }
        while let Some(batch) = collector.take_settled() {
            model.apply(&batch);
        }

        tree.delete_with(&4, &mut collector);
        let batch = collector.take_settled().unwrap();
        assert_eq!(batch.root_change(), Some(Some(&5)));

        model.apply(&batch);
        assert_eq!(model, Topology::capture(&tree));
        assert_eq!(model.depths().get(&4), None);
    }

    proptest! {
        #[test]
        fn prop_replayed_batches_match_tree(
            ops in proptest::collection::vec((any::<bool>(), 0u32..48), 1..200)
        ) {
            let mut tree = AvlTree::new();
            let mut collector: ChangeCollector<u32> = ChangeCollector::new();
            let mut model = Topology::new();

            for (is_insert, key) in ops {
                if is_insert {
                    tree.insert_with(key, key, &mut collector);
                } else {
                    tree.delete_with(&key, &mut collector);
                }

                let batch = collector.take_settled().unwrap();
                model.apply(&batch);
                prop_assert_eq!(&model, &Topology::capture(&tree));
            }
        }
    }
}
