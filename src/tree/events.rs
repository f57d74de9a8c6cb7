//! Structural change events emitted by the tree
//!
//! Every mutation reports each pointer it rewrites, in the order it rewrites
//! them, and closes with a single [`TreeEvent::Settled`]. Intermediate events
//! may describe rotation states that a later event in the same mutation
//! overwrites, so observers should buffer until `Settled`. A deleted node
//! reports its occupied slots as emptied before it leaves the tree.

/// A structural change inside the tree
#[derive(Debug, Clone, Copy)]
pub enum TreeEvent<'a, V> {
    /// The tree root now holds this payload (or the tree became empty)
    RootChanged(Option<&'a V>),
    /// `parent`'s left child slot now holds `child`
    LeftChanged {
        parent: &'a V,
        child: Option<&'a V>,
    },
    /// `parent`'s right child slot now holds `child`
    RightChanged {
        parent: &'a V,
        child: Option<&'a V>,
    },
    /// The mutation and all rotations it triggered have completed
    Settled,
}

/// Receives structural events synchronously during a mutation
pub trait TreeObserver<V> {
    /// Handle one event
    fn on_event(&mut self, event: TreeEvent<'_, V>);
}

/// Discards every event
impl<V> TreeObserver<V> for () {
    fn on_event(&mut self, _event: TreeEvent<'_, V>) {}
}

/// Records events as owned clones, in emission order
impl<V: Clone> TreeObserver<V> for Vec<OwnedTreeEvent<V>> {
    fn on_event(&mut self, event: TreeEvent<'_, V>) {
        self.push(OwnedTreeEvent::from(event));
    }
}

/// An owned copy of a [`TreeEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedTreeEvent<V> {
    RootChanged(Option<V>),
    LeftChanged { parent: V, child: Option<V> },
    RightChanged { parent: V, child: Option<V> },
    Settled,
}

impl<V: Clone> From<TreeEvent<'_, V>> for OwnedTreeEvent<V> {
    fn from(event: TreeEvent<'_, V>) -> Self {
        match event {
            TreeEvent::RootChanged(root) => OwnedTreeEvent::RootChanged(root.cloned()),
            TreeEvent::LeftChanged { parent, child } => OwnedTreeEvent::LeftChanged {
                parent: parent.clone(),
                child: child.cloned(),
            },
            TreeEvent::RightChanged { parent, child } => OwnedTreeEvent::RightChanged {
                parent: parent.clone(),
                child: child.cloned(),
            },
            TreeEvent::Settled => OwnedTreeEvent::Settled,
        }
    }
}
