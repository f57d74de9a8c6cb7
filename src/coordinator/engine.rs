//! Coordinator state machine
//!
//! Owns the tree, the registry and the change collector. Each input is
//! applied synchronously and returns the [`CoordinatorAction`]s that realise
//! the resulting topology on the network.

use crate::error::{Error, Result};
use crate::protocol::{Role, SignalingMessage};
use crate::registry::{JoinClock, JoinOrder, JoinStamp, MembershipRegistry, PeerId, PeerRecord};
use crate::stats::CoordinatorStats;
use crate::transport::{ChannelId, MediaStream};
use crate::tree::{AvlTree, ChangeBatch, ChangeCollector, InvariantViolation, Topology};

use super::config::CoordinatorConfig;
use super::state::{PeerPhase, PendingJoins};

/// Side effect requested by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorAction {
    /// Send a signaling message to a member
    Send { to: PeerId, message: SignalingMessage },
    /// Close a control channel
    CloseChannel { channel: ChannelId },
    /// Call the root with the origin stream
    CallRoot { peer: PeerId, stream: MediaStream },
    /// End the direct call to a former root
    HangUpRoot { peer: PeerId },
    /// Arm the handshake timer of a tentative channel
    StartJoinTimer { channel: ChannelId },
    /// Disarm the handshake timer of a channel
    CancelJoinTimer { channel: ChannelId },
}

/// Origin-side overlay manager
#[derive(Debug)]
pub struct Coordinator {
    config: CoordinatorConfig,
    tree: AvlTree<JoinStamp, PeerRecord, JoinOrder>,
    registry: MembershipRegistry,
    collector: ChangeCollector<PeerId>,
    clock: JoinClock,
    pending: PendingJoins,
    media: Option<MediaStream>,
    root_call: Option<PeerId>,
    stats: CoordinatorStats,
    closed: bool,
}

impl Coordinator {
    /// Create a coordinator with an empty tree
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            tree: AvlTree::with_comparator(config.order),
            config,
            registry: MembershipRegistry::new(),
            collector: ChangeCollector::new(),
            clock: JoinClock::new(),
            pending: PendingJoins::new(),
            media: None,
            root_call: None,
            stats: CoordinatorStats::new(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::CoordinatorClosed)
        } else {
            Ok(())
        }
    }

    /// A peer opened a control channel
    pub fn on_channel_opened(
        &mut self,
        channel: ChannelId,
        peer: PeerId,
    ) -> Result<Vec<CoordinatorAction>> {
        self.ensure_open()?;
        tracing::debug!(channel = %channel, peer = %peer, "Control channel opened");

        self.pending.open(channel, peer);
        Ok(vec![CoordinatorAction::StartJoinTimer { channel }])
    }

    /// A signaling message arrived on `channel` from `from`
    pub fn on_message(
        &mut self,
        channel: ChannelId,
        from: PeerId,
        message: SignalingMessage,
    ) -> Result<Vec<CoordinatorAction>> {
        self.ensure_open()?;
        let mut actions = Vec::new();

        if self.pending.resolve(channel).is_some() {
            actions.push(CoordinatorAction::CancelJoinTimer { channel });
        }
        tracing::debug!(channel = %channel, from = %from, kind = message.kind(), "Signaling message");

        match message {
            SignalingMessage::JoinRequest => actions.extend(self.join(from)),
            SignalingMessage::LeaveNotification { peer_id } => {
                if self.leave_authorized(&from, &peer_id) {
                    actions.extend(self.remove_peer(&peer_id));
                } else {
                    self.stats.stale_leaves += 1;
                    tracing::debug!(from = %from, peer = %peer_id, "Ignoring leave report from non-parent");
                }
            }
            SignalingMessage::AssignNeighbor { .. } => {
                tracing::warn!(from = %from, "Ignoring assignment sent to the origin");
            }
        }

        actions.push(CoordinatorAction::CloseChannel { channel });
        Ok(actions)
    }

    /// A control channel closed
    ///
    /// Only matters while the channel is still waiting for its join request.
    pub fn on_channel_closed(&mut self, channel: ChannelId) -> Vec<CoordinatorAction> {
        match self.pending.resolve(channel) {
            Some(pending) => {
                tracing::debug!(channel = %channel, peer = %pending.peer, "Tentative channel closed before joining");
                vec![CoordinatorAction::CancelJoinTimer { channel }]
            }
            None => Vec::new(),
        }
    }

    /// The handshake timer of `channel` fired
    ///
    /// No-op when the join already completed.
    pub fn on_join_timeout(&mut self, channel: ChannelId) -> Vec<CoordinatorAction> {
        let Some(pending) = self.pending.resolve(channel) else {
            return Vec::new();
        };

        self.stats.handshake_timeouts += 1;
        tracing::warn!(
            channel = %channel,
            peer = %pending.peer,
            waited = ?pending.opened_at.elapsed(),
            "Join handshake timed out"
        );
        vec![CoordinatorAction::CloseChannel { channel }]
    }

    /// The direct call to `peer` ended remotely or failed
    pub fn on_root_call_closed(&mut self, peer: &PeerId) -> Vec<CoordinatorAction> {
        if self.root_call.as_ref() != Some(peer) {
            tracing::debug!(peer = %peer, "Ignoring closure of former root call");
            return Vec::new();
        }

        tracing::info!(peer = %peer, "Root call closed, removing root");
        self.root_call = None;
        self.remove_peer(peer)
    }

    /// Replace or clear the origin stream
    pub fn set_media(&mut self, stream: Option<MediaStream>) -> Result<Vec<CoordinatorAction>> {
        self.ensure_open()?;
        let mut actions = Vec::new();

        if let Some(peer) = self.root_call.take() {
            actions.push(CoordinatorAction::HangUpRoot { peer });
        }
        self.media = stream;

        let root = self.root().cloned();
        self.call_root(root, &mut actions);
        Ok(actions)
    }

    /// Stop accepting work and drop all membership
    pub fn shutdown(&mut self) -> Vec<CoordinatorAction> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let mut actions = Vec::new();

        if let Some(peer) = self.root_call.take() {
            actions.push(CoordinatorAction::HangUpRoot { peer });
        }
        for channel in self.pending.drain() {
            actions.push(CoordinatorAction::CancelJoinTimer { channel });
            actions.push(CoordinatorAction::CloseChannel { channel });
        }

        self.tree.clear();
        self.registry.clear();
        self.collector.reset();
        self.media = None;
        self.stats.members = 0;

        tracing::info!("Coordinator shut down");
        actions
    }

    fn join(&mut self, peer: PeerId) -> Vec<CoordinatorAction> {
        let mut actions = Vec::new();

        if self.registry.contains(&peer) {
            tracing::debug!(peer = %peer, "Re-entrant join, replacing membership");
            actions.extend(self.remove_peer(&peer));
        }

        let record = PeerRecord::new(peer.clone(), self.clock.next_stamp());
        self.tree
            .insert_with(record.joined_at, record.clone(), &mut self.collector);
        self.registry.register(record);

        self.stats.joins += 1;
        self.stats.members = self.registry.len() as u64;
        tracing::info!(peer = %peer, members = self.registry.len(), "Peer joined overlay");

        actions.extend(self.drain_batches());
        actions
    }

    fn remove_peer(&mut self, peer: &PeerId) -> Vec<CoordinatorAction> {
        let Some(stamp) = self.registry.get(peer).map(|record| record.joined_at) else {
            self.stats.stale_leaves += 1;
            tracing::debug!(peer = %peer, "Ignoring leave of unknown peer");
            return Vec::new();
        };

        // Former children hear about the departure before their new wiring
        let (left, right) = self.children_of(peer);
        let orphans: Vec<PeerId> = [left, right].into_iter().flatten().cloned().collect();
        let mut actions = Vec::with_capacity(orphans.len());
        for child in orphans {
            self.stats.departures_announced += 1;
            actions.push(CoordinatorAction::Send {
                to: child,
                message: SignalingMessage::leave(peer.clone()),
            });
        }

        self.tree.delete_with(&stamp, &mut self.collector);
        self.registry.unregister(peer);

        self.stats.leaves += 1;
        self.stats.members = self.registry.len() as u64;
        tracing::info!(peer = %peer, members = self.registry.len(), "Peer left overlay");

        actions.extend(self.drain_batches());
        actions
    }

    /// A leave is honoured from the peer itself or from its current parent
    fn leave_authorized(&self, from: &PeerId, peer: &PeerId) -> bool {
        from == peer || self.parent_of(peer) == Some(from)
    }

    fn drain_batches(&mut self) -> Vec<CoordinatorAction> {
        let mut actions = Vec::new();
        while let Some(batch) = self.collector.take_settled() {
            self.resolve(&batch, &mut actions);
        }
        tracing::debug!(topology = ?self.topology(), "Overlay settled");
        actions
    }

    fn resolve(&mut self, batch: &ChangeBatch<PeerId>, actions: &mut Vec<CoordinatorAction>) {
        for (parent, change) in batch.edges() {
            // Removed peers still show up as parents of the slots they vacated
            if !self.registry.contains(parent) {
                continue;
            }
            for (role, slot) in [(Role::Left, &change.left), (Role::Right, &change.right)] {
                let Some(child) = slot else {
                    continue;
                };
                let message = match child {
                    Some(child) => SignalingMessage::assign(child.clone(), role),
                    None => SignalingMessage::release(role),
                };
                self.stats.assignments_sent += 1;
                actions.push(CoordinatorAction::Send {
                    to: parent.clone(),
                    message,
                });
            }
        }

        if let Some(root) = batch.root_change() {
            let root = root.cloned();
            if self.root_call.is_some() && self.root_call != root {
                if let Some(peer) = self.root_call.take() {
                    actions.push(CoordinatorAction::HangUpRoot { peer });
                }
            }
            match &root {
                Some(peer) => tracing::info!(root = %peer, "Root changed"),
                None => tracing::info!("Overlay empty"),
            }
            self.call_root(root, actions);
        }
    }

    fn call_root(&mut self, root: Option<PeerId>, actions: &mut Vec<CoordinatorAction>) {
        let Some(peer) = root else {
            return;
        };
        if self.root_call.as_ref() == Some(&peer) {
            return;
        }
        match &self.media {
            Some(stream) => {
                self.stats.root_calls += 1;
                self.root_call = Some(peer.clone());
                actions.push(CoordinatorAction::CallRoot {
                    peer,
                    stream: stream.clone(),
                });
            }
            None => tracing::debug!(root = %peer, "No origin stream, root call deferred"),
        }
    }

    /// Current root member
    pub fn root(&self) -> Option<&PeerId> {
        self.tree.root().map(|(_, record)| &record.id)
    }

    /// Member currently receiving the direct call
    pub fn root_call(&self) -> Option<&PeerId> {
        self.root_call.as_ref()
    }

    /// Parent of a member (`None` for the root or unknown peers)
    pub fn parent_of(&self, peer: &PeerId) -> Option<&PeerId> {
        let record = self.registry.get(peer)?;
        self.tree
            .parent_of(&record.joined_at)
            .map(|parent| &parent.id)
    }

    /// Children of a member as (left, right)
    pub fn children_of(&self, peer: &PeerId) -> (Option<&PeerId>, Option<&PeerId>) {
        self.registry
            .get(peer)
            .and_then(|record| self.tree.children_of(&record.joined_at))
            .map(|(left, right)| (left.map(|r| &r.id), right.map(|r| &r.id)))
            .unwrap_or((None, None))
    }

    /// Hops from the origin to a member (the root is one hop away)
    pub fn depth_of(&self, peer: &PeerId) -> Option<usize> {
        let record = self.registry.get(peer)?;
        self.tree.depth_of(&record.joined_at)
    }

    /// Lifecycle phase of a peer
    pub fn phase_of(&self, peer: &PeerId) -> PeerPhase {
        if self.registry.contains(peer) {
            PeerPhase::Connected
        } else if self.pending.has_peer(peer) {
            PeerPhase::Pending
        } else {
            PeerPhase::Disconnected
        }
    }

    /// Snapshot of the tree shape
    pub fn topology(&self) -> Topology<PeerId> {
        Topology::capture(&self.tree)
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Height of the tree
    pub fn height(&self) -> usize {
        self.tree.height()
    }

    /// Check whether the coordinator has been shut down
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// Verify tree invariants and the tree/registry bijection
    pub fn check_consistency(&self) -> std::result::Result<(), InvariantViolation> {
        self.tree.check_invariants()?;

        let bijective = self.tree.len() == self.registry.len()
            && self.tree.iter().all(|(stamp, record)| {
                self.registry
                    .get(&record.id)
                    .is_some_and(|registered| registered.joined_at == *stamp)
            })
            && self
                .registry
                .records()
                .all(|record| self.tree.get(&record.joined_at).is_some_and(|node| node.id == record.id));
        if bijective {
            Ok(())
        } else {
            Err(InvariantViolation::LengthMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet, VecDeque};

    use proptest::prelude::*;

    use super::*;
    use crate::node::{NodeAction, NodeConfig, OverlayNode};
    use crate::transport::CallDirection;

    fn peer(id: &str) -> PeerId {
        PeerId::from(id)
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(CoordinatorConfig::default())
    }

    /// Open a channel, deliver one message and return the actions
    fn deliver(
        coordinator: &mut Coordinator,
        channel: u64,
        from: &str,
        message: SignalingMessage,
    ) -> Vec<CoordinatorAction> {
        let channel = ChannelId(channel);
        coordinator.on_channel_opened(channel, peer(from)).unwrap();
        coordinator.on_message(channel, peer(from), message).unwrap()
    }

    fn sends(actions: &[CoordinatorAction]) -> Vec<(PeerId, SignalingMessage)> {
        actions
            .iter()
            .filter_map(|action| match action {
                CoordinatorAction::Send { to, message } => Some((to.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_first_join_becomes_root() {
        let mut coordinator = coordinator();
        coordinator.set_media(Some(MediaStream::new("cam"))).unwrap();

        let actions = deliver(&mut coordinator, 1, "p1", SignalingMessage::JoinRequest);
        assert_eq!(
            actions,
            vec![
                CoordinatorAction::CancelJoinTimer { channel: ChannelId(1) },
                CoordinatorAction::CallRoot {
                    peer: peer("p1"),
                    stream: MediaStream::new("cam"),
                },
                CoordinatorAction::CloseChannel { channel: ChannelId(1) },
            ]
        );
        assert_eq!(coordinator.root(), Some(&peer("p1")));
        assert_eq!(coordinator.phase_of(&peer("p1")), PeerPhase::Connected);
    }

    #[test]
    fn test_root_call_deferred_until_media() {
        let mut coordinator = coordinator();
        let actions = deliver(&mut coordinator, 1, "p1", SignalingMessage::JoinRequest);
        assert!(!actions
            .iter()
            .any(|action| matches!(action, CoordinatorAction::CallRoot { .. })));

        let actions = coordinator.set_media(Some(MediaStream::new("cam"))).unwrap();
        assert_eq!(
            actions,
            vec![CoordinatorAction::CallRoot {
                peer: peer("p1"),
                stream: MediaStream::new("cam"),
            }]
        );

        // Replacing the stream re-calls the root
        let actions = coordinator.set_media(Some(MediaStream::new("cam-2"))).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0], CoordinatorAction::HangUpRoot { peer: peer("p1") });
    }

    #[test]
    fn test_second_join_assigns_to_root() {
        let mut coordinator = coordinator();
        deliver(&mut coordinator, 1, "p1", SignalingMessage::JoinRequest);
        let actions = deliver(&mut coordinator, 2, "p2", SignalingMessage::JoinRequest);

        assert_eq!(
            sends(&actions),
            vec![(peer("p1"), SignalingMessage::assign(peer("p2"), Role::Left))]
        );
    }

    #[test]
    fn test_fifth_join_touches_only_changed_parents() {
        let mut coordinator = coordinator();
        for (i, id) in ["p1", "p2", "p3", "p4"].iter().enumerate() {
            deliver(&mut coordinator, i as u64, id, SignalingMessage::JoinRequest);
        }
        let before = coordinator.topology();

        let actions = deliver(&mut coordinator, 9, "p5", SignalingMessage::JoinRequest);
        let after = coordinator.topology();

        let messaged: HashSet<PeerId> = sends(&actions).into_iter().map(|(to, _)| to).collect();
        let changed: HashSet<PeerId> = ["p1", "p2", "p3", "p4", "p5"]
            .iter()
            .map(|id| peer(id))
            .filter(|id| before.children(id) != after.children(id))
            .collect();

        assert!(!messaged.is_empty());
        assert_eq!(messaged, changed);
        assert!(!messaged.contains(&peer("p1")));
        assert!(!messaged.contains(&peer("p5")));
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut coordinator = coordinator();
        deliver(&mut coordinator, 1, "p1", SignalingMessage::JoinRequest);
        deliver(&mut coordinator, 2, "p2", SignalingMessage::JoinRequest);

        deliver(&mut coordinator, 3, "p2", SignalingMessage::leave(peer("p2")));
        let snapshot = coordinator.topology();
        let actions = deliver(&mut coordinator, 4, "p2", SignalingMessage::leave(peer("p2")));

        assert_eq!(actions, vec![
            CoordinatorAction::CancelJoinTimer { channel: ChannelId(4) },
            CoordinatorAction::CloseChannel { channel: ChannelId(4) },
        ]);
        assert_eq!(coordinator.topology(), snapshot);
        assert_eq!(coordinator.len(), 1);
        assert_eq!(coordinator.stats().stale_leaves, 1);
    }

    #[test]
    fn test_leave_from_non_parent_ignored() {
        let mut coordinator = coordinator();
        for (i, id) in ["p1", "p2", "p3"].iter().enumerate() {
            deliver(&mut coordinator, i as u64, id, SignalingMessage::JoinRequest);
        }
        // p2 is root with children p3 and p1; p3 is no parent of p1
        assert_eq!(coordinator.root(), Some(&peer("p2")));

        deliver(&mut coordinator, 7, "p3", SignalingMessage::leave(peer("p1")));
        assert_eq!(coordinator.len(), 3);

        deliver(&mut coordinator, 8, "p2", SignalingMessage::leave(peer("p1")));
        assert_eq!(coordinator.len(), 2);
        assert_eq!(coordinator.phase_of(&peer("p1")), PeerPhase::Disconnected);
    }

    #[test]
    fn test_rejoin_replaces_membership() {
        let mut coordinator = coordinator();
        deliver(&mut coordinator, 1, "p1", SignalingMessage::JoinRequest);
        deliver(&mut coordinator, 2, "p2", SignalingMessage::JoinRequest);
        deliver(&mut coordinator, 3, "p1", SignalingMessage::JoinRequest);

        assert_eq!(coordinator.len(), 2);
        assert_eq!(coordinator.stats().joins, 3);
        assert!(coordinator.check_consistency().is_ok());
    }

    #[test]
    fn test_handshake_timeout() {
        let mut coordinator = coordinator();
        let actions = coordinator.on_channel_opened(ChannelId(1), peer("p1")).unwrap();
        assert_eq!(actions, vec![CoordinatorAction::StartJoinTimer { channel: ChannelId(1) }]);
        assert_eq!(coordinator.phase_of(&peer("p1")), PeerPhase::Pending);

        let actions = coordinator.on_join_timeout(ChannelId(1));
        assert_eq!(actions, vec![CoordinatorAction::CloseChannel { channel: ChannelId(1) }]);
        assert_eq!(coordinator.phase_of(&peer("p1")), PeerPhase::Disconnected);
        assert!(coordinator.is_empty());

        // A late request on the expired channel still joins
        coordinator.on_message(ChannelId(1), peer("p1"), SignalingMessage::JoinRequest).unwrap();
        assert_eq!(coordinator.len(), 1);
        assert!(coordinator.on_join_timeout(ChannelId(1)).is_empty());
    }

    #[test]
    fn test_pending_channel_closed() {
        let mut coordinator = coordinator();
        coordinator.on_channel_opened(ChannelId(1), peer("p1")).unwrap();

        let actions = coordinator.on_channel_closed(ChannelId(1));
        assert_eq!(actions, vec![CoordinatorAction::CancelJoinTimer { channel: ChannelId(1) }]);
        assert!(coordinator.on_channel_closed(ChannelId(1)).is_empty());
    }

    #[test]
    fn test_root_call_closure_removes_root() {
        let mut coordinator = coordinator();
        coordinator.set_media(Some(MediaStream::new("cam"))).unwrap();
        deliver(&mut coordinator, 1, "p1", SignalingMessage::JoinRequest);
        deliver(&mut coordinator, 2, "p2", SignalingMessage::JoinRequest);

        let actions = coordinator.on_root_call_closed(&peer("p1"));
        assert_eq!(coordinator.root(), Some(&peer("p2")));
        assert!(actions.contains(&CoordinatorAction::CallRoot {
            peer: peer("p2"),
            stream: MediaStream::new("cam"),
        }));
        assert!(!actions.contains(&CoordinatorAction::HangUpRoot { peer: peer("p1") }));

        assert!(coordinator.on_root_call_closed(&peer("p1")).is_empty());
    }

    #[test]
    fn test_last_leave_hangs_up_root() {
        let mut coordinator = coordinator();
        coordinator.set_media(Some(MediaStream::new("cam"))).unwrap();
        deliver(&mut coordinator, 1, "p1", SignalingMessage::JoinRequest);

        let actions = deliver(&mut coordinator, 2, "p1", SignalingMessage::leave(peer("p1")));
        assert!(actions.contains(&CoordinatorAction::HangUpRoot { peer: peer("p1") }));
        assert!(coordinator.root_call().is_none());
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let mut coordinator = coordinator();
        coordinator.set_media(Some(MediaStream::new("cam"))).unwrap();
        deliver(&mut coordinator, 1, "p1", SignalingMessage::JoinRequest);
        coordinator.on_channel_opened(ChannelId(2), peer("p2")).unwrap();

        let actions = coordinator.shutdown();
        assert_eq!(
            actions,
            vec![
                CoordinatorAction::HangUpRoot { peer: peer("p1") },
                CoordinatorAction::CancelJoinTimer { channel: ChannelId(2) },
                CoordinatorAction::CloseChannel { channel: ChannelId(2) },
            ]
        );
        assert!(coordinator.is_empty());
        assert!(matches!(
            coordinator.on_channel_opened(ChannelId(3), peer("p3")),
            Err(Error::CoordinatorClosed)
        ));
        assert!(coordinator.shutdown().is_empty());
    }

    #[test]
    fn test_assignment_to_origin_ignored() {
        let mut coordinator = coordinator();
        let actions = deliver(
            &mut coordinator,
            1,
            "p1",
            SignalingMessage::assign(peer("p2"), Role::Left),
        );
        assert!(sends(&actions).is_empty());
        assert!(coordinator.is_empty());
    }

    proptest! {
        #[test]
        fn prop_registry_matches_tree(ops in prop::collection::vec((0u8..12, any::<bool>()), 1..120)) {
            let mut coordinator = coordinator();
            for (i, (id, join)) in ops.into_iter().enumerate() {
                let id = format!("p{}", id);
                let message = if join {
                    SignalingMessage::JoinRequest
                } else {
                    SignalingMessage::leave(peer(&id))
                };
                deliver(&mut coordinator, i as u64, &id, message);
                prop_assert!(coordinator.check_consistency().is_ok());
            }
        }

        #[test]
        fn prop_assignments_only_reach_changed_parents(
            ops in prop::collection::vec((0u8..10, any::<bool>()), 1..80)
        ) {
            let mut coordinator = coordinator();
            for (i, (id, join)) in ops.into_iter().enumerate() {
                let id = peer(&format!("p{}", id));
                // Rejoins legitimately re-send an unchanged slot
                if join == coordinator.registry.contains(&id) {
                    continue;
                }
                let message = if join {
                    SignalingMessage::JoinRequest
                } else {
                    SignalingMessage::leave(id.clone())
                };

                let before = coordinator.topology();
                let channel = ChannelId(i as u64);
                coordinator.on_channel_opened(channel, id.clone()).unwrap();
                let actions = coordinator.on_message(channel, id, message).unwrap();
                let after = coordinator.topology();

                for (to, message) in sends(&actions) {
                    if let SignalingMessage::AssignNeighbor { .. } = message {
                        prop_assert_ne!(before.children(&to), after.children(&to));
                    }
                }
            }
        }
    }

    /// Deterministic network: one FIFO queue of deliveries
    enum Delivery {
        ToCoordinator(PeerId, SignalingMessage),
        ToNode(PeerId, SignalingMessage),
        Incoming { caller: PeerId, callee: PeerId },
        Closed { from: PeerId, to: PeerId, direction: CallDirection },
    }

    struct Sim {
        origin: PeerId,
        coordinator: Coordinator,
        nodes: HashMap<PeerId, OverlayNode>,
        queue: VecDeque<Delivery>,
        offers: HashMap<(PeerId, PeerId), MediaStream>,
        links: HashSet<(PeerId, PeerId)>,
        /// Departures announced to each node, in arrival order
        notices: HashMap<PeerId, Vec<PeerId>>,
        next_channel: u64,
    }

    impl Sim {
        fn new() -> Self {
            let mut sim = Self {
                origin: peer("origin"),
                coordinator: coordinator(),
                nodes: HashMap::new(),
                queue: VecDeque::new(),
                offers: HashMap::new(),
                links: HashSet::new(),
                notices: HashMap::new(),
                next_channel: 0,
            };
            let actions = sim.coordinator.set_media(Some(MediaStream::new("cam"))).unwrap();
            sim.coordinator_actions(actions);
            sim
        }

        fn join(&mut self, id: &str) {
            let mut node = OverlayNode::new(peer(id), NodeConfig::new("origin"));
            let actions = node.join().unwrap();
            self.nodes.insert(peer(id), node);
            self.node_actions(&peer(id), actions);
            self.run();
        }

        fn leave(&mut self, id: &str) {
            let actions = self.nodes.get_mut(&peer(id)).unwrap().leave();
            self.node_actions(&peer(id), actions);
            self.run();
        }

        fn call(&mut self, caller: PeerId, callee: PeerId, stream: MediaStream) {
            self.links.remove(&(caller.clone(), callee.clone()));
            self.offers.insert((caller.clone(), callee.clone()), stream);
            self.queue.push_back(Delivery::Incoming { caller, callee });
        }

        fn hang_up(&mut self, caller: PeerId, callee: PeerId, closer: PeerId) {
            let key = (caller.clone(), callee.clone());
            let existed = self.links.remove(&key) | self.offers.remove(&key).is_some();
            if !existed {
                return;
            }
            let (to, direction) = if closer == caller {
                (callee, CallDirection::Inbound)
            } else {
                (caller, CallDirection::Outbound)
            };
            self.queue.push_back(Delivery::Closed { from: closer, to, direction });
        }

        fn coordinator_actions(&mut self, actions: Vec<CoordinatorAction>) {
            for action in actions {
                match action {
                    CoordinatorAction::Send { to, message } => {
                        self.queue.push_back(Delivery::ToNode(to, message))
                    }
                    CoordinatorAction::CallRoot { peer, stream } => {
                        self.call(self.origin.clone(), peer, stream)
                    }
                    CoordinatorAction::HangUpRoot { peer } => {
                        self.hang_up(self.origin.clone(), peer, self.origin.clone())
                    }
                    _ => {}
                }
            }
        }

        fn node_actions(&mut self, id: &PeerId, actions: Vec<NodeAction>) {
            for action in actions {
                match action {
                    NodeAction::Signal(message) => self
                        .queue
                        .push_back(Delivery::ToCoordinator(id.clone(), message)),
                    NodeAction::Call { peer, stream, .. } => self.call(id.clone(), peer, stream),
                    NodeAction::HangUp { peer } => self.hang_up(id.clone(), peer, id.clone()),
                    NodeAction::CloseUpstream { peer } => {
                        self.hang_up(peer, id.clone(), id.clone())
                    }
                    NodeAction::Answer { peer } => {
                        let key = (peer.clone(), id.clone());
                        if let Some(stream) = self.offers.remove(&key) {
                            self.links.insert(key);
                            let actions = self
                                .nodes
                                .get_mut(id)
                                .map(|node| node.on_stream(&peer, stream))
                                .unwrap_or_default();
                            self.node_actions(id, actions);
                        }
                    }
                    _ => {}
                }
            }
        }

        fn run(&mut self) {
            while let Some(delivery) = self.queue.pop_front() {
                match delivery {
                    Delivery::ToCoordinator(from, message) => {
                        self.next_channel += 1;
                        let channel = ChannelId(self.next_channel);
                        self.coordinator.on_channel_opened(channel, from.clone()).unwrap();
                        let actions = self.coordinator.on_message(channel, from, message).unwrap();
                        self.coordinator_actions(actions);
                    }
                    Delivery::ToNode(to, message) => {
                        if let SignalingMessage::LeaveNotification { peer_id } = &message {
                            self.notices.entry(to.clone()).or_default().push(peer_id.clone());
                        }
                        let origin = self.origin.clone();
                        if let Some(node) = self.nodes.get_mut(&to) {
                            let actions = node.on_signal(&origin, message);
                            self.node_actions(&to, actions);
                        }
                    }
                    Delivery::Incoming { caller, callee } => {
                        if let Some(node) = self.nodes.get_mut(&callee) {
                            let actions = node.on_incoming_call(caller);
                            self.node_actions(&callee, actions);
                        }
                    }
                    Delivery::Closed { from, to, direction } => {
                        if to == self.origin {
                            let actions = self.coordinator.on_root_call_closed(&from);
                            self.coordinator_actions(actions);
                        } else if let Some(node) = self.nodes.get_mut(&to) {
                            let actions = node.on_call_closed(&from, direction);
                            self.node_actions(&to, actions);
                        }
                    }
                }
            }
        }

        /// Media links implied by the tree, as (caller, callee)
        fn expected_links(&self) -> HashSet<(PeerId, PeerId)> {
            let topology = self.coordinator.topology();
            let mut links = HashSet::new();
            if let Some(root) = topology.root() {
                links.insert((self.origin.clone(), root.clone()));
            }
            for id in topology.depths().keys() {
                let (left, right) = topology.children(id);
                for child in [left, right].into_iter().flatten() {
                    links.insert((id.clone(), child.clone()));
                }
            }
            links
        }

        /// Hops from the origin following each node's upstream
        fn hops(&self, id: &PeerId) -> Option<usize> {
            let mut current = id.clone();
            for hops in 1..=self.nodes.len() {
                let upstream = self.nodes.get(&current)?.upstream()?.clone();
                if upstream == self.origin {
                    return Some(hops);
                }
                current = upstream;
            }
            None
        }
    }

    #[test]
    fn test_five_viewers_join_then_root_leaves() {
        let mut sim = Sim::new();
        let ids = ["p1", "p2", "p3", "p4", "p5"];
        for id in ids {
            sim.join(id);
        }

        assert_eq!(sim.coordinator.len(), 5);
        assert_eq!(sim.coordinator.root(), Some(&peer("p2")));
        assert_eq!(sim.coordinator.root_call(), Some(&peer("p2")));
        assert_eq!(sim.links, sim.expected_links());
        for id in ids {
            let hops = sim.hops(&peer(id)).expect("node not connected to origin");
            assert!(hops <= 3, "{} is {} hops away", id, hops);
            assert_eq!(Some(hops), sim.coordinator.depth_of(&peer(id)));
            assert!(sim.nodes[&peer(id)].stream().is_some());
        }

        let (left, right) = sim.coordinator.children_of(&peer("p2"));
        let former_children: Vec<PeerId> = [left, right].into_iter().flatten().cloned().collect();
        assert_eq!(former_children.len(), 2);
        let losses_before: HashMap<PeerId, u64> = former_children
            .iter()
            .map(|id| (id.clone(), sim.nodes[id].stats().upstream_losses))
            .collect();
        let root_calls_before = sim.coordinator.stats().root_calls;

        sim.leave("p2");
        sim.nodes.remove(&peer("p2"));

        assert_eq!(sim.coordinator.len(), 4);
        let new_root = sim.coordinator.root().cloned().expect("no root after leave");
        assert_ne!(new_root, peer("p2"));
        assert_eq!(sim.coordinator.root_call(), Some(&new_root));
        assert_eq!(sim.coordinator.stats().root_calls, root_calls_before + 1);
        for id in &former_children {
            assert_eq!(
                sim.notices.get(id),
                Some(&vec![peer("p2")]),
                "{} should hear of the departure exactly once",
                id
            );
            assert_eq!(
                sim.nodes[id].stats().upstream_losses,
                losses_before[id] + 1,
                "{} should lose its upstream exactly once",
                id
            );
        }
        assert_eq!(sim.coordinator.stats().departures_announced, 2);
        assert_eq!(sim.notices.values().map(Vec::len).sum::<usize>(), 2);

        assert_eq!(sim.links, sim.expected_links());
        for id in ["p1", "p3", "p4", "p5"] {
            let hops = sim.hops(&peer(id)).expect("node not reconnected");
            assert!(hops <= 3);
            assert!(sim.nodes[&peer(id)].stream().is_some());
        }
        assert!(sim.coordinator.check_consistency().is_ok());
    }

    #[test]
    fn test_crashed_leaf_reported_by_parent() {
        let mut sim = Sim::new();
        for id in ["p1", "p2", "p3"] {
            sim.join(id);
        }
        // p2 feeds p3 (left) and p1 (right)
        assert_eq!(sim.coordinator.children_of(&peer("p2")), (Some(&peer("p3")), Some(&peer("p1"))));

        sim.nodes.remove(&peer("p3"));
        sim.hang_up(peer("p2"), peer("p3"), peer("p3"));
        sim.run();

        assert_eq!(sim.coordinator.len(), 2);
        assert_eq!(sim.coordinator.phase_of(&peer("p3")), PeerPhase::Disconnected);
        assert_eq!(sim.nodes[&peer("p2")].stats().children_reported, 1);
        assert_eq!(sim.links, sim.expected_links());
    }
}
