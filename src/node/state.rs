//! Overlay node state machine
//!
//! [`OverlayNode`] is transport-agnostic: every input returns the
//! [`NodeAction`]s the driver must carry out, in order.

use crate::error::{Error, Result};
use crate::protocol::{Role, SignalingMessage};
use crate::registry::PeerId;
use crate::stats::NodeStats;
use crate::transport::{CallDirection, MediaStream};

use super::config::NodeConfig;

/// Lifecycle phase of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    /// Created, no join sent yet
    Idle,
    /// Join request sent, waiting for an upstream call
    Joining,
    /// Receiving from an upstream peer
    Attached,
    /// Upstream lost, waiting out the grace period
    Orphaned,
    /// Grace period expired without rejoining
    Detached,
    /// Left the overlay; terminal
    Left,
}

/// Side effect requested by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    /// Send a signaling message to the coordinator
    Signal(SignalingMessage),
    /// Call a child with the current stream
    Call {
        peer: PeerId,
        role: Role,
        stream: MediaStream,
    },
    /// End the call we placed to a child
    HangUp { peer: PeerId },
    /// End the call an upstream peer placed to us
    CloseUpstream { peer: PeerId },
    /// Answer an inbound call
    Answer { peer: PeerId },
    /// The locally available stream changed
    StreamChanged(Option<MediaStream>),
    /// Arm the orphan grace timer
    StartOrphanTimer,
    /// Disarm the orphan grace timer
    CancelOrphanTimer,
}

/// Downstream slot: the assigned child and whether we are calling it
#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    target: PeerId,
    live: bool,
}

/// Local view of one overlay member
#[derive(Debug)]
pub struct OverlayNode {
    id: PeerId,
    config: NodeConfig,
    phase: NodePhase,
    upstream: Option<PeerId>,
    stream: Option<MediaStream>,
    left: Option<Slot>,
    right: Option<Slot>,
    stats: NodeStats,
}

impl OverlayNode {
    pub fn new(id: PeerId, config: NodeConfig) -> Self {
        Self {
            id,
            config,
            phase: NodePhase::Idle,
            upstream: None,
            stream: None,
            left: None,
            right: None,
            stats: NodeStats::new(),
        }
    }

    /// Ask the coordinator for a place in the tree
    pub fn join(&mut self) -> Result<Vec<NodeAction>> {
        if self.phase == NodePhase::Left {
            return Err(Error::NodeLeft);
        }
        if self.phase != NodePhase::Attached {
            self.phase = NodePhase::Joining;
        }

        tracing::info!(peer = %self.id, coordinator = %self.config.coordinator, "Joining overlay");
        Ok(vec![NodeAction::Signal(SignalingMessage::JoinRequest)])
    }

    /// Handle a signaling message from `from`
    pub fn on_signal(&mut self, from: &PeerId, message: SignalingMessage) -> Vec<NodeAction> {
        if self.phase == NodePhase::Left {
            return Vec::new();
        }

        if from != &self.config.coordinator {
            tracing::warn!(peer = %self.id, from = %from, kind = message.kind(), "Ignoring signal from non-coordinator");
            return Vec::new();
        }

        match message {
            SignalingMessage::AssignNeighbor { target_peer, role } => self.assign(target_peer, role),
            SignalingMessage::LeaveNotification { peer_id } => {
                if self.upstream.as_ref() == Some(&peer_id) {
                    self.upstream_departed(peer_id)
                } else {
                    self.forget_child(&peer_id)
                }
            }
            SignalingMessage::JoinRequest => {
                tracing::warn!(peer = %self.id, "Ignoring join request sent to a viewer");
                Vec::new()
            }
        }
    }

    fn assign(&mut self, target: Option<PeerId>, role: Role) -> Vec<NodeAction> {
        self.stats.assignments += 1;
        let mut actions = Vec::new();

        let Some(target) = target else {
            if let Some(old) = self.slot_mut(role).take() {
                tracing::debug!(peer = %self.id, role = %role, child = %old.target, "Slot released");
                if old.live {
                    actions.push(NodeAction::HangUp { peer: old.target });
                }
            }
            return actions;
        };

        if target == self.id {
            tracing::warn!(peer = %self.id, role = %role, "Ignoring assignment to self");
            return actions;
        }

        if let Some(slot) = self.slot(role) {
            if slot.target == target {
                if slot.live {
                    return actions;
                }
            } else if slot.live {
                actions.push(NodeAction::HangUp {
                    peer: slot.target.clone(),
                });
            }
        }

        tracing::debug!(peer = %self.id, role = %role, child = %target, "Child assigned");
        *self.slot_mut(role) = Some(Slot {
            target,
            live: false,
        });
        self.feed(role, &mut actions);
        actions
    }

    /// Call the slot's child if we have something to send it
    fn feed(&mut self, role: Role, actions: &mut Vec<NodeAction>) {
        let Some(stream) = self.stream.clone() else {
            return;
        };
        let slot = match role {
            Role::Left => &mut self.left,
            Role::Right => &mut self.right,
        };
        if let Some(slot) = slot.as_mut().filter(|slot| !slot.live) {
            slot.live = true;
            self.stats.forwards += 1;
            actions.push(NodeAction::Call {
                peer: slot.target.clone(),
                role,
                stream,
            });
        }
    }

    /// The coordinator announced that our upstream left
    ///
    /// Whichever of the announcement and the call closure arrives second finds
    /// the upstream already cleared and is ignored.
    fn upstream_departed(&mut self, peer: PeerId) -> Vec<NodeAction> {
        self.stats.departures_heard += 1;
        tracing::debug!(peer = %self.id, upstream = %peer, "Upstream departure announced");

        let mut actions = vec![NodeAction::CloseUpstream { peer }];
        actions.extend(self.upstream_lost());
        actions
    }

    fn forget_child(&mut self, peer: &PeerId) -> Vec<NodeAction> {
        let Some(role) = self.role_of(peer) else {
            return Vec::new();
        };
        match self.slot_mut(role).take() {
            Some(slot) if slot.live => vec![NodeAction::HangUp { peer: slot.target }],
            _ => Vec::new(),
        }
    }

    /// Handle an inbound media call
    pub fn on_incoming_call(&mut self, from: PeerId) -> Vec<NodeAction> {
        if self.phase == NodePhase::Left || from == self.id {
            return vec![NodeAction::CloseUpstream { peer: from }];
        }
        let mut actions = Vec::new();

        // A child calling us has been rotated above us
        if let Some(role) = self.role_of(&from) {
            if let Some(slot) = self.slot_mut(role).take() {
                tracing::debug!(peer = %self.id, role = %role, child = %from, "Child promoted above this node");
                if slot.live {
                    actions.push(NodeAction::HangUp { peer: slot.target });
                }
            }
        }

        match self.upstream.replace(from.clone()) {
            Some(previous) if previous == from => {}
            Some(previous) => {
                self.stats.upstream_changes += 1;
                actions.push(NodeAction::CloseUpstream { peer: previous });
            }
            None => self.stats.upstream_changes += 1,
        }
        if self.phase == NodePhase::Orphaned {
            actions.push(NodeAction::CancelOrphanTimer);
        }
        if self.phase != NodePhase::Attached {
            tracing::info!(peer = %self.id, upstream = %from, "Attached to upstream");
        }
        self.phase = NodePhase::Attached;

        actions.push(NodeAction::Answer { peer: from });
        actions
    }

    /// Handle media arriving on an answered call
    pub fn on_stream(&mut self, from: &PeerId, stream: MediaStream) -> Vec<NodeAction> {
        if self.upstream.as_ref() != Some(from) {
            tracing::debug!(peer = %self.id, from = %from, "Ignoring stream from former upstream");
            return Vec::new();
        }
        let mut actions = Vec::new();

        if self.stream.as_ref() != Some(&stream) {
            self.stream = Some(stream.clone());
            actions.push(NodeAction::StreamChanged(Some(stream)));
            for slot in [&mut self.left, &mut self.right].into_iter().flatten() {
                slot.live = false;
            }
        }
        for role in Role::ALL {
            self.feed(role, &mut actions);
        }
        actions
    }

    /// Handle a media call that closed remotely or failed
    pub fn on_call_closed(&mut self, peer: &PeerId, direction: CallDirection) -> Vec<NodeAction> {
        if self.phase == NodePhase::Left {
            return Vec::new();
        }

        match direction {
            CallDirection::Inbound if self.upstream.as_ref() == Some(peer) => self.upstream_lost(),
            CallDirection::Outbound => match self.role_of(peer) {
                Some(role) if self.slot(role).is_some_and(|slot| slot.live) => {
                    self.downstream_lost(role)
                }
                _ => {
                    tracing::debug!(peer = %self.id, child = %peer, "Ignoring closure of former child");
                    Vec::new()
                }
            },
            CallDirection::Inbound => {
                tracing::debug!(peer = %self.id, from = %peer, "Ignoring closure of former upstream");
                Vec::new()
            }
        }
    }

    fn upstream_lost(&mut self) -> Vec<NodeAction> {
        let mut actions = Vec::new();
        self.upstream = None;
        self.stats.upstream_losses += 1;

        if self.stream.take().is_some() {
            actions.push(NodeAction::StreamChanged(None));
        }
        for slot in [&mut self.left, &mut self.right].into_iter().flatten() {
            if slot.live {
                slot.live = false;
                actions.push(NodeAction::HangUp {
                    peer: slot.target.clone(),
                });
            }
        }

        self.phase = NodePhase::Orphaned;
        tracing::warn!(peer = %self.id, grace = ?self.config.orphan_grace, "Upstream lost");

        if self.config.orphan_grace.is_zero() {
            actions.extend(self.on_orphan_timeout());
        } else {
            actions.push(NodeAction::StartOrphanTimer);
        }
        actions
    }

    fn downstream_lost(&mut self, role: Role) -> Vec<NodeAction> {
        // The slot is cleared, so later closures of this child are ignored
        let Some(slot) = self.slot_mut(role).take() else {
            return Vec::new();
        };

        self.stats.children_reported += 1;
        tracing::info!(peer = %self.id, role = %role, child = %slot.target, "Child disconnected");
        vec![NodeAction::Signal(SignalingMessage::leave(slot.target))]
    }

    /// Handle expiry of the orphan grace period
    pub fn on_orphan_timeout(&mut self) -> Vec<NodeAction> {
        if self.phase != NodePhase::Orphaned {
            return Vec::new();
        }
        self.stats.orphan_expiries += 1;

        // The coordinator re-parents our former children
        self.left = None;
        self.right = None;

        if self.config.rejoin_on_orphan {
            self.phase = NodePhase::Joining;
            tracing::info!(peer = %self.id, "Orphan grace expired, rejoining");
            vec![NodeAction::Signal(SignalingMessage::JoinRequest)]
        } else {
            self.phase = NodePhase::Detached;
            tracing::info!(peer = %self.id, "Orphan grace expired, leaving");
            vec![NodeAction::Signal(SignalingMessage::leave(self.id.clone()))]
        }
    }

    /// Leave the overlay for good
    pub fn leave(&mut self) -> Vec<NodeAction> {
        if self.phase == NodePhase::Left {
            return Vec::new();
        }
        let mut actions = vec![NodeAction::Signal(SignalingMessage::leave(self.id.clone()))];

        for slot in [self.left.take(), self.right.take()].into_iter().flatten() {
            if slot.live {
                actions.push(NodeAction::HangUp { peer: slot.target });
            }
        }
        if let Some(upstream) = self.upstream.take() {
            actions.push(NodeAction::CloseUpstream { peer: upstream });
        }
        if self.phase == NodePhase::Orphaned {
            actions.push(NodeAction::CancelOrphanTimer);
        }
        if self.stream.take().is_some() {
            actions.push(NodeAction::StreamChanged(None));
        }

        self.phase = NodePhase::Left;
        tracing::info!(peer = %self.id, "Left overlay");
        actions
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn phase(&self) -> NodePhase {
        self.phase
    }

    /// Peer currently feeding us
    pub fn upstream(&self) -> Option<&PeerId> {
        self.upstream.as_ref()
    }

    /// Stream currently relayed
    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    /// Child assigned to a slot, live or latched
    pub fn child(&self, role: Role) -> Option<&PeerId> {
        self.slot(role).map(|slot| &slot.target)
    }

    /// Check whether we are calling the slot's child
    pub fn is_forwarding(&self, role: Role) -> bool {
        self.slot(role).is_some_and(|slot| slot.live)
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    fn slot(&self, role: Role) -> Option<&Slot> {
        match role {
            Role::Left => self.left.as_ref(),
            Role::Right => self.right.as_ref(),
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<Slot> {
        match role {
            Role::Left => &mut self.left,
            Role::Right => &mut self.right,
        }
    }

    fn role_of(&self, peer: &PeerId) -> Option<Role> {
        Role::ALL
            .into_iter()
            .find(|role| self.slot(*role).is_some_and(|slot| &slot.target == peer))
    }
}
