//! Overlay node service
//!
//! Drives an [`OverlayNode`] from a [`Transport`] and reports progress as
//! [`NodeEvent`]s.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol;
use crate::registry::PeerId;
use crate::stats::NodeStats;
use crate::transport::{CallDirection, MediaStream, Transport, TransportCommand, TransportEvent};

use super::config::NodeConfig;
use super::state::{NodeAction, NodePhase, OverlayNode};

/// Events from an overlay node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The peer feeding this node changed
    UpstreamChanged(Option<PeerId>),
    /// The locally available stream changed
    StreamChanged(Option<MediaStream>),
    /// Upstream lost; waiting for a new one
    Orphaned,
    /// Grace period expired; joining again
    Rejoining,
    /// Grace period expired; no longer a member
    Detached,
    /// Left the overlay
    Left,
}

/// Point-in-time view of a node
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub phase: NodePhase,
    pub upstream: Option<PeerId>,
    pub left: Option<PeerId>,
    pub right: Option<PeerId>,
    pub stream: Option<MediaStream>,
    pub stats: NodeStats,
}

enum Request {
    Leave(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<NodeSnapshot>),
}

/// Control handle for a running [`NodeService`]
#[derive(Clone)]
pub struct NodeHandle {
    requests: mpsc::Sender<Request>,
}

impl NodeHandle {
    /// Leave the overlay and stop the service
    pub async fn leave(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Leave(tx))
            .await
            .map_err(|_| Error::NodeLeft)?;
        rx.await.map_err(|_| Error::NodeLeft)
    }

    /// Current state of the node
    pub async fn snapshot(&self) -> Result<NodeSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Snapshot(tx))
            .await
            .map_err(|_| Error::NodeLeft)?;
        rx.await.map_err(|_| Error::NodeLeft)
    }
}

/// Viewer-side overlay service
///
/// Events must be drained; the service waits when the event queue is full.
pub struct NodeService {
    core: OverlayNode,
    coordinator: PeerId,
    orphan_grace: Duration,
    transport: Transport,
    requests: mpsc::Receiver<Request>,
    events: mpsc::Sender<NodeEvent>,
    orphan_timer: Option<JoinHandle<()>>,
    /// Generation of the armed timer; expiries of older ones are ignored
    orphan_generation: u64,
    expired_tx: mpsc::UnboundedSender<u64>,
    expired_rx: mpsc::UnboundedReceiver<u64>,
}

impl NodeService {
    /// Create a service, its control handle and its event stream
    pub fn new(
        id: PeerId,
        config: NodeConfig,
        transport: Transport,
    ) -> (Self, NodeHandle, mpsc::Receiver<NodeEvent>) {
        let (request_tx, request_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();

        let service = Self {
            coordinator: config.coordinator.clone(),
            orphan_grace: config.orphan_grace,
            core: OverlayNode::new(id, config),
            transport,
            requests: request_rx,
            events: event_tx,
            orphan_timer: None,
            orphan_generation: 0,
            expired_tx,
            expired_rx,
        };
        (service, NodeHandle { requests: request_tx }, event_rx)
    }

    /// Join the overlay and relay until leaving or losing the transport
    pub async fn run(mut self) -> Result<()> {
        let actions = self.core.join()?;
        self.step(|_| actions).await;

        let result = loop {
            tokio::select! {
                event = self.transport.next_event() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        tracing::warn!(peer = %self.core.id(), "Transport closed, stopping node");
                        break Err(Error::TransportClosed);
                    }
                },
                Some(generation) = self.expired_rx.recv() => {
                    if generation == self.orphan_generation {
                        self.orphan_timer = None;
                        self.step(|core| core.on_orphan_timeout()).await;
                    }
                }
                Some(request) = self.requests.recv() => match request {
                    Request::Leave(reply) => {
                        self.step(|core| core.leave()).await;
                        let _ = reply.send(());
                        break Ok(());
                    }
                    Request::Snapshot(reply) => {
                        let _ = reply.send(self.snapshot());
                    }
                },
            }
        };

        if let Some(timer) = self.orphan_timer.take() {
            timer.abort();
        }
        result
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            phase: self.core.phase(),
            upstream: self.core.upstream().cloned(),
            left: self.core.child(protocol::Role::Left).cloned(),
            right: self.core.child(protocol::Role::Right).cloned(),
            stream: self.core.stream().cloned(),
            stats: self.core.stats().clone(),
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data {
                channel,
                peer,
                payload,
            } => {
                match protocol::decode(&payload) {
                    Ok(message) => self.step(|core| core.on_signal(&peer, message)).await,
                    Err(e) => {
                        tracing::warn!(peer = %self.core.id(), from = %peer, error = %e, "Dropping undecodable signaling payload");
                    }
                }
                self.command(TransportCommand::CloseChannel { channel });
            }
            TransportEvent::IncomingCall { peer } => {
                self.step(|core| core.on_incoming_call(peer)).await;
            }
            TransportEvent::StreamReceived { peer, stream } => {
                self.step(|core| core.on_stream(&peer, stream)).await;
            }
            TransportEvent::CallClosed { peer, direction } => {
                self.step(|core| core.on_call_closed(&peer, direction)).await;
            }
            TransportEvent::ChannelOpened { .. } | TransportEvent::ChannelClosed { .. } => {}
        }
    }

    /// Apply one input to the core, then report and carry out the outcome
    async fn step<F>(&mut self, input: F)
    where
        F: FnOnce(&mut OverlayNode) -> Vec<NodeAction>,
    {
        let phase = self.core.phase();
        let upstream = self.core.upstream().cloned();

        let actions = input(&mut self.core);

        if self.core.upstream() != upstream.as_ref() {
            self.emit(NodeEvent::UpstreamChanged(self.core.upstream().cloned()))
                .await;
        }
        let next_phase = self.core.phase();
        if next_phase != phase {
            let event = match next_phase {
                NodePhase::Orphaned => Some(NodeEvent::Orphaned),
                NodePhase::Joining if phase != NodePhase::Idle => Some(NodeEvent::Rejoining),
                NodePhase::Detached => Some(NodeEvent::Detached),
                NodePhase::Left => Some(NodeEvent::Left),
                _ => None,
            };
            if let Some(event) = event {
                self.emit(event).await;
            }
        }

        for action in actions {
            self.execute(action).await;
        }
    }

    async fn execute(&mut self, action: NodeAction) {
        match action {
            NodeAction::Signal(message) => {
                if let Err(e) = self.transport.signal(self.coordinator.clone(), &message) {
                    tracing::warn!(error = %e, "Failed to signal coordinator");
                }
            }
            NodeAction::Call { peer, role, stream } => {
                tracing::debug!(peer = %self.core.id(), child = %peer, role = %role, "Forwarding stream");
                self.command(TransportCommand::Call { peer, stream });
            }
            NodeAction::HangUp { peer } => self.command(TransportCommand::HangUp {
                peer,
                direction: CallDirection::Outbound,
            }),
            NodeAction::CloseUpstream { peer } => self.command(TransportCommand::HangUp {
                peer,
                direction: CallDirection::Inbound,
            }),
            NodeAction::Answer { peer } => self.command(TransportCommand::Answer { peer }),
            NodeAction::StreamChanged(stream) => self.emit(NodeEvent::StreamChanged(stream)).await,
            NodeAction::StartOrphanTimer => self.start_orphan_timer(),
            NodeAction::CancelOrphanTimer => {
                self.orphan_generation += 1;
                if let Some(timer) = self.orphan_timer.take() {
                    timer.abort();
                }
            }
        }
    }

    fn command(&self, command: TransportCommand) {
        if let Err(e) = self.transport.execute(command) {
            tracing::warn!(peer = %self.core.id(), error = %e, "Failed to issue transport command");
        }
    }

    async fn emit(&self, event: NodeEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event).await;
    }

    fn start_orphan_timer(&mut self) {
        self.orphan_generation += 1;
        let generation = self.orphan_generation;
        let expired = self.expired_tx.clone();
        let grace = self.orphan_grace;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = expired.send(generation);
        });
        if let Some(previous) = self.orphan_timer.replace(timer) {
            previous.abort();
        }
    }
}
