//! In-process transport
//!
//! [`MemoryNetwork`] connects any number of [`Transport`]s inside one process.
//! Each attached peer gets a router task that carries out its commands in
//! order, so per-peer ordering holds while different peers interleave freely.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::registry::PeerId;

use super::{
    CallDirection, ChannelId, MediaStream, Transport, TransportCommand, TransportEvent,
};

#[derive(Default)]
struct NetworkState {
    peers: HashMap<PeerId, mpsc::Sender<TransportEvent>>,
    next_channel: u64,
    /// channel → (opener, acceptor)
    channels: HashMap<ChannelId, (PeerId, PeerId)>,
    /// (caller, callee) → offered stream, until answered
    offers: HashMap<(PeerId, PeerId), MediaStream>,
    /// Answered calls as (caller, callee)
    calls: HashSet<(PeerId, PeerId)>,
}

type Delivery = (mpsc::Sender<TransportEvent>, TransportEvent);

impl NetworkState {
    fn to(&self, peer: &PeerId, event: TransportEvent, out: &mut Vec<Delivery>) {
        if let Some(tx) = self.peers.get(peer) {
            out.push((tx.clone(), event));
        }
    }

    fn route(&mut self, from: &PeerId, command: TransportCommand) -> Vec<Delivery> {
        let mut out = Vec::new();

        match command {
            TransportCommand::Send { peer, payload } => {
                if !self.peers.contains_key(&peer) {
                    tracing::debug!(from = %from, to = %peer, "Dropping message to detached peer");
                    return out;
                }
                self.next_channel += 1;
                let channel = ChannelId(self.next_channel);
                self.channels.insert(channel, (from.clone(), peer.clone()));

                self.to(
                    &peer,
                    TransportEvent::ChannelOpened {
                        channel,
                        peer: from.clone(),
                    },
                    &mut out,
                );
                self.to(
                    &peer,
                    TransportEvent::Data {
                        channel,
                        peer: from.clone(),
                        payload,
                    },
                    &mut out,
                );
            }
            TransportCommand::CloseChannel { channel } => {
                if let Some((opener, acceptor)) = self.channels.remove(&channel) {
                    let other = if &opener == from { acceptor } else { opener };
                    self.to(
                        &other,
                        TransportEvent::ChannelClosed {
                            channel,
                            peer: from.clone(),
                        },
                        &mut out,
                    );
                }
            }
            TransportCommand::Call { peer, stream } => {
                if !self.peers.contains_key(&peer) {
                    self.to(
                        from,
                        TransportEvent::CallClosed {
                            peer,
                            direction: CallDirection::Outbound,
                        },
                        &mut out,
                    );
                    return out;
                }
                let key = (from.clone(), peer.clone());
                self.calls.remove(&key);
                self.offers.insert(key, stream);
                self.to(
                    &peer,
                    TransportEvent::IncomingCall { peer: from.clone() },
                    &mut out,
                );
            }
            TransportCommand::Answer { peer } => {
                let key = (peer.clone(), from.clone());
                if let Some(stream) = self.offers.remove(&key) {
                    self.calls.insert(key);
                    self.to(
                        from,
                        TransportEvent::StreamReceived { peer, stream },
                        &mut out,
                    );
                }
            }
            TransportCommand::HangUp { peer, direction } => {
                let (key, remote_direction) = match direction {
                    CallDirection::Outbound => ((from.clone(), peer.clone()), CallDirection::Inbound),
                    CallDirection::Inbound => ((peer.clone(), from.clone()), CallDirection::Outbound),
                };
                let existed = self.calls.remove(&key) | self.offers.remove(&key).is_some();
                if existed {
                    self.to(
                        &peer,
                        TransportEvent::CallClosed {
                            peer: from.clone(),
                            direction: remote_direction,
                        },
                        &mut out,
                    );
                }
            }
        }
        out
    }

    fn detach(&mut self, peer: &PeerId) -> Vec<Delivery> {
        let mut out = Vec::new();
        if self.peers.remove(peer).is_none() {
            return out;
        }

        let channels: Vec<_> = self
            .channels
            .iter()
            .filter(|(_, (a, b))| a == peer || b == peer)
            .map(|(channel, ends)| (*channel, ends.clone()))
            .collect();
        for (channel, (opener, acceptor)) in channels {
            self.channels.remove(&channel);
            let other = if &opener == peer { acceptor } else { opener };
            self.to(
                &other,
                TransportEvent::ChannelClosed {
                    channel,
                    peer: peer.clone(),
                },
                &mut out,
            );
        }

        let links: Vec<_> = self
            .calls
            .iter()
            .chain(self.offers.keys())
            .filter(|(caller, callee)| caller == peer || callee == peer)
            .cloned()
            .collect();
        for (caller, callee) in links {
            self.calls.remove(&(caller.clone(), callee.clone()));
            self.offers.remove(&(caller.clone(), callee.clone()));
            let (other, direction) = if &caller == peer {
                (callee, CallDirection::Inbound)
            } else {
                (caller, CallDirection::Outbound)
            };
            self.to(
                &other,
                TransportEvent::CallClosed {
                    peer: peer.clone(),
                    direction,
                },
                &mut out,
            );
        }

        tracing::debug!(peer = %peer, "Peer detached from memory network");
        out
    }
}

async fn deliver(deliveries: Vec<Delivery>) {
    for (tx, event) in deliveries {
        // A receiver that went away is about to be detached
        let _ = tx.send(event).await;
    }
}

/// Simulated network of in-process peers
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer and return its transport
    ///
    /// Dropping the transport detaches the peer once its queued commands are
    /// carried out.
    pub async fn attach(&self, peer: PeerId, event_capacity: usize) -> Transport {
        let (transport, mut backend) = Transport::pair(event_capacity);
        let attachment = backend.events.downgrade();
        let stale = {
            let mut state = self.state.lock().await;
            let stale = state.detach(&peer);
            state.peers.insert(peer.clone(), backend.events);
            stale
        };
        deliver(stale).await;
        tracing::debug!(peer = %peer, "Peer attached to memory network");

        let network = self.clone();
        tokio::spawn(async move {
            while let Some(command) = backend.commands.recv().await {
                let deliveries = network.state.lock().await.route(&peer, command);
                deliver(deliveries).await;
            }
            // A later attach under the same id owns the entry now
            let deliveries = {
                let mut state = network.state.lock().await;
                let current = state.peers.get(&peer).and_then(|tx| {
                    attachment.upgrade().filter(|ours| ours.same_channel(tx))
                });
                match current {
                    Some(_) => state.detach(&peer),
                    None => Vec::new(),
                }
            };
            deliver(deliveries).await;
        });

        transport
    }

    /// Remove a peer abruptly, as if it crashed
    ///
    /// Every counterpart of its channels and calls is told the connection
    /// closed.
    pub async fn detach(&self, peer: &PeerId) {
        let deliveries = self.state.lock().await.detach(peer);
        deliver(deliveries).await;
    }

    /// Check whether a peer is attached
    pub async fn is_attached(&self, peer: &PeerId) -> bool {
        self.state.lock().await.peers.contains_key(peer)
    }

    /// Answered media calls as `(caller, callee)` pairs
    pub async fn calls(&self) -> Vec<(PeerId, PeerId)> {
        let mut calls: Vec<_> = self.state.lock().await.calls.iter().cloned().collect();
        calls.sort();
        calls
    }
}
