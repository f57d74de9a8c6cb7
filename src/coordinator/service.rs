//! Coordinator service
//!
//! Drives a [`Coordinator`] from a [`Transport`]: decodes signaling, arms
//! handshake timers and turns actions into transport commands. One task owns
//! the coordinator, so tree mutations never interleave.

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol;
use crate::registry::PeerId;
use crate::stats::CoordinatorStats;
use crate::transport::{
    CallDirection, ChannelId, MediaStream, Transport, TransportCommand, TransportEvent,
};
use crate::tree::Topology;

use super::config::CoordinatorConfig;
use super::engine::{Coordinator, CoordinatorAction};

enum Request {
    SetMedia(Option<MediaStream>, oneshot::Sender<Result<()>>),
    Stats(oneshot::Sender<CoordinatorStats>),
    Topology(oneshot::Sender<Topology<PeerId>>),
    Shutdown,
}

/// Cloneable control handle for a running [`CoordinatorService`]
#[derive(Clone)]
pub struct CoordinatorHandle {
    requests: mpsc::Sender<Request>,
}

impl CoordinatorHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| Error::CoordinatorClosed)?;
        rx.await.map_err(|_| Error::CoordinatorClosed)
    }

    /// Replace or clear the stream pushed to the root
    pub async fn set_media(&self, stream: Option<MediaStream>) -> Result<()> {
        self.request(|reply| Request::SetMedia(stream, reply)).await?
    }

    /// Snapshot of the coordinator counters
    pub async fn stats(&self) -> Result<CoordinatorStats> {
        self.request(Request::Stats).await
    }

    /// Snapshot of the tree shape
    pub async fn topology(&self) -> Result<Topology<PeerId>> {
        self.request(Request::Topology).await
    }

    /// Stop the service; the coordinator cannot be restarted
    pub async fn shutdown(&self) -> Result<()> {
        self.requests
            .send(Request::Shutdown)
            .await
            .map_err(|_| Error::CoordinatorClosed)
    }
}

/// Origin-side overlay service
pub struct CoordinatorService {
    core: Coordinator,
    transport: Transport,
    requests: mpsc::Receiver<Request>,
    timers: HashMap<ChannelId, JoinHandle<()>>,
    expired_tx: mpsc::UnboundedSender<ChannelId>,
    expired_rx: mpsc::UnboundedReceiver<ChannelId>,
}

impl CoordinatorService {
    /// Create a service and its control handle
    pub fn new(config: CoordinatorConfig, transport: Transport) -> (Self, CoordinatorHandle) {
        let (request_tx, request_rx) = mpsc::channel(config.command_capacity);
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();

        let service = Self {
            core: Coordinator::new(config),
            transport,
            requests: request_rx,
            timers: HashMap::new(),
            expired_tx,
            expired_rx,
        };
        (service, CoordinatorHandle { requests: request_tx })
    }

    /// Run until shut down through the handle or the transport goes away
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run with an external shutdown signal
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!("Coordinator running");

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break Ok(());
                }
                event = self.transport.next_event() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        tracing::warn!("Transport closed, stopping coordinator");
                        break Err(Error::TransportClosed);
                    }
                },
                Some(channel) = self.expired_rx.recv() => {
                    self.timers.remove(&channel);
                    let actions = self.core.on_join_timeout(channel);
                    self.execute(actions);
                }
                Some(request) = self.requests.recv() => {
                    if self.handle_request(request) {
                        break Ok(());
                    }
                }
            }
        };

        let actions = self.core.shutdown();
        self.execute(actions);
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        result
    }

    /// Returns `true` when the service must stop
    fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::SetMedia(stream, reply) => {
                let result = match self.core.set_media(stream) {
                    Ok(actions) => {
                        self.execute(actions);
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Request::Stats(reply) => {
                let _ = reply.send(self.core.stats().clone());
            }
            Request::Topology(reply) => {
                let _ = reply.send(self.core.topology());
            }
            Request::Shutdown => return true,
        }
        false
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ChannelOpened { channel, peer } => {
                let result = self.core.on_channel_opened(channel, peer);
                self.execute_or_close(channel, result);
            }
            TransportEvent::Data {
                channel,
                peer,
                payload,
            } => match protocol::decode(&payload) {
                Ok(message) => {
                    let result = self.core.on_message(channel, peer, message);
                    self.execute_or_close(channel, result);
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, peer = %peer, error = %e, "Dropping undecodable signaling payload");
                    let mut actions = self.core.on_channel_closed(channel);
                    actions.push(CoordinatorAction::CloseChannel { channel });
                    self.execute(actions);
                }
            },
            TransportEvent::ChannelClosed { channel, .. } => {
                let actions = self.core.on_channel_closed(channel);
                self.execute(actions);
            }
            TransportEvent::IncomingCall { peer } => {
                tracing::warn!(peer = %peer, "Rejecting media call to the origin");
                let command = TransportCommand::HangUp {
                    peer,
                    direction: CallDirection::Inbound,
                };
                if let Err(e) = self.transport.execute(command) {
                    tracing::warn!(error = %e, "Failed to reject call");
                }
            }
            TransportEvent::CallClosed {
                peer,
                direction: CallDirection::Outbound,
            } => {
                let actions = self.core.on_root_call_closed(&peer);
                self.execute(actions);
            }
            TransportEvent::CallClosed { .. } | TransportEvent::StreamReceived { .. } => {}
        }
    }

    fn execute_or_close(&mut self, channel: ChannelId, result: Result<Vec<CoordinatorAction>>) {
        match result {
            Ok(actions) => self.execute(actions),
            Err(e) => {
                tracing::debug!(channel = %channel, error = %e, "Rejecting control channel");
                self.execute(vec![CoordinatorAction::CloseChannel { channel }]);
            }
        }
    }

    fn execute(&mut self, actions: Vec<CoordinatorAction>) {
        for action in actions {
            let result = match action {
                CoordinatorAction::Send { to, message } => self.transport.signal(to, &message),
                CoordinatorAction::CloseChannel { channel } => self
                    .transport
                    .execute(TransportCommand::CloseChannel { channel }),
                CoordinatorAction::CallRoot { peer, stream } => {
                    tracing::debug!(root = %peer, stream = stream.id(), "Calling root");
                    self.transport
                        .execute(TransportCommand::Call { peer, stream })
                }
                CoordinatorAction::HangUpRoot { peer } => {
                    self.transport.execute(TransportCommand::HangUp {
                        peer,
                        direction: CallDirection::Outbound,
                    })
                }
                CoordinatorAction::StartJoinTimer { channel } => {
                    self.start_timer(channel);
                    Ok(())
                }
                CoordinatorAction::CancelJoinTimer { channel } => {
                    if let Some(timer) = self.timers.remove(&channel) {
                        timer.abort();
                    }
                    Ok(())
                }
            };

            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to carry out coordinator action");
            }
        }
    }

    fn start_timer(&mut self, channel: ChannelId) {
        let expired = self.expired_tx.clone();
        let timeout = self.core.config().join_timeout;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = expired.send(channel);
        });
        if let Some(previous) = self.timers.insert(channel, timer) {
            previous.abort();
        }
    }
}
