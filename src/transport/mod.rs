//! Transport collaborator interface
//!
//! The overlay never touches sockets or media engines. It talks to a
//! transport through two queues:
//!
//! ```text
//!                 TransportCommand (unbounded)
//!   overlay ──────────────────────────────────► transport backend
//!   service ◄────────────────────────────────── (WebRTC, QUIC, in-memory…)
//!                 TransportEvent (bounded)
//! ```
//!
//! # Contract
//!
//! - `Send` opens a control channel to the peer and delivers one payload.
//!   The receiver sees `ChannelOpened` followed by `Data` on the same channel.
//! - `Call` to a peer already called replaces the previous call.
//! - `CallClosed` reports closures initiated by the remote side or failures
//!   (including calls to unreachable peers). Hang-ups issued locally are not
//!   echoed back.
//! - Per-channel and per-peer-pair ordering is preserved; nothing else is.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{self, SignalingMessage};
use crate::registry::PeerId;

/// Identifier of a control channel, unique per transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// Opaque handle to a live media stream owned by the media collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaStream {
    id: Arc<str>,
}

impl MediaStream {
    /// Wrap a stream identifier
    pub fn new(id: impl AsRef<str>) -> Self {
        Self {
            id: Arc::from(id.as_ref()),
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Which side placed a media call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallDirection {
    /// The remote peer called us (our upstream)
    Inbound,
    /// We called the remote peer (our downstream)
    Outbound,
}

/// Notification from the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer opened a control channel to us
    ChannelOpened { channel: ChannelId, peer: PeerId },
    /// A control payload arrived
    Data {
        channel: ChannelId,
        peer: PeerId,
        payload: Bytes,
    },
    /// A control channel closed
    ChannelClosed { channel: ChannelId, peer: PeerId },
    /// A peer is calling us with media
    IncomingCall { peer: PeerId },
    /// An answered inbound call started delivering media
    StreamReceived { peer: PeerId, stream: MediaStream },
    /// A media call ended remotely or failed
    CallClosed {
        peer: PeerId,
        direction: CallDirection,
    },
}

/// Instruction for the transport
#[derive(Debug, Clone)]
pub enum TransportCommand {
    /// Open a control channel to `peer` and deliver `payload`
    Send { peer: PeerId, payload: Bytes },
    /// Close a control channel
    CloseChannel { channel: ChannelId },
    /// Call `peer`, pushing `stream`
    Call { peer: PeerId, stream: MediaStream },
    /// Answer an inbound call without sending media back
    Answer { peer: PeerId },
    /// End a media call with `peer`
    HangUp {
        peer: PeerId,
        direction: CallDirection,
    },
}

/// Overlay side of a transport
pub struct Transport {
    commands: mpsc::UnboundedSender<TransportCommand>,
    events: mpsc::Receiver<TransportEvent>,
}

/// Backend side of a transport, held by the collaborator implementation
pub struct TransportBackend {
    /// Commands issued by the overlay
    pub commands: mpsc::UnboundedReceiver<TransportCommand>,
    /// Events for the overlay
    pub events: mpsc::Sender<TransportEvent>,
}

impl Transport {
    /// Create a connected overlay/backend pair
    pub fn pair(event_capacity: usize) -> (Self, TransportBackend) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(event_capacity);

        let transport = Self {
            commands: command_tx,
            events: event_rx,
        };
        let backend = TransportBackend {
            commands: command_rx,
            events: event_tx,
        };
        (transport, backend)
    }

    /// Queue a command without waiting for it to be carried out
    pub fn execute(&self, command: TransportCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::TransportClosed)
    }

    /// Encode and send a signaling message to `peer`
    pub fn signal(&self, peer: PeerId, message: &SignalingMessage) -> Result<()> {
        let payload = protocol::encode(message)?;
        tracing::debug!(peer = %peer, kind = message.kind(), "Sending signaling message");
        self.execute(TransportCommand::Send { peer, payload })
    }

    /// Wait for the next event (`None` once the backend is gone)
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}
