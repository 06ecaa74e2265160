//! Raw channel capability.
//!
//! The state machine never performs network I/O itself. It asks a
//! [`Transport`] for a connectivity payload to put in its descriptor, and once
//! both descriptors are known asks it to open a [`RawChannel`] to the peer.
//! The transport also hands back the shared secret its connectivity
//! negotiation produced; the secure channel keys are derived from it.

pub mod memory;

pub use memory::*;

use crate::crypto::Role;
use crate::network::PeerId;
use crate::signaling::{IceCandidate, LocalCapabilities, SessionDescriptor};
use crate::utils::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

/// Everything a transport needs to open a channel to a peer
#[derive(Debug)]
pub struct ChannelRequest {
    /// Local peer
    pub local_peer: PeerId,
    /// Remote peer
    pub remote_peer: PeerId,
    /// Local role in the descriptor exchange
    pub role: Role,
    /// The initiator's offer
    pub offer: SessionDescriptor,
    /// The responder's answer
    pub answer: SessionDescriptor,
    /// Remote candidates received so far, in arrival order
    pub candidates: Vec<IceCandidate>,
    /// Remote candidates that arrive while the open is in flight, in order
    pub trickle: mpsc::UnboundedReceiver<IceCandidate>,
}

impl ChannelRequest {
    /// Descriptor this endpoint produced
    pub fn local_descriptor(&self) -> &SessionDescriptor {
        match self.role {
            Role::Initiator => &self.offer,
            Role::Responder => &self.answer,
        }
    }

    /// Descriptor the remote endpoint produced
    pub fn remote_descriptor(&self) -> &SessionDescriptor {
        match self.role {
            Role::Initiator => &self.answer,
            Role::Responder => &self.offer,
        }
    }
}

/// Result of a successful open
pub struct OpenedChannel {
    /// Bidirectional byte channel to the peer
    pub channel: Arc<dyn RawChannel>,
    /// Secret agreed during connectivity negotiation
    pub shared_secret: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for OpenedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedChannel")
            .field("shared_secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Connectivity engine consumed by peer sessions
#[async_trait]
pub trait Transport: Send + Sync {
    /// Produce the connectivity payload for a descriptor sent to `remote`
    async fn local_capabilities(&self, local: &PeerId, remote: &PeerId) -> Result<LocalCapabilities>;

    /// Open a channel using both negotiated descriptors and remote candidates
    async fn open_channel(&self, request: ChannelRequest) -> Result<OpenedChannel>;
}

/// Bidirectional frame channel opened by a [`Transport`]
#[async_trait]
pub trait RawChannel: Send + Sync {
    /// Send one frame
    async fn write(&self, frame: Vec<u8>) -> Result<()>;

    /// Inbound frames in delivery order; ends when the channel closes
    fn read_stream(&self) -> BoxStream<'static, Vec<u8>>;

    /// Close both directions; idempotent
    async fn close(&self);
}
