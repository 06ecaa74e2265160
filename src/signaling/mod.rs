//! Session descriptor exchange.
//!
//! Builds and parses the offer, answer and candidate messages two peers trade
//! out of band before a raw channel exists. Nothing in this module performs
//! I/O except through the [`SignalingChannel`] capability.

pub mod descriptor;
pub mod loopback;
pub mod message;

pub use descriptor::*;
pub use loopback::*;
pub use message::*;

use crate::network::PeerId;
use crate::utils::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Largest signaling frame accepted by default (64 KiB)
pub const MAX_SIGNAL_SIZE: usize = 64 * 1024;

/// Out-of-band carrier for signaling frames
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Deliver an encoded frame to `to`
    async fn send(&self, to: &PeerId, frame: Vec<u8>) -> Result<()>;

    /// Frames addressed to this endpoint, from the moment of the call onwards
    fn incoming(&self) -> BoxStream<'static, Vec<u8>>;
}
