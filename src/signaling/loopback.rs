//! In-process signaling for tests, demos and single-host setups.

use crate::network::PeerId;
use crate::signaling::SignalingChannel;
use crate::utils::{Result, TransportError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

const INBOX_CAPACITY: usize = 256;

/// Shared switchboard connecting [`LoopbackSignaling`] endpoints
#[derive(Debug, Clone, Default)]
pub struct SignalingHub {
    inboxes: Arc<Mutex<HashMap<PeerId, broadcast::Sender<Vec<u8>>>>>,
}

impl SignalingHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or reattach to) the endpoint for `peer_id`
    pub fn endpoint(&self, peer_id: PeerId) -> LoopbackSignaling {
        let inbox = self
            .inboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(peer_id.clone())
            .or_insert_with(|| broadcast::channel(INBOX_CAPACITY).0)
            .clone();

        LoopbackSignaling {
            local_peer_id: peer_id,
            hub: self.clone(),
            inbox,
        }
    }

    fn inbox_of(&self, peer_id: &PeerId) -> Option<broadcast::Sender<Vec<u8>>> {
        self.inboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
    }
}

/// One peer's attachment to a [`SignalingHub`]
#[derive(Debug, Clone)]
pub struct LoopbackSignaling {
    local_peer_id: PeerId,
    hub: SignalingHub,
    inbox: broadcast::Sender<Vec<u8>>,
}

impl LoopbackSignaling {
    /// Peer this endpoint receives for
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }
}

#[async_trait]
impl SignalingChannel for LoopbackSignaling {
    async fn send(&self, to: &PeerId, frame: Vec<u8>) -> Result<()> {
        let inbox = self.hub.inbox_of(to).ok_or_else(|| TransportError::WriteFailed {
            reason: format!("no signaling endpoint for {to}"),
        })?;

        log::trace!("Signal {} -> {} ({} bytes)", self.local_peer_id, to, frame.len());
        inbox.send(frame).map_err(|_| TransportError::WriteFailed {
            reason: format!("{to} is not listening for signals"),
        })?;
        Ok(())
    }

    fn incoming(&self) -> BoxStream<'static, Vec<u8>> {
        let peer = self.local_peer_id.clone();
        stream::unfold(self.inbox.subscribe(), move |mut receiver| {
            let peer = peer.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(frame) => return Some((frame, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("Signaling inbox of {} lagged, {} frames lost", peer, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::parse(name).unwrap()
    }

    #[tokio::test]
    async fn test_frames_reach_the_addressed_endpoint() {
        let hub = SignalingHub::new();
        let alice = hub.endpoint(peer("alice"));
        let bob = hub.endpoint(peer("bob"));

        let mut inbox = bob.incoming();
        alice.send(&peer("bob"), b"offer".to_vec()).await.unwrap();
        assert_eq!(inbox.next().await, Some(b"offer".to_vec()));
    }

    #[tokio::test]
    async fn test_unknown_or_deaf_recipient_is_an_error() {
        let hub = SignalingHub::new();
        let alice = hub.endpoint(peer("alice"));
        let _bob = hub.endpoint(peer("bob"));

        assert!(alice.send(&peer("carol"), vec![1]).await.is_err());
        // bob exists but nobody subscribed to its inbox yet
        assert!(alice.send(&peer("bob"), vec![1]).await.is_err());
    }
}
