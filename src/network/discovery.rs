//! Peer discovery capability and bookkeeping.
//!
//! Discovery itself (mDNS, BLE, a directory service) lives outside this crate
//! and is consumed through the [`Discovery`] trait: a lazy stream of reachable
//! [`PeerId`]s that can be restarted by calling [`Discovery::peers`] again.
//! [`DiscoveryManager`] filters that stream down to peers the node has not
//! seen yet.

use crate::network::PeerId;
use crate::utils::{PeerLinkConfig, Result};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// Source of reachable peers.
///
/// Every call to [`peers`](Discovery::peers) starts a fresh, independent
/// stream; dropping a stream cancels only that subscriber.
pub trait Discovery: Send + Sync {
    /// Start a new stream of reachable peers
    fn peers(&self) -> BoxStream<'static, PeerId>;
}

/// Discovery source backed by a fixed list
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<PeerId>,
}

impl StaticDiscovery {
    /// Create a static source from known peers
    pub fn new(peers: Vec<PeerId>) -> Self {
        Self { peers }
    }

    /// Build from `discovery.static_peers`, skipping invalid entries
    pub fn from_config(config: &PeerLinkConfig) -> Self {
        let peers = config
            .discovery
            .static_peers
            .iter()
            .filter_map(|raw| match PeerId::parse(raw.as_str()) {
                Ok(peer) => Some(peer),
                Err(e) => {
                    log::warn!("Ignoring static peer {:?}: {}", raw, e);
                    None
                }
            })
            .collect();
        Self { peers }
    }
}

impl Discovery for StaticDiscovery {
    fn peers(&self) -> BoxStream<'static, PeerId> {
        stream::iter(self.peers.clone()).boxed()
    }
}

/// Discovery source fed at runtime, e.g. by a platform scanner callback.
///
/// New subscribers first receive every peer announced so far, then live
/// announcements.
#[derive(Debug, Clone)]
pub struct AnnouncedDiscovery {
    known: Arc<Mutex<Vec<PeerId>>>,
    live: broadcast::Sender<PeerId>,
}

impl AnnouncedDiscovery {
    /// Create an empty source
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(64);
        Self {
            known: Arc::new(Mutex::new(Vec::new())),
            live,
        }
    }

    /// Announce a reachable peer to all current and future subscribers
    pub fn announce(&self, peer: PeerId) {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        if !known.contains(&peer) {
            known.push(peer.clone());
        }
        // Holding the lock orders this send after the snapshot a new subscriber takes
        let _ = self.live.send(peer);
    }
}

impl Default for AnnouncedDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery for AnnouncedDiscovery {
    fn peers(&self) -> BoxStream<'static, PeerId> {
        let (snapshot, receiver) = {
            let known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
            (known.clone(), self.live.subscribe())
        };

        let live = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(peer) => return Some((peer, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Discovery subscriber lagged, {} announcements skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::iter(snapshot).chain(live).boxed()
    }
}

/// A peer surfaced by the manager
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    /// Discovered peer ID
    pub peer_id: PeerId,
    /// Discovery timestamp
    pub discovered_at: chrono::DateTime<chrono::Utc>,
}

/// Tracks which peers have been seen and filters repeats
#[derive(Debug)]
pub struct DiscoveryManager {
    /// This node's own identifier, never reported as discovered
    local_peer_id: PeerId,
    /// Discovered peers with first-seen timestamps
    discovered_peers: HashMap<PeerId, chrono::DateTime<chrono::Utc>>,
}

impl DiscoveryManager {
    /// Create a manager for the given local node
    pub fn new(local_peer_id: PeerId) -> Self {
        Self {
            local_peer_id,
            discovered_peers: HashMap::new(),
        }
    }

    /// Record a sighting; returns a result only the first time a peer appears
    pub fn observe(&mut self, peer_id: PeerId) -> Option<DiscoveryResult> {
        if peer_id == self.local_peer_id || self.discovered_peers.contains_key(&peer_id) {
            return None;
        }

        let discovered_at = chrono::Utc::now();
        self.discovered_peers.insert(peer_id.clone(), discovered_at);
        log::debug!("Discovered peer {}", peer_id);
        Some(DiscoveryResult {
            peer_id,
            discovered_at,
        })
    }

    /// Forget a peer so a later sighting is reported again
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> bool {
        self.discovered_peers.remove(peer_id).is_some()
    }

    /// All peers seen so far
    pub fn discovered_peers(&self) -> Vec<PeerId> {
        self.discovered_peers.keys().cloned().collect()
    }

    /// Drain a discovery source until it ends, returning new peers in order
    pub async fn collect_from(&mut self, source: &dyn Discovery) -> Result<Vec<DiscoveryResult>> {
        let mut peers = source.peers();
        let mut results = Vec::new();
        while let Some(peer_id) = peers.next().await {
            if let Some(result) = self.observe(peer_id) {
                results.push(result);
            }
        }
        Ok(results)
    }

    /// Get discovery statistics
    pub fn stats(&self) -> DiscoveryStats {
        DiscoveryStats {
            discovered_peers: self.discovered_peers.len(),
            last_discovery: self.discovered_peers.values().max().copied(),
        }
    }
}

/// Discovery statistics
#[derive(Debug, Clone)]
pub struct DiscoveryStats {
    /// Number of discovered peers
    pub discovered_peers: usize,
    /// Most recent first sighting
    pub last_discovery: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::parse(name).unwrap()
    }

    #[tokio::test]
    async fn test_static_discovery_is_restartable() {
        let source = StaticDiscovery::new(vec![peer("a"), peer("b")]);
        let first: Vec<_> = source.peers().collect().await;
        let second: Vec<_> = source.peers().collect().await;
        assert_eq!(first, second);
        assert_eq!(first, vec![peer("a"), peer("b")]);
    }

    #[test]
    fn test_static_discovery_from_config_skips_invalid() {
        let mut config = PeerLinkConfig::default();
        config.discovery.static_peers = vec!["alice".to_string(), String::new()];
        let source = StaticDiscovery::from_config(&config);
        assert_eq!(source.peers.len(), 1);
    }

    #[tokio::test]
    async fn test_announced_discovery_replays_then_follows() {
        let source = AnnouncedDiscovery::new();
        source.announce(peer("a"));

        let mut stream = source.peers();
        assert_eq!(stream.next().await, Some(peer("a")));

        source.announce(peer("b"));
        assert_eq!(stream.next().await, Some(peer("b")));

        let mut restarted = source.peers();
        assert_eq!(restarted.next().await, Some(peer("a")));
        assert_eq!(restarted.next().await, Some(peer("b")));
    }

    #[tokio::test]
    async fn test_manager_filters_self_and_repeats() {
        let mut manager = DiscoveryManager::new(peer("me"));
        let source = StaticDiscovery::new(vec![peer("me"), peer("a"), peer("a"), peer("b")]);

        let results = manager.collect_from(&source).await.unwrap();
        let ids: Vec<_> = results.into_iter().map(|r| r.peer_id).collect();
        assert_eq!(ids, vec![peer("a"), peer("b")]);
        assert_eq!(manager.stats().discovered_peers, 2);

        assert!(manager.remove_peer(&peer("a")));
        assert!(manager.observe(peer("a")).is_some());
    }
}
