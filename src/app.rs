//! Node host tying discovery, signaling and the session registry together.

use crate::network::{Discovery, DiscoveryManager, PeerId, StaticDiscovery};
use crate::session::{SessionEvent, SessionRegistry, SessionState, SessionStats};
use crate::signaling::{SignalMessage, SignalingChannel, SignalingHub};
use crate::transport::{MemoryTransport, Transport};
use crate::utils::{PeerLinkConfig, Result, SessionError};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch, RwLock};

/// Presentation-level events emitted by a running [`App`]
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// A peer was seen for the first time
    PeerDiscovered {
        /// Peer that appeared
        peer_id: PeerId,
    },
    /// A session reached `Connected`
    PeerConnected {
        /// Remote peer
        peer_id: PeerId,
    },
    /// A session reached `Closed` or `Failed`
    PeerDisconnected {
        /// Remote peer
        peer_id: PeerId,
        /// Terminal state reached
        state: SessionState,
        /// Failure detail, if the session failed
        reason: Option<String>,
    },
    /// A verified message arrived
    MessageReceived {
        /// Sender
        peer_id: PeerId,
        /// Decrypted payload
        content: Vec<u8>,
    },
}

/// A running peerlink node
#[derive(Clone)]
pub struct App {
    config: Arc<PeerLinkConfig>,
    registry: SessionRegistry,
    signaling: Arc<dyn SignalingChannel>,
    discovery: Arc<dyn Discovery>,
    discovery_manager: Arc<RwLock<DiscoveryManager>>,
    events: broadcast::Sender<AppEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    inputs: Arc<Mutex<Option<Inputs>>>,
}

/// Streams subscribed at construction so nothing sent before `run` is lost
struct Inputs {
    signals: BoxStream<'static, Vec<u8>>,
    session_events: BoxStream<'static, SessionEvent>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("local_peer", self.registry.local_peer())
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl App {
    /// Create a node from explicit capabilities
    pub fn new(
        config: PeerLinkConfig,
        transport: Arc<dyn Transport>,
        signaling: Arc<dyn SignalingChannel>,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Self> {
        config.validate()?;
        let local_peer = Self::resolve_local_peer(&config)?;
        log::debug!("Local peer ID: {}", local_peer);

        let registry = SessionRegistry::new(local_peer.clone(), transport, &config);
        let (events, _) = broadcast::channel(config.registry.event_buffer);
        let (shutdown, _) = watch::channel(false);
        let inputs = Inputs {
            signals: signaling.incoming(),
            session_events: registry.event_stream(),
        };

        Ok(Self {
            config: Arc::new(config),
            registry,
            signaling,
            discovery,
            discovery_manager: Arc::new(RwLock::new(DiscoveryManager::new(local_peer))),
            events,
            shutdown: Arc::new(shutdown),
            inputs: Arc::new(Mutex::new(Some(inputs))),
        })
    }

    /// Create a node on a private in-memory transport and signaling hub
    pub fn loopback(config: PeerLinkConfig) -> Result<Self> {
        Self::on_loopback(config, &MemoryTransport::new(), &SignalingHub::new())
    }

    /// Create a node attached to a shared in-memory network.
    ///
    /// Nodes built on the same `transport` and `hub` can reach each other.
    pub fn on_loopback(config: PeerLinkConfig, transport: &MemoryTransport, hub: &SignalingHub) -> Result<Self> {
        let local_peer = Self::resolve_local_peer(&config)?;
        let mut config = config;
        config.discovery.local_peer_id = Some(local_peer.to_string());

        let discovery = StaticDiscovery::from_config(&config);
        let signaling = hub.endpoint(local_peer);
        Self::new(config, Arc::new(transport.clone()), Arc::new(signaling), Arc::new(discovery))
    }

    fn resolve_local_peer(config: &PeerLinkConfig) -> Result<PeerId> {
        match &config.discovery.local_peer_id {
            Some(raw) => PeerId::parse(raw.as_str()),
            None => Ok(PeerId::random()),
        }
    }

    /// This node's identifier
    pub fn local_peer(&self) -> &PeerId {
        self.registry.local_peer()
    }

    /// Session registry backing this node
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Subscribe to presentation events
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    /// Run until [`shutdown`](Self::shutdown) is called or signaling ends.
    ///
    /// Every live session is closed before this returns. A node runs once;
    /// later calls fail with `InvalidState`.
    pub async fn run(&self) -> Result<()> {
        let Inputs {
            mut signals,
            mut session_events,
        } = self
            .inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SessionError::InvalidState {
                state: "running".to_string(),
                operation: "run".to_string(),
            })?;
        log::info!("Starting peerlink node {}", self.local_peer());

        let reaper = self.registry.spawn_reaper();
        let mut discovered = self.discovery.peers();
        let mut shutdown = self.shutdown.subscribe();
        let mut discovery_done = false;

        loop {
            tokio::select! {
                frame = signals.next() => match frame {
                    Some(frame) => self.handle_signal(&frame).await,
                    None => {
                        log::warn!("Signaling channel ended");
                        break;
                    }
                },
                peer = discovered.next(), if !discovery_done => match peer {
                    Some(peer_id) => self.handle_discovered(peer_id).await,
                    None => {
                        log::debug!("Discovery stream finished");
                        discovery_done = true;
                    }
                },
                Some(event) = session_events.next() => self.handle_session_event(event),
                // the guard returned by `wait_for` must not outlive the branch
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }

        reaper.abort();
        self.registry.close_all().await;
        log::info!("Node {} stopped", self.local_peer());
        Ok(())
    }

    /// Ask a running node to stop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Offer a session to `peer_id` over the signaling channel
    pub async fn connect(&self, peer_id: &PeerId) -> Result<()> {
        let offer = self.registry.connect(peer_id).await?;
        if let Err(e) = self.ship(offer).await {
            // an offer nobody will answer must not pin the session
            self.registry.close(peer_id).await;
            return Err(e);
        }
        Ok(())
    }

    /// Send a message over the connected session with `peer_id`
    pub fn send_message(&self, peer_id: &PeerId, content: &[u8]) -> Result<()> {
        let session = self.registry.get(peer_id).ok_or_else(|| SessionError::NotFound {
            peer: peer_id.to_string(),
        })?;
        session.send(content)
    }

    async fn ship(&self, message: SignalMessage) -> Result<()> {
        log::debug!("Sending {} to {}", message.kind_name(), message.to);
        let frame = message.to_bytes()?;
        self.signaling.send(&message.to, frame).await
    }

    async fn handle_signal(&self, frame: &[u8]) {
        // Rejections are already logged by the registry
        if let Ok(Some(reply)) = self.registry.ingest_signal(frame).await {
            if let Err(e) = self.ship(reply).await {
                log::warn!("Failed to send answer: {}", e);
            }
        }
    }

    async fn handle_discovered(&self, peer_id: PeerId) {
        let Some(result) = self.discovery_manager.write().await.observe(peer_id) else {
            return;
        };
        log::info!("Discovered peer {}", result.peer_id);
        let _ = self.events.send(AppEvent::PeerDiscovered {
            peer_id: result.peer_id.clone(),
        });

        // Lower ID offers so two auto-connecting nodes never cross offers
        if !self.config.discovery.auto_connect || self.local_peer() >= &result.peer_id {
            return;
        }
        if let Err(e) = self.connect(&result.peer_id).await {
            if e.is_recoverable() {
                // forgotten peers are offered again when they are next announced
                self.discovery_manager.write().await.remove_peer(&result.peer_id);
                log::info!("Auto-connect to {} failed, retrying on next discovery: {}", result.peer_id, e);
            } else {
                log::warn!("Auto-connect to {} failed: {}", result.peer_id, e);
            }
        }
    }

    fn handle_session_event(&self, event: SessionEvent) {
        let app_event = match event {
            SessionEvent::Lifecycle {
                peer_id,
                state,
                detail,
                ..
            } => {
                log::info!("Session with {} is now {}", peer_id, state);
                match state {
                    SessionState::Connected => AppEvent::PeerConnected { peer_id },
                    SessionState::Closed | SessionState::Failed => AppEvent::PeerDisconnected {
                        peer_id,
                        state,
                        reason: detail,
                    },
                    _ => return,
                }
            }
            SessionEvent::Message { peer_id, plaintext, .. } => {
                log::debug!("Received {} bytes from {}", plaintext.len(), peer_id);
                AppEvent::MessageReceived {
                    peer_id,
                    content: plaintext,
                }
            }
        };
        let _ = self.events.send(app_event);
    }

    /// Get node statistics
    pub async fn stats(&self) -> AppStats {
        let discovery = self.discovery_manager.read().await.stats();
        let sessions: Vec<SessionStats> = self
            .registry
            .snapshot()
            .values()
            .map(|session| session.stats())
            .collect();

        AppStats {
            peer_id: self.local_peer().to_string(),
            states: self.registry.state_counts(),
            discovered_peers: discovery.discovered_peers,
            sessions,
        }
    }
}

/// Node statistics
#[derive(Debug, Clone)]
pub struct AppStats {
    /// Local peer ID
    pub peer_id: String,
    /// Number of sessions in each state
    pub states: HashMap<SessionState, usize>,
    /// Number of distinct peers discovered
    pub discovered_peers: usize,
    /// Per-session statistics
    pub sessions: Vec<SessionStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn node_config(id: &str, peers: &[&str], auto_connect: bool) -> PeerLinkConfig {
        let mut config = PeerLinkConfig::default();
        config.discovery.local_peer_id = Some(id.to_string());
        config.discovery.static_peers = peers.iter().map(|p| p.to_string()).collect();
        config.discovery.auto_connect = auto_connect;
        config
    }

    async fn next_matching<F>(events: &mut broadcast::Receiver<AppEvent>, pred: F) -> AppEvent
    where
        F: Fn(&AppEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_app_creation() {
        let app = App::loopback(node_config("alice", &[], false)).unwrap();
        assert_eq!(app.local_peer().as_str(), "alice");

        let stats = app.stats().await;
        assert_eq!(stats.discovered_peers, 0);
        assert!(stats.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_random_peer_id_when_unset() {
        let app = App::loopback(PeerLinkConfig::default()).unwrap();
        assert!(!app.local_peer().as_str().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = node_config("alice", &[], false);
        config.session.negotiation_timeout_ms = 0;
        assert!(App::loopback(config).is_err());
    }

    #[tokio::test]
    async fn test_two_nodes_auto_connect_and_exchange() {
        let transport = MemoryTransport::new();
        let hub = SignalingHub::new();
        let alice = App::on_loopback(node_config("alice", &["bob"], true), &transport, &hub).unwrap();
        let bob = App::on_loopback(node_config("bob", &["alice"], true), &transport, &hub).unwrap();

        let mut alice_events = alice.subscribe();
        let mut bob_events = bob.subscribe();
        let alice_task = tokio::spawn({
            let alice = alice.clone();
            async move { alice.run().await }
        });
        let bob_task = tokio::spawn({
            let bob = bob.clone();
            async move { bob.run().await }
        });

        next_matching(&mut alice_events, |e| matches!(e, AppEvent::PeerConnected { .. })).await;
        next_matching(&mut bob_events, |e| matches!(e, AppEvent::PeerConnected { .. })).await;

        let bob_id = PeerId::parse("bob").unwrap();
        alice.send_message(&bob_id, b"hello bob").unwrap();
        let received = next_matching(&mut bob_events, |e| matches!(e, AppEvent::MessageReceived { .. })).await;
        match received {
            AppEvent::MessageReceived { peer_id, content } => {
                assert_eq!(peer_id.as_str(), "alice");
                assert_eq!(content, b"hello bob");
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Only the lower ID offered, so exactly one session exists per side
        assert_eq!(alice.registry().len(), 1);
        assert_eq!(bob.registry().len(), 1);

        alice.shutdown();
        bob.shutdown();
        alice_task.await.unwrap().unwrap();
        bob_task.await.unwrap().unwrap();

        let state = bob.registry().get(&PeerId::parse("alice").unwrap()).map(|s| s.state());
        assert!(state.map_or(true, SessionState::is_terminal));
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let app = App::loopback(node_config("alice", &[], false)).unwrap();
        let runner = tokio::spawn({
            let app = app.clone();
            async move { app.run().await }
        });
        tokio::task::yield_now().await;

        let err = app.run().await.unwrap_err();
        assert_eq!(err.kind(), crate::utils::ErrorKind::InvalidState);

        app.shutdown();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let app = App::loopback(node_config("alice", &[], false)).unwrap();
        let err = app
            .send_message(&PeerId::parse("bob").unwrap(), b"hi")
            .unwrap_err();
        assert_eq!(err.kind(), crate::utils::ErrorKind::NotFound);
    }

    fn assert_send<T: Send>(value: T) -> T {
        value
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_is_spawnable_and_honors_early_shutdown() {
        let app = App::loopback(node_config("alice", &[], false)).unwrap();
        app.shutdown();

        let runner = tokio::spawn(assert_send({
            let app = app.clone();
            async move { app.run().await }
        }));
        let stopped = tokio::time::timeout(Duration::from_secs(5), runner).await;
        stopped.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_recoverable_auto_connect_failure_is_retried() {
        let hub = SignalingHub::new();
        let alice = App::on_loopback(node_config("alice", &[], true), &MemoryTransport::new(), &hub).unwrap();
        let bob_id = PeerId::parse("bob").unwrap();

        // bob has no signaling endpoint yet, so shipping the offer fails
        alice.handle_discovered(bob_id.clone()).await;
        assert_eq!(alice.stats().await.discovered_peers, 0);
        assert_eq!(alice.registry().get(&bob_id).unwrap().state(), SessionState::Closed);

        let mut bob_inbox = hub.endpoint(bob_id.clone()).incoming();
        alice.handle_discovered(bob_id.clone()).await;
        assert_eq!(alice.stats().await.discovered_peers, 1);
        assert_eq!(alice.registry().get(&bob_id).unwrap().state(), SessionState::Negotiating);

        let frame = tokio::time::timeout(Duration::from_secs(5), bob_inbox.next())
            .await
            .unwrap()
            .unwrap();
        let offer = SignalMessage::from_bytes(&frame, crate::signaling::MAX_SIGNAL_SIZE).unwrap();
        assert_eq!(offer.kind_name(), "offer");
    }
}
