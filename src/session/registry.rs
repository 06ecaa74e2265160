//! Set of live peer sessions, keyed by peer.
//!
//! The map is copy-on-write: mutations are serialized behind a gate and
//! publish a fresh `Arc` snapshot, so lookups and event fan-out never wait on
//! a writer and never observe a half-inserted session.
//!
//! Candidates from a peer with no live session are held in a small side
//! buffer instead of creating one. The buffer is bounded by
//! `registry.max_early_peers` and `registry.max_early_candidates`, and an
//! entry older than the negotiation window is dropped by the reaper.

use crate::network::PeerId;
use crate::session::peer::{broadcast_stream, PeerSession, SessionContext};
use crate::session::state::{SessionEvent, SessionState};
use crate::signaling::{IceCandidate, SessionDescriptor, SignalBody, SignalCodec, SignalMessage};
use crate::transport::Transport;
use crate::utils::{ErrorKind, PeerLinkConfig, RegistryConfig, Result, SessionError, SignalingError};
use futures::future::join_all;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type SessionMap = HashMap<PeerId, PeerSession>;

struct RegistryShared {
    ctx: SessionContext,
    config: RegistryConfig,
    sessions: RwLock<Arc<SessionMap>>,
    gate: Mutex<()>,
    codec: Mutex<SignalCodec>,
    early: Mutex<HashMap<PeerId, EarlyCandidates>>,
    events: broadcast::Sender<SessionEvent>,
}

/// Candidates that arrived before any session for their peer
struct EarlyCandidates {
    first_seen: Instant,
    candidates: Vec<IceCandidate>,
}

/// Tracks at most one live session per peer and fans out their events
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("local_peer", self.local_peer())
            .field("sessions", &self.len())
            .finish()
    }
}

impl SessionRegistry {
    /// Create an empty registry for the local node
    pub fn new(local_peer: PeerId, transport: Arc<dyn Transport>, config: &PeerLinkConfig) -> Self {
        let (events, _) = broadcast::channel(config.registry.event_buffer);
        let ctx = SessionContext::new(local_peer, transport, config).with_sink(events.clone());

        Self {
            shared: Arc::new(RegistryShared {
                ctx,
                config: config.registry.clone(),
                sessions: RwLock::new(Arc::new(HashMap::new())),
                gate: Mutex::new(()),
                codec: Mutex::new(SignalCodec::new(config.signaling.clone())),
                early: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// This node's identifier
    pub fn local_peer(&self) -> &PeerId {
        &self.shared.ctx.local_peer
    }

    /// Consistent view of the current sessions
    pub fn snapshot(&self) -> Arc<HashMap<PeerId, PeerSession>> {
        Arc::clone(&self.shared.sessions.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Session for `peer_id`, if tracked
    pub fn get(&self, peer_id: &PeerId) -> Option<PeerSession> {
        self.snapshot().get(peer_id).cloned()
    }

    /// Tracked peers
    pub fn peers(&self) -> Vec<PeerId> {
        self.snapshot().keys().cloned().collect()
    }

    /// Number of tracked sessions, terminal ones awaiting reaping included
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether no sessions are tracked
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Existing live session for `peer_id`, or a new one in `Idle`.
    ///
    /// A session that already reached `Closed` or `Failed` is replaced.
    pub fn session_for(&self, peer_id: &PeerId) -> Result<PeerSession> {
        let _gate = self.gate();
        self.session_for_locked(peer_id)
    }

    /// Start an outbound session and return the offer to ship to the peer
    pub async fn connect(&self, peer_id: &PeerId) -> Result<SignalMessage> {
        let session = self.session_for(peer_id)?;
        let offer = session.create_outbound().await?;
        Ok(SignalMessage::descriptor(peer_id.clone(), offer))
    }

    /// Accept a remote offer, enforcing one live session per peer.
    ///
    /// # Errors
    ///
    /// `DuplicateSession` if the peer's session is live and past `Idle`
    pub async fn accept_inbound(&self, offer: SessionDescriptor) -> Result<SessionDescriptor> {
        let peer_id = offer.peer_id().clone();
        let session = {
            let _gate = self.gate();
            let session = match self.snapshot().get(&peer_id) {
                Some(existing) if existing.state().is_engaged() => return Err(duplicate(&peer_id)),
                _ => self.session_for_locked(&peer_id)?,
            };
            session.begin_inbound(offer).map_err(|e| {
                if e.kind() == ErrorKind::InvalidState {
                    duplicate(&peer_id)
                } else {
                    e
                }
            })?;
            session
        };
        session.finish_inbound().await
    }

    /// Decode an inbound signaling frame and route it to its session.
    ///
    /// Returns the reply to ship back, if any: the answer for an offer.
    /// Rejected frames are logged and leave every session untouched.
    pub async fn ingest_signal(&self, frame: &[u8]) -> Result<Option<SignalMessage>> {
        let result = self.route_signal(frame).await;
        if let Err(e) = &result {
            log::warn!("Dropped signaling frame ({} bytes): {}", frame.len(), e);
        }
        result
    }

    async fn route_signal(&self, frame: &[u8]) -> Result<Option<SignalMessage>> {
        let message = self
            .shared
            .codec
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decode(frame)?;

        if message.to != *self.local_peer() {
            return Err(SignalingError::MalformedDescriptor {
                reason: format!("{} signal addressed to {}", message.kind_name(), message.to),
            }
            .into());
        }
        log::debug!("Received {} from {}", message.kind_name(), message.from);

        match message.body {
            SignalBody::Descriptor(descriptor) if descriptor.is_offer() => {
                let answer = self.accept_inbound(descriptor).await?;
                Ok(Some(SignalMessage::descriptor(message.from, answer)))
            }
            SignalBody::Descriptor(answer) => {
                let session = self.get(&message.from).ok_or_else(|| SessionError::NotFound {
                    peer: message.from.to_string(),
                })?;
                session.apply_answer(answer)?;
                Ok(None)
            }
            SignalBody::Candidate(candidate) => {
                self.route_candidate(&message.from, candidate)?;
                Ok(None)
            }
        }
    }

    fn route_candidate(&self, from: &PeerId, candidate: IceCandidate) -> Result<()> {
        let session = {
            let _gate = self.gate();
            match self.snapshot().get(from) {
                Some(session) if !session.state().is_terminal() => session.clone(),
                _ => return self.hold_early(from, candidate),
            }
        };
        session.supply_candidate(candidate)
    }

    /// Caller holds the gate
    fn hold_early(&self, from: &PeerId, candidate: IceCandidate) -> Result<()> {
        let mut early = self.early();
        let held = early.len();
        if !early.contains_key(from) && held >= self.shared.config.max_early_peers {
            return Err(early_rejected(format!("{held} peers already have early candidates held")));
        }
        let entry = early.entry(from.clone()).or_insert_with(|| EarlyCandidates {
            first_seen: Instant::now(),
            candidates: Vec::new(),
        });
        if entry.candidates.len() >= self.shared.config.max_early_candidates {
            return Err(early_rejected(format!("{from} has {} candidates held", entry.candidates.len())));
        }
        entry.candidates.push(candidate);
        log::debug!("Holding early candidate from {}", from);
        Ok(())
    }

    /// Close the session for `peer_id`, if any
    pub async fn close(&self, peer_id: &PeerId) {
        if let Some(session) = self.get(peer_id) {
            session.close().await;
        }
    }

    /// Close every tracked session concurrently
    pub async fn close_all(&self) {
        let snapshot = self.snapshot();
        join_all(snapshot.values().map(PeerSession::close)).await;
    }

    /// Remove sessions that have been terminal for longer than the grace period
    pub fn reap_expired(&self) -> Vec<PeerId> {
        let _gate = self.gate();
        let grace = self.shared.config.grace_period();
        let now = Instant::now();

        let current = self.snapshot();
        let expired: Vec<PeerId> = current
            .iter()
            .filter(|(_, session)| {
                session
                    .terminal_since()
                    .is_some_and(|since| now.duration_since(since) >= grace)
            })
            .map(|(peer_id, _)| peer_id.clone())
            .collect();

        if !expired.is_empty() {
            let mut next = (*current).clone();
            for peer_id in &expired {
                next.remove(peer_id);
                log::debug!("Reaped session for {}", peer_id);
            }
            self.publish(next);
        }

        let window = self.shared.ctx.session.negotiation_window();
        self.early().retain(|peer_id, held| {
            let keep = now.duration_since(held.first_seen) < window;
            if !keep {
                log::debug!("Dropped {} early candidates from {}", held.candidates.len(), peer_id);
            }
            keep
        });
        self.shared.codec.lock().unwrap_or_else(PoisonError::into_inner).expire();
        expired
    }

    /// Peers whose candidates are held until a session for them exists
    pub fn early_candidate_peers(&self) -> usize {
        self.early().len()
    }

    /// Run [`reap_expired`](Self::reap_expired) every `registry.reap_interval_ms`
    /// until the registry is dropped
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let weak: Weak<RegistryShared> = Arc::downgrade(&self.shared);
        let period = self.shared.config.reap_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                SessionRegistry { shared }.reap_expired();
            }
        })
    }

    /// Subscribe to the merged event sequence of every session
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Lazy merged event stream; each call is an independent subscriber
    pub fn event_stream(&self) -> BoxStream<'static, SessionEvent> {
        broadcast_stream(self.subscribe(), self.local_peer().clone())
    }

    /// Count sessions per state
    pub fn state_counts(&self) -> HashMap<SessionState, usize> {
        let mut counts = HashMap::new();
        for session in self.snapshot().values() {
            *counts.entry(session.state()).or_insert(0) += 1;
        }
        counts
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.shared.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn early(&self) -> MutexGuard<'_, HashMap<PeerId, EarlyCandidates>> {
        self.shared.early.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, next: SessionMap) {
        *self.shared.sessions.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }

    /// Caller holds the gate
    fn session_for_locked(&self, peer_id: &PeerId) -> Result<PeerSession> {
        if peer_id == self.local_peer() {
            return Err(SessionError::InvalidState {
                state: "-".to_string(),
                operation: "open a session with ourselves".to_string(),
            }
            .into());
        }

        let current = self.snapshot();
        if let Some(existing) = current.get(peer_id) {
            if !existing.state().is_terminal() {
                return Ok(existing.clone());
            }
            log::debug!("Replacing {} session for {}", existing.state(), peer_id);
        }

        let session = PeerSession::new(peer_id.clone(), self.shared.ctx.clone());
        if let Some(held) = self.early().remove(peer_id) {
            log::debug!("Handing {} early candidates to new session for {}", held.candidates.len(), peer_id);
            for candidate in held.candidates {
                session.supply_candidate(candidate)?;
            }
        }
        let mut next = (*current).clone();
        next.insert(peer_id.clone(), session.clone());
        self.publish(next);
        Ok(session)
    }
}

fn early_rejected(reason: String) -> crate::utils::PeerLinkError {
    SignalingError::MalformedDescriptor {
        reason: format!("early candidate dropped: {reason}"),
    }
    .into()
}

fn duplicate(peer_id: &PeerId) -> crate::utils::PeerLinkError {
    SessionError::DuplicateSession {
        peer: peer_id.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{encode_offer, DescriptorSequencer, IceCandidate};
    use crate::transport::MemoryTransport;
    use futures::StreamExt;
    use std::time::Duration;

    fn peer(name: &str) -> PeerId {
        PeerId::parse(name).unwrap()
    }

    fn registries(transport: &MemoryTransport, config: &PeerLinkConfig) -> (SessionRegistry, SessionRegistry) {
        let shared: Arc<dyn Transport> = Arc::new(transport.clone());
        (
            SessionRegistry::new(peer("alice"), Arc::clone(&shared), config),
            SessionRegistry::new(peer("bob"), shared, config),
        )
    }

    async fn handshake(alice: &SessionRegistry, bob: &SessionRegistry) {
        let offer = alice.connect(&peer("bob")).await.unwrap();
        let answer = bob
            .ingest_signal(&offer.to_bytes().unwrap())
            .await
            .unwrap()
            .expect("an offer yields an answer");
        assert!(alice.ingest_signal(&answer.to_bytes().unwrap()).await.unwrap().is_none());

        let settled = |state: SessionState| state == SessionState::Connected || state.is_terminal();
        let a = alice.get(&peer("bob")).unwrap();
        let b = bob.get(&peer("alice")).unwrap();
        assert_eq!(a.wait_for(settled).await, SessionState::Connected);
        assert_eq!(b.wait_for(settled).await, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_session_for_reuses_live_and_replaces_terminal() {
        let transport = MemoryTransport::new();
        let (alice, _) = registries(&transport, &PeerLinkConfig::default());

        let first = alice.session_for(&peer("bob")).unwrap();
        assert!(first.same_as(&alice.session_for(&peer("bob")).unwrap()));

        first.close().await;
        let replacement = alice.session_for(&peer("bob")).unwrap();
        assert!(!first.same_as(&replacement));
        assert_eq!(replacement.state(), SessionState::Idle);
        assert_eq!(alice.len(), 1);

        assert!(alice.session_for(&peer("alice")).is_err());
    }

    #[tokio::test]
    async fn test_signaled_handshake_delivers_through_fan_out() {
        let transport = MemoryTransport::new();
        let (alice, bob) = registries(&transport, &PeerLinkConfig::default());
        let mut first = bob.event_stream();
        let mut second = bob.event_stream();

        handshake(&alice, &bob).await;
        alice.get(&peer("bob")).unwrap().send(b"hi").unwrap();

        for events in [&mut first, &mut second] {
            loop {
                match events.next().await.unwrap() {
                    SessionEvent::Message { peer_id, plaintext, .. } => {
                        assert_eq!(peer_id, peer("alice"));
                        assert_eq!(plaintext, b"hi");
                        break;
                    }
                    SessionEvent::Lifecycle { .. } => continue,
                }
            }
        }
    }

    #[tokio::test]
    async fn test_second_offer_for_connected_peer_is_duplicate() {
        let transport = MemoryTransport::new();
        let (alice, bob) = registries(&transport, &PeerLinkConfig::default());
        handshake(&alice, &bob).await;

        let caps = transport.local_capabilities(&peer("alice"), &peer("bob")).await.unwrap();
        let again = encode_offer(&caps, &mut DescriptorSequencer::new());
        let err = bob.accept_inbound(again).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateSession);
        assert_eq!(bob.get(&peer("alice")).unwrap().state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_offers_only_one_wins() {
        let transport = MemoryTransport::new();
        let (_, bob) = registries(&transport, &PeerLinkConfig::default());
        let mut sequencer = DescriptorSequencer::new();
        let first_caps = transport.local_capabilities(&peer("carol"), &peer("bob")).await.unwrap();
        let second_caps = transport.local_capabilities(&peer("carol"), &peer("bob")).await.unwrap();
        let first = encode_offer(&first_caps, &mut sequencer);
        let second = encode_offer(&second_caps, &mut sequencer);

        let (a, b) = tokio::join!(bob.accept_inbound(first), bob.accept_inbound(second));
        let outcomes = [a.map(|_| ()), b.map(|_| ())];
        let wins = outcomes.iter().filter(|r| r.is_ok()).count();
        let duplicates = outcomes
            .iter()
            .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::DuplicateSession))
            .count();
        assert_eq!((wins, duplicates), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_session_is_reaped_after_grace() {
        let transport = MemoryTransport::new();
        let config = PeerLinkConfig::default();
        let (alice, _bob) = registries(&transport, &config);

        alice.connect(&peer("bob")).await.unwrap();
        let session = alice.get(&peer("bob")).unwrap();
        assert_eq!(session.wait_for(SessionState::is_terminal).await, SessionState::Failed);
        assert_eq!(session.stats().failure, Some(ErrorKind::NegotiationTimeout));

        assert!(alice.reap_expired().is_empty());
        assert!(alice.get(&peer("bob")).is_some());

        tokio::time::sleep(config.registry.grace_period()).await;
        assert_eq!(alice.reap_expired(), vec![peer("bob")]);
        assert!(alice.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reaper() {
        let transport = MemoryTransport::new();
        let config = PeerLinkConfig::default();
        let (alice, _bob) = registries(&transport, &config);
        let reaper = alice.spawn_reaper();

        let session = alice.session_for(&peer("bob")).unwrap();
        session.close().await;
        tokio::time::sleep(config.registry.grace_period() + config.registry.reap_interval() * 2).await;

        assert!(alice.get(&peer("bob")).is_none());
        reaper.abort();
    }

    #[tokio::test]
    async fn test_malformed_and_misrouted_signals_are_dropped() {
        let transport = MemoryTransport::new();
        let (alice, bob) = registries(&transport, &PeerLinkConfig::default());

        let err = bob.ingest_signal(b"garbage").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedDescriptor);

        let offer = alice.connect(&peer("bob")).await.unwrap();
        let misrouted = SignalMessage {
            to: peer("carol"),
            ..offer
        };
        assert!(bob.ingest_signal(&misrouted.to_bytes().unwrap()).await.is_err());
        assert!(bob.is_empty());

        // an answer with no session to apply it to
        let caps = transport.local_capabilities(&peer("carol"), &peer("bob")).await.unwrap();
        let stray = crate::signaling::encode_answer(
            &encode_offer(&caps, &mut DescriptorSequencer::new()),
            &caps,
            &mut DescriptorSequencer::new(),
        )
        .unwrap();
        let frame = SignalMessage::descriptor(peer("bob"), stray).to_bytes().unwrap();
        assert!(bob.ingest_signal(&frame).await.is_err());
    }

    #[tokio::test]
    async fn test_candidate_before_offer_is_buffered() {
        let transport = MemoryTransport::new();
        let (alice, bob) = registries(&transport, &PeerLinkConfig::default());

        let hint = SignalMessage::candidate(peer("bob"), IceCandidate::new(peer("alice"), b"lan".to_vec()));
        assert!(bob.ingest_signal(&hint.to_bytes().unwrap()).await.unwrap().is_none());
        assert!(bob.is_empty());
        assert_eq!(bob.early_candidate_peers(), 1);

        handshake(&alice, &bob).await;
        assert_eq!(bob.early_candidate_peers(), 0);
        let seen = transport.candidates_seen(&peer("bob"));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, b"lan");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_candidates_stay_bounded_and_expire() {
        let transport = MemoryTransport::new();
        let config = PeerLinkConfig::default();
        let (_alice, bob) = registries(&transport, &config);
        let hint = |from: &str| {
            SignalMessage::candidate(peer("bob"), IceCandidate::new(peer(from), b"x".to_vec()))
                .to_bytes()
                .unwrap()
        };

        let mut rejected = 0;
        for i in 0..500 {
            if bob.ingest_signal(&hint(&format!("ghost-{i}"))).await.is_err() {
                rejected += 1;
            }
        }
        assert!(bob.is_empty());
        assert_eq!(bob.early_candidate_peers(), config.registry.max_early_peers);
        assert_eq!(rejected, 500 - config.registry.max_early_peers);

        for _ in 1..config.registry.max_early_candidates {
            bob.ingest_signal(&hint("ghost-0")).await.unwrap();
        }
        assert!(bob.ingest_signal(&hint("ghost-0")).await.is_err());

        tokio::time::sleep(config.session.negotiation_window()).await;
        assert!(bob.reap_expired().is_empty());
        assert_eq!(bob.early_candidate_peers(), 0);
        assert!(bob.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_reaches_closed() {
        let transport = MemoryTransport::new();
        let mut config = PeerLinkConfig::default();
        config.session.flush_timeout_ms = 100;
        let (alice, bob) = registries(&transport, &config);
        handshake(&alice, &bob).await;
        alice.session_for(&peer("carol")).unwrap();

        alice.close_all().await;
        let counts = alice.state_counts();
        assert_eq!(counts.get(&SessionState::Closed), Some(&2));

        let remote = bob.get(&peer("alice")).unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), remote.wait_for(SessionState::is_terminal));
        assert_eq!(closed.await.unwrap(), SessionState::Closed);
    }
}
