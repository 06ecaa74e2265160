//! Connection lifecycle of a single peer.
//!
//! A [`PeerSession`] walks `Idle → Negotiating → AwaitingTransport →
//! KeyDeriving → Connected → Closing → Closed`, or falls into `Failed` from
//! any live state. Every transition happens under the session's own mutex,
//! which is never held across an await, and publishes its lifecycle event
//! before the lock is released, so subscribers see transitions in the exact
//! order they happened.
//!
//! Opening the transport and deriving keys run in spawned tasks. When one of
//! them completes it re-checks the state; if the session moved on (closed or
//! failed) the result is discarded and any channel it produced is closed.

use crate::crypto::{derive_session_key, EncryptedEnvelope, Role, SecureChannel, SessionKeyMaterial};
use crate::network::PeerId;
use crate::session::state::{SessionEvent, SessionState};
use crate::signaling::{
    encode_answer, encode_offer, DescriptorRole, DescriptorSequencer, IceCandidate, LocalCapabilities,
    SessionDescriptor,
};
use crate::transport::{ChannelRequest, OpenedChannel, RawChannel, Transport};
use crate::utils::{
    CryptoConfig, CryptoError, ErrorKind, PeerLinkConfig, PeerLinkError, Result, SessionConfig, SessionError,
    SignalingError, TransportError,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Collaborators shared by every session of a node
#[derive(Clone)]
pub struct SessionContext {
    /// This node's identifier
    pub local_peer: PeerId,
    /// Connectivity engine
    pub transport: Arc<dyn Transport>,
    /// State machine tuning
    pub session: SessionConfig,
    /// Secure channel parameters
    pub crypto: CryptoConfig,
    sequencer: Arc<Mutex<DescriptorSequencer>>,
    sink: Option<broadcast::Sender<SessionEvent>>,
}

impl SessionContext {
    /// Build a context from node configuration
    pub fn new(local_peer: PeerId, transport: Arc<dyn Transport>, config: &PeerLinkConfig) -> Self {
        Self {
            local_peer,
            transport,
            session: config.session.clone(),
            crypto: config.crypto.clone(),
            sequencer: Arc::new(Mutex::new(DescriptorSequencer::new())),
            sink: None,
        }
    }

    /// Additionally publish every session event on `sink`
    pub(crate) fn with_sink(mut self, sink: broadcast::Sender<SessionEvent>) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("local_peer", &self.local_peer)
            .field("session", &self.session)
            .field("crypto", &self.crypto)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a session for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Session identifier
    pub session_id: Uuid,
    /// Remote peer
    pub peer_id: PeerId,
    /// Current state
    pub state: SessionState,
    /// Role, once negotiation started
    pub role: Option<Role>,
    /// Failure kind, for failed sessions
    pub failure: Option<ErrorKind>,
    /// Messages sealed and queued
    pub sent: u64,
    /// Messages opened and delivered
    pub received: u64,
    /// Inbound envelopes dropped by integrity or replay checks
    pub rejected: u64,
    /// Key fingerprint both sides can compare
    pub key_fingerprint: Option<String>,
    /// Creation time
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Time the secure channel came up
    pub connected_at: Option<chrono::DateTime<chrono::Utc>>,
}

struct Inner {
    state: SessionState,
    role: Option<Role>,
    offer: Option<SessionDescriptor>,
    answer: Option<SessionDescriptor>,
    /// Remote candidates received before the transport was asked to open
    pending_candidates: Vec<IceCandidate>,
    /// Feed for candidates that arrive while the open is in flight
    trickle: Option<mpsc::UnboundedSender<IceCandidate>>,
    secure: Option<SecureChannel>,
    raw: Option<Arc<dyn RawChannel>>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    writer: Option<JoinHandle<()>>,
    /// Timer, open and reader tasks; aborted on teardown
    tasks: Vec<JoinHandle<()>>,
    auth_failures: u32,
    failure: Option<ErrorKind>,
    sent: u64,
    received: u64,
    rejected: u64,
    fingerprint: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    connected_at: Option<chrono::DateTime<chrono::Utc>>,
    terminal_since: Option<Instant>,
}

struct Shared {
    id: Uuid,
    peer_id: PeerId,
    ctx: SessionContext,
    inner: Mutex<Inner>,
    events: broadcast::Sender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
}

/// One logical encrypted connection to a remote device.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct PeerSession {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.shared.id)
            .field("peer_id", &self.shared.peer_id)
            .field("state", &self.state())
            .finish()
    }
}

impl PeerSession {
    /// Create a session for `peer_id` in `Idle`
    pub fn new(peer_id: PeerId, ctx: SessionContext) -> Self {
        let (events, _) = broadcast::channel(ctx.session.event_buffer);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let session = Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                peer_id,
                ctx,
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    role: None,
                    offer: None,
                    answer: None,
                    pending_candidates: Vec::new(),
                    trickle: None,
                    secure: None,
                    raw: None,
                    outbound: None,
                    writer: None,
                    tasks: Vec::new(),
                    auth_failures: 0,
                    failure: None,
                    sent: 0,
                    received: 0,
                    rejected: 0,
                    fingerprint: None,
                    created_at: chrono::Utc::now(),
                    connected_at: None,
                    terminal_since: None,
                }),
                events,
                state_tx,
            }),
        };
        session.publish(SessionEvent::lifecycle(session.peer_id(), SessionState::Idle));
        session
    }

    /// Remote peer
    pub fn peer_id(&self) -> &PeerId {
        &self.shared.peer_id
    }

    /// Identifier unique to this session, distinguishing it from earlier
    /// sessions with the same peer
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Start as initiator: `Idle → Negotiating`, returning the offer to ship.
    ///
    /// # Errors
    ///
    /// `SessionClosed` on a terminal session, `InvalidState` if negotiation
    /// already started, or the transport's error (which also fails the session)
    pub async fn create_outbound(&self) -> Result<SessionDescriptor> {
        {
            let mut inner = self.lock();
            self.claim(&mut inner, Role::Initiator, "create an offer")?;
        }

        let local = self.capabilities().await?;

        let mut inner = self.lock();
        if inner.state != SessionState::Negotiating {
            return Err(self.abandoned(inner.state));
        }
        let offer = encode_offer(&local, &mut self.sequencer());
        log::debug!("Created offer {} for {}", offer.sequence(), self.peer_id());
        inner.offer = Some(offer.clone());
        Ok(offer)
    }

    /// Answer a remote offer: `Idle → Negotiating → AwaitingTransport`.
    ///
    /// The transport open starts in the background; completion is observable
    /// through the event stream.
    pub async fn accept_inbound(&self, offer: SessionDescriptor) -> Result<SessionDescriptor> {
        self.begin_inbound(offer)?;
        self.finish_inbound().await
    }

    /// Synchronous half of [`accept_inbound`](Self::accept_inbound): validate
    /// the offer and claim the session
    pub(crate) fn begin_inbound(&self, offer: SessionDescriptor) -> Result<()> {
        if !offer.is_offer() {
            return Err(unexpected_role(DescriptorRole::Offer, offer.role()));
        }
        if offer.peer_id() != self.peer_id() {
            return Err(SignalingError::MalformedDescriptor {
                reason: format!("offer from {} routed to session for {}", offer.peer_id(), self.peer_id()),
            }
            .into());
        }

        let mut inner = self.lock();
        self.claim(&mut inner, Role::Responder, "accept an offer")?;
        log::debug!("Accepted offer {} from {}", offer.sequence(), self.peer_id());
        inner.offer = Some(offer);
        Ok(())
    }

    pub(crate) async fn finish_inbound(&self) -> Result<SessionDescriptor> {
        let local = self.capabilities().await?;

        let mut inner = self.lock();
        if inner.state != SessionState::Negotiating {
            return Err(self.abandoned(inner.state));
        }
        let offer = inner
            .offer
            .clone()
            .ok_or_else(|| PeerLinkError::unexpected("responder session without an offer"))?;

        let answer = match encode_answer(&offer, &local, &mut self.sequencer()) {
            Ok(answer) => answer,
            Err(e) => {
                self.fail_locked(&mut inner, &e);
                return Err(e);
            }
        };
        inner.answer = Some(answer.clone());
        self.begin_transport(&mut inner)?;
        Ok(answer)
    }

    /// Complete the initiator's exchange with the responder's answer
    ///
    /// # Errors
    ///
    /// `StaleAnswer` when the answer replies to a different offer; the
    /// session is left untouched in that case
    pub fn apply_answer(&self, answer: SessionDescriptor) -> Result<()> {
        if answer.is_offer() {
            return Err(unexpected_role(DescriptorRole::Answer, answer.role()));
        }
        if answer.peer_id() != self.peer_id() {
            return Err(SignalingError::MalformedDescriptor {
                reason: format!("answer from {} routed to session for {}", answer.peer_id(), self.peer_id()),
            }
            .into());
        }

        let mut inner = self.lock();
        match (inner.state, inner.role) {
            (SessionState::Negotiating, Some(Role::Initiator)) => {}
            (state, _) if state.is_terminal() => return Err(PeerLinkError::closed(self.peer_id())),
            (state, _) => return Err(invalid_state(state, "apply an answer")),
        }

        let Some(expected) = inner.offer.as_ref().map(SessionDescriptor::sequence) else {
            return Err(invalid_state(inner.state, "apply an answer before the offer exists"));
        };
        if answer.in_reply_to() != Some(expected) {
            return Err(SessionError::StaleAnswer {
                expected,
                actual: answer.in_reply_to(),
            }
            .into());
        }

        log::debug!("Applied answer {} from {}", answer.sequence(), self.peer_id());
        inner.answer = Some(answer);
        self.begin_transport(&mut inner)
    }

    /// Hand a remote connectivity hint to the session.
    ///
    /// Candidates are buffered until the transport open starts and then
    /// forwarded in arrival order. Once the channel is open they are ignored.
    pub fn supply_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.peer_id != *self.peer_id() {
            return Err(SignalingError::MalformedDescriptor {
                reason: format!("candidate for {} routed to session for {}", candidate.peer_id, self.peer_id()),
            }
            .into());
        }

        let mut inner = self.lock();
        match inner.state {
            state if state.is_terminal() => return Err(PeerLinkError::closed(self.peer_id())),
            SessionState::KeyDeriving => {
                log::debug!("Ignoring late candidate for {}, channel already open", self.peer_id());
            }
            state if !state.accepts_candidates() => return Err(invalid_state(state, "supply a candidate")),
            _ => match &inner.trickle {
                Some(trickle) if trickle.send(candidate.clone()).is_ok() => {}
                _ => inner.pending_candidates.push(candidate),
            },
        }
        Ok(())
    }

    /// Seal `plaintext` and queue it for the writer task
    ///
    /// # Errors
    ///
    /// `InvalidState` before `Connected`, `SessionClosed` after teardown,
    /// `NonceExhausted` when the key is spent (which also fails the session),
    /// `PayloadTooLarge` over [`MAX_MESSAGE_SIZE`](crate::MAX_MESSAGE_SIZE)
    pub fn send(&self, plaintext: &[u8]) -> Result<()> {
        if plaintext.len() > crate::MAX_MESSAGE_SIZE {
            return Err(SessionError::PayloadTooLarge {
                size: plaintext.len(),
                max: crate::MAX_MESSAGE_SIZE,
            }
            .into());
        }

        let mut inner = self.lock();
        match inner.state {
            SessionState::Connected => {}
            SessionState::Closing | SessionState::Closed | SessionState::Failed => {
                return Err(PeerLinkError::closed(self.peer_id()));
            }
            state => return Err(invalid_state(state, "send")),
        }

        let sealed = match inner.secure.as_mut() {
            Some(secure) => secure.seal(plaintext, &self.shared.ctx.local_peer),
            None => Err(CryptoError::KeyWiped.into()),
        };
        let envelope = match sealed {
            Ok(envelope) => envelope,
            Err(e) => {
                if e.kind() == ErrorKind::NonceExhausted {
                    self.fail_locked(&mut inner, &e);
                }
                return Err(e);
            }
        };

        let frame = envelope.to_bytes()?;
        inner
            .outbound
            .as_ref()
            .ok_or(TransportError::ChannelClosed)?
            .send(frame)
            .map_err(|_| TransportError::ChannelClosed)?;
        inner.sent += 1;
        Ok(())
    }

    /// Tear the session down; idempotent and always reaches a terminal state.
    ///
    /// Queued frames are flushed for at most `session.flush_timeout_ms`. Any
    /// in-flight transport open or key derivation is abandoned.
    pub async fn close(&self) {
        let taken = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Closed | SessionState::Failed => return,
                SessionState::Closing => None,
                _ => {
                    self.enter(&mut inner, SessionState::Closing);
                    for task in inner.tasks.drain(..) {
                        task.abort();
                    }
                    inner.trickle = None;
                    inner.outbound = None;
                    if let Some(mut secure) = inner.secure.take() {
                        secure.wipe();
                    }
                    Some((inner.raw.take(), inner.writer.take()))
                }
            }
        };

        let Some((raw, writer)) = taken else {
            self.wait_for(SessionState::is_terminal).await;
            return;
        };

        // Runs to completion even if the caller stops polling
        let session = self.clone();
        let finish = tokio::spawn(async move {
            let flush = session.shared.ctx.session.flush_timeout();
            if let Some(writer) = writer {
                let abort = writer.abort_handle();
                if tokio::time::timeout(flush, writer).await.is_err() {
                    log::warn!("Flush to {} timed out, dropping queued frames", session.peer_id());
                    abort.abort();
                }
            }
            if let Some(raw) = raw {
                if tokio::time::timeout(flush, raw.close()).await.is_err() {
                    log::warn!("Closing channel to {} timed out", session.peer_id());
                }
            }

            let mut inner = session.lock();
            if inner.state == SessionState::Closing {
                session.enter(&mut inner, SessionState::Closed);
                log::info!("Session with {} closed", session.peer_id());
            }
        });

        if finish.await.is_err() {
            let mut inner = self.lock();
            if inner.state == SessionState::Closing {
                self.enter(&mut inner, SessionState::Closed);
            }
        }
    }

    /// Subscribe to this session's events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Lazy event stream; each call starts an independent subscription
    pub fn event_stream(&self) -> BoxStream<'static, SessionEvent> {
        broadcast_stream(self.subscribe(), self.peer_id().clone())
    }

    /// Wait until the state satisfies `predicate`, returning that state
    pub async fn wait_for<F>(&self, predicate: F) -> SessionState
    where
        F: Fn(SessionState) -> bool,
    {
        let mut receiver = self.shared.state_tx.subscribe();
        if let Ok(state) = receiver.wait_for(|state| predicate(*state)).await {
            return *state;
        }
        self.state()
    }

    /// Diagnostic snapshot
    pub fn stats(&self) -> SessionStats {
        let inner = self.lock();
        SessionStats {
            session_id: self.id(),
            peer_id: self.peer_id().clone(),
            state: inner.state,
            role: inner.role,
            failure: inner.failure,
            sent: inner.sent,
            received: inner.received,
            rejected: inner.rejected,
            key_fingerprint: inner.fingerprint.clone(),
            created_at: inner.created_at,
            connected_at: inner.connected_at,
        }
    }

    /// When the session became terminal
    pub(crate) fn terminal_since(&self) -> Option<Instant> {
        self.lock().terminal_since
    }

    pub(crate) fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sequencer(&self) -> MutexGuard<'_, DescriptorSequencer> {
        self.shared
            .ctx
            .sequencer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: SessionEvent) {
        if let Some(sink) = &self.shared.ctx.sink {
            let _ = sink.send(event.clone());
        }
        let _ = self.shared.events.send(event);
    }

    fn enter(&self, inner: &mut Inner, state: SessionState) {
        log::debug!("Session {}: {} -> {}", self.peer_id(), inner.state, state);
        inner.state = state;
        if state.is_terminal() {
            inner.terminal_since = Some(Instant::now());
        }
        self.shared.state_tx.send_replace(state);
        self.publish(SessionEvent::lifecycle(self.peer_id(), state));
    }

    fn claim(&self, inner: &mut Inner, role: Role, operation: &str) -> Result<()> {
        match inner.state {
            SessionState::Idle => {}
            state if state.is_terminal() => return Err(PeerLinkError::closed(self.peer_id())),
            state => return Err(invalid_state(state, operation)),
        }

        inner.role = Some(role);
        self.enter(inner, SessionState::Negotiating);

        let window = self.shared.ctx.session.negotiation_window();
        let weak = Arc::downgrade(&self.shared);
        inner.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(shared) = weak.upgrade() {
                PeerSession { shared }.on_negotiation_timeout();
            }
        }));
        Ok(())
    }

    fn on_negotiation_timeout(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Negotiating {
            let error = SessionError::NegotiationTimeout {
                peer: self.peer_id().to_string(),
                window_ms: self.shared.ctx.session.negotiation_timeout_ms,
            }
            .into();
            self.fail_locked(&mut inner, &error);
        }
    }

    async fn capabilities(&self) -> Result<LocalCapabilities> {
        let result = self
            .shared
            .ctx
            .transport
            .local_capabilities(&self.shared.ctx.local_peer, self.peer_id())
            .await;
        if let Err(e) = &result {
            self.fail_if(SessionState::Negotiating, e);
        }
        result
    }

    fn abandoned(&self, state: SessionState) -> PeerLinkError {
        if state.is_terminal() || state == SessionState::Closing {
            PeerLinkError::closed(self.peer_id())
        } else {
            invalid_state(state, "continue negotiation")
        }
    }

    /// `Negotiating → AwaitingTransport`; spawns the transport open
    fn begin_transport(&self, inner: &mut Inner) -> Result<()> {
        let (Some(role), Some(offer), Some(answer)) = (inner.role, inner.offer.clone(), inner.answer.clone()) else {
            return Err(PeerLinkError::unexpected("transport requested before both descriptors"));
        };

        let remote = match role {
            Role::Initiator => &answer,
            Role::Responder => &offer,
        };
        let mut candidates = std::mem::take(&mut inner.pending_candidates);
        candidates.extend(remote.candidates().iter().cloned());

        let (trickle_tx, trickle) = mpsc::unbounded_channel();
        inner.trickle = Some(trickle_tx);

        let request = ChannelRequest {
            local_peer: self.shared.ctx.local_peer.clone(),
            remote_peer: self.peer_id().clone(),
            role,
            offer,
            answer,
            candidates,
            trickle,
        };
        self.enter(inner, SessionState::AwaitingTransport);

        let session = self.clone();
        let transport = Arc::clone(&self.shared.ctx.transport);
        inner.tasks.push(tokio::spawn(async move {
            let opened = transport.open_channel(request).await;
            session.on_channel_opened(role, opened).await;
        }));
        Ok(())
    }

    /// `AwaitingTransport → KeyDeriving → Connected`
    async fn on_channel_opened(&self, role: Role, opened: Result<OpenedChannel>) {
        let opened = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.fail_if(SessionState::AwaitingTransport, &e);
                return;
            }
        };

        let current = {
            let mut inner = self.lock();
            if inner.state == SessionState::AwaitingTransport {
                inner.trickle = None;
                inner.raw = Some(Arc::clone(&opened.channel));
                self.enter(&mut inner, SessionState::KeyDeriving);
                true
            } else {
                false
            }
        };
        if !current {
            log::debug!("Discarding late channel to {}", self.peer_id());
            opened.channel.close().await;
            return;
        }

        let secret = opened.shared_secret;
        let peer = self.peer_id().clone();
        let crypto = self.shared.ctx.crypto.clone();
        let derived = tokio::task::spawn_blocking(move || derive_session_key(&secret, &peer, role, &crypto))
            .await
            .unwrap_or_else(|e| Err(PeerLinkError::unexpected(format!("key derivation task failed: {e}"))));

        let mut inner = self.lock();
        if inner.state != SessionState::KeyDeriving {
            // close() already took and closed the channel; the keys wipe on drop
            return;
        }
        match derived {
            Ok(keys) => self.attach(&mut inner, keys, opened.channel),
            Err(e) => self.fail_locked(&mut inner, &e),
        }
    }

    /// Install the secure channel and start the writer and reader tasks
    fn attach(&self, inner: &mut Inner, keys: SessionKeyMaterial, raw: Arc<dyn RawChannel>) {
        inner.fingerprint = Some(keys.fingerprint());
        inner.secure = Some(SecureChannel::new(keys));

        let (outbound, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();
        inner.outbound = Some(outbound);
        let session = self.clone();
        let writer_channel = Arc::clone(&raw);
        inner.writer = Some(tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(e) = writer_channel.write(frame).await {
                    session.fail_if(SessionState::Connected, &e);
                    break;
                }
            }
        }));

        let mut frames = raw.read_stream();
        let session = self.clone();
        inner.tasks.push(tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                if !session.on_frame(&frame) {
                    return;
                }
            }
            session.on_remote_closed();
        }));

        inner.connected_at = Some(chrono::Utc::now());
        self.enter(inner, SessionState::Connected);
        log::info!(
            "Session with {} connected (key {})",
            self.peer_id(),
            inner.fingerprint.as_deref().unwrap_or("-")
        );
    }

    /// Open one inbound frame; returns whether the reader should continue
    fn on_frame(&self, frame: &[u8]) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Connected {
            return false;
        }

        let opened = EncryptedEnvelope::from_bytes(frame).and_then(|envelope| match inner.secure.as_mut() {
            Some(secure) => secure.open(&envelope),
            None => Err(CryptoError::KeyWiped.into()),
        });

        match opened {
            Ok(plaintext) => {
                inner.auth_failures = 0;
                inner.received += 1;
                self.publish(SessionEvent::message(self.peer_id(), plaintext));
                true
            }
            Err(e) if e.is_security_violation() => {
                inner.auth_failures += 1;
                inner.rejected += 1;
                log::warn!(
                    "Dropped envelope from {}: {} ({} consecutive)",
                    self.peer_id(),
                    e,
                    inner.auth_failures
                );
                if inner.auth_failures > self.shared.ctx.session.auth_failure_threshold {
                    self.fail_locked(&mut inner, &e);
                    false
                } else {
                    true
                }
            }
            Err(e) => {
                self.fail_locked(&mut inner, &e);
                false
            }
        }
    }

    /// Inbound stream ended while connected: the peer tore the session down
    fn on_remote_closed(&self) {
        let mut inner = self.lock();
        if inner.state != SessionState::Connected {
            return;
        }
        log::info!("Peer {} closed the channel", self.peer_id());
        self.enter(&mut inner, SessionState::Closing);
        self.release_locked(&mut inner);
        self.enter(&mut inner, SessionState::Closed);
    }

    fn fail_if(&self, expected: SessionState, error: &PeerLinkError) {
        let mut inner = self.lock();
        if inner.state == expected {
            self.fail_locked(&mut inner, error);
        }
    }

    fn fail_locked(&self, inner: &mut Inner, error: &PeerLinkError) {
        if inner.state.is_terminal() || inner.state == SessionState::Closing {
            return;
        }

        let kind = error.kind();
        log::error!("Session with {} failed in {}: {}", self.peer_id(), inner.state, error);
        self.release_locked(inner);

        inner.state = SessionState::Failed;
        inner.failure = Some(kind);
        inner.terminal_since = Some(Instant::now());
        self.shared.state_tx.send_replace(SessionState::Failed);
        self.publish(SessionEvent::failed(self.peer_id(), kind, error.to_string()));
    }

    /// Abort tasks, wipe keys and close the raw channel in the background
    fn release_locked(&self, inner: &mut Inner) {
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        if let Some(writer) = inner.writer.take() {
            writer.abort();
        }
        inner.trickle = None;
        inner.outbound = None;
        if let Some(mut secure) = inner.secure.take() {
            secure.wipe();
        }
        if let Some(raw) = inner.raw.take() {
            tokio::spawn(async move { raw.close().await });
        }
    }
}

/// Adapt a broadcast receiver into a stream, logging lag instead of ending
pub(crate) fn broadcast_stream<T>(receiver: broadcast::Receiver<T>, label: PeerId) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::unfold((receiver, label), |(mut receiver, label)| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((event, (receiver, label))),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Event subscriber for {} lagged, {} events skipped", label, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

fn invalid_state(state: SessionState, operation: &str) -> PeerLinkError {
    SessionError::InvalidState {
        state: state.to_string(),
        operation: operation.to_string(),
    }
    .into()
}

fn unexpected_role(expected: DescriptorRole, actual: DescriptorRole) -> PeerLinkError {
    SignalingError::UnexpectedRole {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
    .into()
}
