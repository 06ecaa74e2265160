//! In-memory transport for local testing and development.
//!
//! Peers sharing one [`MemoryTransport`] reach each other through unbounded
//! in-process queues. The connectivity payload is an X25519 ephemeral public
//! key, so the shared secret handed to the secure channel is a real
//! Diffie-Hellman output rather than a constant. Fault switches let tests
//! exercise the failure paths of the session state machine.

use crate::crypto::Role;
use crate::network::PeerId;
use crate::signaling::{IceCandidate, LocalCapabilities};
use crate::transport::{ChannelRequest, OpenedChannel, RawChannel, Transport};
use crate::utils::{Result, TransportError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use rand::rngs::OsRng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

/// Identifies one negotiated link: initiator, offer sequence, answer sequence
type LinkKey = (PeerId, u64, u64);

/// Issued secrets and parked endpoints nobody claimed within this are dropped
const PENDING_TTL: Duration = Duration::from_secs(120);

/// Frames kept per peer for [`MemoryTransport::written_by`]
const WRITE_LOG_LIMIT: usize = 64;

#[derive(Default)]
struct NetworkState {
    /// Ephemeral secrets by the public key advertised in a descriptor
    secrets: HashMap<[u8; 32], (EphemeralSecret, Instant)>,
    /// Endpoints created by the first side to open, awaiting the second
    parked: HashMap<LinkKey, (MemoryChannel, Instant)>,
    /// Injection handles into each peer's current inbound queue
    inboxes: HashMap<PeerId, mpsc::WeakUnboundedSender<Vec<u8>>>,
    /// Most recent frames written by each peer, oldest first
    written: HashMap<PeerId, VecDeque<Vec<u8>>>,
    /// Candidates each peer's opens received, initial then trickled
    candidates: HashMap<PeerId, Arc<Mutex<Vec<IceCandidate>>>>,
    faults: Faults,
    opens: u64,
}

impl NetworkState {
    fn prune(&mut self, now: Instant) {
        let fresh = |issued: &Instant| now.duration_since(*issued) < PENDING_TTL;
        self.secrets.retain(|_, (_, issued)| fresh(issued));
        self.parked.retain(|_, (_, parked)| fresh(parked));
        self.inboxes.retain(|_, inbox| inbox.upgrade().is_some());
    }
}

#[derive(Debug, Default, Clone)]
struct Faults {
    fail_next_open: HashSet<PeerId>,
    open_delay: Option<Duration>,
    duplicate_frames: bool,
    corrupt_frames: bool,
    truncate_secret: Option<usize>,
}

/// Shared in-process network implementing [`Transport`]
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<NetworkState>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryTransport")
            .field("opens", &state.opens)
            .field("parked", &state.parked.len())
            .field("faults", &state.faults)
            .finish()
    }
}

impl MemoryTransport {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next open by `peer_id` fail
    pub fn fail_next_open(&self, peer_id: &PeerId) {
        self.lock().faults.fail_next_open.insert(peer_id.clone());
    }

    /// Delay every open by `delay`
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.lock().faults.open_delay = delay;
    }

    /// Deliver every written frame twice
    pub fn set_duplicate_frames(&self, enabled: bool) {
        self.lock().faults.duplicate_frames = enabled;
    }

    /// Flip a bit in every written frame
    pub fn set_corrupt_frames(&self, enabled: bool) {
        self.lock().faults.corrupt_frames = enabled;
    }

    /// Hand out only the first `len` bytes of each shared secret
    pub fn truncate_secret(&self, len: Option<usize>) {
        self.lock().faults.truncate_secret = len;
    }

    /// Push a raw frame into the inbound queue of `peer_id`'s latest channel
    pub fn inject(&self, peer_id: &PeerId, frame: Vec<u8>) -> Result<()> {
        let inbox = self
            .lock()
            .inboxes
            .get(peer_id)
            .and_then(mpsc::WeakUnboundedSender::upgrade)
            .ok_or(TransportError::ChannelClosed)?;
        inbox.send(frame).map_err(|_| TransportError::ChannelClosed)?;
        Ok(())
    }

    /// Most recent frames written by `peer_id`, oldest first
    pub fn written_by(&self, peer_id: &PeerId) -> Vec<Vec<u8>> {
        self.lock()
            .written
            .get(peer_id)
            .map(|frames| frames.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Candidates passed to `peer_id`'s opens, in the order received
    pub fn candidates_seen(&self, peer_id: &PeerId) -> Vec<IceCandidate> {
        self.lock()
            .candidates
            .get(peer_id)
            .map(|seen| seen.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    /// Number of successful opens
    pub fn opens(&self) -> u64 {
        self.lock().opens
    }

    /// Take the secret behind the local descriptor; it is gone whether or not the open succeeds
    fn take_secret(&self, request: &ChannelRequest) -> Option<EphemeralSecret> {
        let local_public = public_key_bytes(request.local_descriptor().connectivity()).ok()?;
        self.lock().secrets.remove(&local_public).map(|(secret, _)| secret)
    }

    fn shared_secret(&self, request: &ChannelRequest, secret: Option<EphemeralSecret>) -> Result<Zeroizing<Vec<u8>>> {
        let remote_public = public_key_bytes(request.remote_descriptor().connectivity())?;

        let secret = secret.ok_or_else(|| TransportError::OpenFailed {
            peer: request.remote_peer.to_string(),
            reason: "connectivity payload was not issued by this transport".to_string(),
        })?;

        let shared = secret.diffie_hellman(&PublicKey::from(remote_public));
        let mut bytes = Zeroizing::new(shared.as_bytes().to_vec());
        if let Some(len) = self.lock().faults.truncate_secret {
            bytes.truncate(len);
        }
        Ok(bytes)
    }

    /// Take the parked endpoint for `key` or create the pair and park the peer's half
    fn rendezvous(&self, key: LinkKey, request: &ChannelRequest) -> MemoryChannel {
        let mut state = self.lock();
        if let Some((channel, _)) = state.parked.remove(&key) {
            return channel;
        }

        let (initiator, responder) = match request.role {
            Role::Initiator => (&request.local_peer, &request.remote_peer),
            Role::Responder => (&request.remote_peer, &request.local_peer),
        };
        let (initiator_end, responder_end) = MemoryChannel::pair(self.clone(), initiator, responder);
        state
            .inboxes
            .insert(initiator.clone(), initiator_end.inbox_handle.clone());
        state
            .inboxes
            .insert(responder.clone(), responder_end.inbox_handle.clone());

        let (mine, theirs) = match request.role {
            Role::Initiator => (initiator_end, responder_end),
            Role::Responder => (responder_end, initiator_end),
        };
        state.parked.insert(key, (theirs, Instant::now()));
        mine
    }
}

fn public_key_bytes(payload: &[u8]) -> Result<[u8; 32]> {
    <[u8; 32]>::try_from(payload).map_err(|_| {
        TransportError::InvalidPayload {
            reason: format!("expected a 32-byte key, got {} bytes", payload.len()),
        }
        .into()
    })
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn local_capabilities(&self, local: &PeerId, remote: &PeerId) -> Result<LocalCapabilities> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        {
            let mut state = self.lock();
            let now = Instant::now();
            state.prune(now);
            state.secrets.insert(*public.as_bytes(), (secret, now));
        }
        log::trace!("Issued connectivity payload for {} -> {}", local, remote);

        Ok(LocalCapabilities {
            peer_id: local.clone(),
            connectivity: public.as_bytes().to_vec(),
        })
    }

    async fn open_channel(&self, mut request: ChannelRequest) -> Result<OpenedChannel> {
        let (delay, fail) = {
            let mut state = self.lock();
            let fail = state.faults.fail_next_open.remove(&request.local_peer);
            (state.faults.open_delay, fail)
        };

        let seen = Arc::clone(
            self.lock()
                .candidates
                .entry(request.local_peer.clone())
                .or_default(),
        );
        seen.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(request.candidates.iter().cloned());

        let mut trickle = std::mem::replace(&mut request.trickle, mpsc::unbounded_channel().1);
        tokio::spawn(async move {
            while let Some(candidate) = trickle.recv().await {
                seen.lock().unwrap_or_else(PoisonError::into_inner).push(candidate);
            }
        });

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let secret = self.take_secret(&request);
        if fail {
            return Err(TransportError::OpenFailed {
                peer: request.remote_peer.to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }

        let shared_secret = self.shared_secret(&request, secret)?;
        let key = (
            request.offer.peer_id().clone(),
            request.offer.sequence(),
            request.answer.sequence(),
        );
        let channel = self.rendezvous(key, &request);
        self.lock().opens += 1;

        log::debug!(
            "Opened in-memory channel {} -> {} as {:?}",
            request.local_peer,
            request.remote_peer,
            request.role
        );

        Ok(OpenedChannel {
            channel: Arc::new(channel),
            shared_secret,
        })
    }
}

/// One end of an in-memory link
pub struct MemoryChannel {
    local: PeerId,
    network: MemoryTransport,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    inbox_handle: mpsc::WeakUnboundedSender<Vec<u8>>,
    closed: watch::Sender<bool>,
}

impl MemoryChannel {
    fn pair(network: MemoryTransport, a: &PeerId, b: &PeerId) -> (Self, Self) {
        let (to_a, from_a) = mpsc::unbounded_channel();
        let (to_b, from_b) = mpsc::unbounded_channel();

        let end = |local: &PeerId,
                   outbound: mpsc::UnboundedSender<Vec<u8>>,
                   inbound: mpsc::UnboundedReceiver<Vec<u8>>,
                   inbox: &mpsc::UnboundedSender<Vec<u8>>| Self {
            local: local.clone(),
            network: network.clone(),
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            inbox_handle: inbox.downgrade(),
            closed: watch::channel(false).0,
        };

        let a_end = end(a, to_b.clone(), from_a, &to_a);
        let b_end = end(b, to_a, from_b, &to_b);
        (a_end, b_end)
    }
}

#[async_trait]
impl RawChannel for MemoryChannel {
    async fn write(&self, mut frame: Vec<u8>) -> Result<()> {
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::ChannelClosed)?;

        let faults = {
            let mut state = self.network.lock();
            let log = state.written.entry(self.local.clone()).or_default();
            if log.len() == WRITE_LOG_LIMIT {
                log.pop_front();
            }
            log.push_back(frame.clone());
            state.faults.clone()
        };

        if faults.corrupt_frames {
            if let Some(last) = frame.last_mut() {
                *last ^= 0x80;
            }
        }
        if faults.duplicate_frames {
            outbound.send(frame.clone()).map_err(|_| TransportError::ChannelClosed)?;
        }
        outbound.send(frame).map_err(|_| TransportError::ChannelClosed)?;
        Ok(())
    }

    /// The first call takes the inbound queue; later calls yield an empty stream.
    fn read_stream(&self) -> BoxStream<'static, Vec<u8>> {
        let Some(inbound) = self.inbound.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return stream::empty().boxed();
        };

        stream::unfold(
            (inbound, self.closed.subscribe()),
            |(mut inbound, mut closed)| async move {
                if *closed.borrow() {
                    return None;
                }
                let frame = tokio::select! {
                    frame = inbound.recv() => frame,
                    _ = closed.changed() => None,
                };
                frame.map(|frame| (frame, (inbound, closed)))
            },
        )
        .boxed()
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        if self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            log::debug!("Closed in-memory channel of {}", self.local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{encode_answer, encode_offer, DescriptorSequencer};

    fn peer(name: &str) -> PeerId {
        PeerId::parse(name).unwrap()
    }

    async fn requests(
        transport: &MemoryTransport,
    ) -> (ChannelRequest, ChannelRequest, mpsc::UnboundedSender<IceCandidate>) {
        let (alice, bob) = (peer("alice"), peer("bob"));
        let mut sequencer = DescriptorSequencer::new();

        let offer_caps = transport.local_capabilities(&alice, &bob).await.unwrap();
        let offer = encode_offer(&offer_caps, &mut sequencer);
        let answer_caps = transport.local_capabilities(&bob, &alice).await.unwrap();
        let answer = encode_answer(&offer, &answer_caps, &mut sequencer).unwrap();

        let (trickle_tx, trickle_rx) = mpsc::unbounded_channel();
        let initiator = ChannelRequest {
            local_peer: alice.clone(),
            remote_peer: bob.clone(),
            role: Role::Initiator,
            offer: offer.clone(),
            answer: answer.clone(),
            candidates: vec![IceCandidate::new(bob.clone(), b"c1".to_vec())],
            trickle: trickle_rx,
        };
        let responder = ChannelRequest {
            local_peer: bob,
            remote_peer: alice,
            role: Role::Responder,
            offer,
            answer,
            candidates: Vec::new(),
            trickle: mpsc::unbounded_channel().1,
        };
        (initiator, responder, trickle_tx)
    }

    #[tokio::test]
    async fn test_both_ends_agree_on_secret_and_exchange_frames() {
        let transport = MemoryTransport::new();
        let (initiator, responder, _trickle) = requests(&transport).await;

        let alice = transport.open_channel(initiator).await.unwrap();
        let bob = transport.open_channel(responder).await.unwrap();
        assert_eq!(*alice.shared_secret, *bob.shared_secret);
        assert_eq!(alice.shared_secret.len(), 32);

        let mut inbound = bob.channel.read_stream();
        alice.channel.write(b"frame".to_vec()).await.unwrap();
        assert_eq!(inbound.next().await, Some(b"frame".to_vec()));

        alice.channel.close().await;
        assert_eq!(inbound.next().await, None);
        assert!(alice.channel.write(vec![1]).await.is_err());
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn test_candidates_recorded_in_order_including_trickle() {
        let transport = MemoryTransport::new();
        let (initiator, _responder, trickle) = requests(&transport).await;
        trickle.send(IceCandidate::new(peer("bob"), b"c2".to_vec())).unwrap();

        transport.open_channel(initiator).await.unwrap();
        trickle.send(IceCandidate::new(peer("bob"), b"c3".to_vec())).unwrap();
        drop(trickle);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let seen: Vec<_> = transport
            .candidates_seen(&peer("alice"))
            .into_iter()
            .map(|c| c.payload)
            .collect();
        assert_eq!(seen, vec![b"c1".to_vec(), b"c2".to_vec(), b"c3".to_vec()]);
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let transport = MemoryTransport::new();
        let (initiator, _responder, _trickle) = requests(&transport).await;
        transport.fail_next_open(&peer("alice"));

        let err = transport.open_channel(initiator).await.unwrap_err();
        assert_eq!(err.kind(), crate::utils::ErrorKind::Transport);
        assert!(transport.lock().faults.fail_next_open.is_empty());

        // only the responder's secret is left after the failed open
        assert_eq!(transport.lock().secrets.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_secrets_and_parked_ends_expire() {
        let transport = MemoryTransport::new();
        let (_initiator, responder, _trickle) = requests(&transport).await;
        transport.open_channel(responder).await.unwrap();
        {
            let state = transport.lock();
            assert_eq!(state.secrets.len(), 1);
            assert_eq!(state.parked.len(), 1);
        }

        tokio::time::sleep(PENDING_TTL).await;
        transport.local_capabilities(&peer("carol"), &peer("dave")).await.unwrap();

        let state = transport.lock();
        assert_eq!(state.secrets.len(), 1);
        assert!(state.parked.is_empty());
    }

    #[tokio::test]
    async fn test_write_log_keeps_only_recent_frames() {
        let transport = MemoryTransport::new();
        let (initiator, responder, _trickle) = requests(&transport).await;
        let alice = transport.open_channel(initiator).await.unwrap();
        let _bob = transport.open_channel(responder).await.unwrap();

        let total = WRITE_LOG_LIMIT + 10;
        for i in 0..total {
            alice.channel.write(vec![i as u8]).await.unwrap();
        }

        let written = transport.written_by(&peer("alice"));
        assert_eq!(written.len(), WRITE_LOG_LIMIT);
        assert_eq!(written.first(), Some(&vec![10u8]));
        assert_eq!(written.last(), Some(&vec![(total - 1) as u8]));
    }

    #[tokio::test]
    async fn test_inject_and_duplicate() {
        let transport = MemoryTransport::new();
        let (initiator, responder, _trickle) = requests(&transport).await;
        let alice = transport.open_channel(initiator).await.unwrap();
        let bob = transport.open_channel(responder).await.unwrap();
        transport.set_duplicate_frames(true);

        let mut inbound = bob.channel.read_stream();
        alice.channel.write(vec![7]).await.unwrap();
        transport.inject(&peer("bob"), vec![8]).unwrap();

        let frames: Vec<_> = inbound.by_ref().take(3).collect().await;
        assert_eq!(frames, vec![vec![7], vec![7], vec![8]]);
        assert_eq!(transport.written_by(&peer("alice")), vec![vec![7]]);
    }
}
