//! Offer/answer descriptors and connectivity candidates.
//!
//! Everything here is pure data: constructing a descriptor never touches the
//! network. Descriptors are immutable once built; adding a candidate yields a
//! new value.

use crate::network::PeerId;
use crate::utils::{Result, SignalingError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role tag of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorRole {
    /// Sent by the initiator
    Offer,
    /// Sent by the responder in reply to an offer
    Answer,
}

impl fmt::Display for DescriptorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

/// Connectivity hint for a peer, tried in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Peer the hint belongs to
    pub peer_id: PeerId,
    /// Opaque address payload produced by the transport
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl IceCandidate {
    /// Create a candidate
    pub fn new(peer_id: PeerId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            peer_id,
            payload: payload.into(),
        }
    }
}

/// What the local transport contributes to a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCapabilities {
    /// Local peer
    pub peer_id: PeerId,
    /// Opaque connectivity payload, possibly carrying fresh randomness
    pub connectivity: Vec<u8>,
}

/// Offer or answer exchanged out of band to negotiate a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    role: DescriptorRole,
    peer_id: PeerId,
    sequence: u64,
    in_reply_to: Option<u64>,
    #[serde(with = "serde_bytes")]
    connectivity: Vec<u8>,
    candidates: Vec<IceCandidate>,
}

impl SessionDescriptor {
    /// Offer or answer
    pub fn role(&self) -> DescriptorRole {
        self.role
    }

    /// Peer that produced the descriptor
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Monotonic sequence number assigned by the originator
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// For answers, the sequence of the offer being answered
    pub fn in_reply_to(&self) -> Option<u64> {
        self.in_reply_to
    }

    /// Opaque connectivity payload
    pub fn connectivity(&self) -> &[u8] {
        &self.connectivity
    }

    /// Candidates embedded at construction or merged later, in order
    pub fn candidates(&self) -> &[IceCandidate] {
        &self.candidates
    }

    /// Whether this is an offer
    pub fn is_offer(&self) -> bool {
        self.role == DescriptorRole::Offer
    }

    /// Return a copy with `candidate` appended; `self` is untouched
    #[must_use]
    pub fn merge_candidate(&self, candidate: IceCandidate) -> Self {
        let mut merged = self.clone();
        merged.candidates.push(candidate);
        merged
    }

    /// Structural checks shared by every decode path
    pub(crate) fn check_shape(&self) -> Result<()> {
        match (self.role, self.in_reply_to) {
            (DescriptorRole::Offer, Some(_)) => Err(malformed("offer carries a reply reference")),
            (DescriptorRole::Answer, None) => Err(malformed("answer without a reply reference")),
            _ => Ok(()),
        }?;

        if self.connectivity.is_empty() {
            return Err(malformed("empty connectivity payload"));
        }

        if let Some(foreign) = self.candidates.iter().find(|c| c.peer_id != self.peer_id) {
            return Err(malformed(&format!(
                "candidate for {} inside a descriptor from {}",
                foreign.peer_id, self.peer_id
            )));
        }

        Ok(())
    }
}

/// Issues strictly increasing, clock-anchored descriptor sequence numbers.
///
/// Each value is `max(last + 1, now_in_unix_millis)`, so sequences stay
/// monotonic across restarts of the issuing node as long as its clock does
/// not run backwards by more than the restart gap.
#[derive(Debug, Default)]
pub struct DescriptorSequencer {
    last: u64,
}

impl DescriptorSequencer {
    /// Create a sequencer
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next sequence number
    pub fn next(&mut self) -> u64 {
        self.next_at(unix_millis())
    }

    pub(crate) fn next_at(&mut self, now_ms: u64) -> u64 {
        let next = self.last.saturating_add(1).max(now_ms);
        self.last = next;
        next
    }
}

/// Current wall-clock time in Unix milliseconds
pub(crate) fn unix_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Build an offer from local capabilities
pub fn encode_offer(local: &LocalCapabilities, sequencer: &mut DescriptorSequencer) -> SessionDescriptor {
    SessionDescriptor {
        role: DescriptorRole::Offer,
        peer_id: local.peer_id.clone(),
        sequence: sequencer.next(),
        in_reply_to: None,
        connectivity: local.connectivity.clone(),
        candidates: Vec::new(),
    }
}

/// Build the answer to `offer` from local capabilities
///
/// # Errors
///
/// Returns `SignalingError::UnexpectedRole` if `offer` is an answer
pub fn encode_answer(
    offer: &SessionDescriptor,
    local: &LocalCapabilities,
    sequencer: &mut DescriptorSequencer,
) -> Result<SessionDescriptor> {
    if !offer.is_offer() {
        return Err(SignalingError::UnexpectedRole {
            expected: DescriptorRole::Offer.to_string(),
            actual: offer.role.to_string(),
        }
        .into());
    }

    Ok(SessionDescriptor {
        role: DescriptorRole::Answer,
        peer_id: local.peer_id.clone(),
        sequence: sequencer.next(),
        in_reply_to: Some(offer.sequence),
        connectivity: local.connectivity.clone(),
        candidates: Vec::new(),
    })
}

fn malformed(reason: &str) -> crate::utils::PeerLinkError {
    SignalingError::MalformedDescriptor {
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(name: &str) -> LocalCapabilities {
        LocalCapabilities {
            peer_id: PeerId::parse(name).unwrap(),
            connectivity: vec![0xAB; 32],
        }
    }

    #[test]
    fn test_sequencer_is_strictly_monotonic() {
        let mut sequencer = DescriptorSequencer::new();
        assert_eq!(sequencer.next_at(1_000), 1_000);
        assert_eq!(sequencer.next_at(1_000), 1_001);
        assert_eq!(sequencer.next_at(900), 1_002);
        assert_eq!(sequencer.next_at(5_000), 5_000);
    }

    #[test]
    fn test_offer_and_answer() {
        let mut alice_seq = DescriptorSequencer::new();
        let mut bob_seq = DescriptorSequencer::new();

        let offer = encode_offer(&caps("alice"), &mut alice_seq);
        assert!(offer.is_offer());
        assert_eq!(offer.in_reply_to(), None);
        assert!(offer.check_shape().is_ok());

        let answer = encode_answer(&offer, &caps("bob"), &mut bob_seq).unwrap();
        assert_eq!(answer.role(), DescriptorRole::Answer);
        assert_eq!(answer.in_reply_to(), Some(offer.sequence()));
        assert_eq!(answer.peer_id().as_str(), "bob");
        assert!(answer.check_shape().is_ok());
    }

    #[test]
    fn test_answering_an_answer_is_rejected() {
        let mut sequencer = DescriptorSequencer::new();
        let offer = encode_offer(&caps("alice"), &mut sequencer);
        let answer = encode_answer(&offer, &caps("bob"), &mut sequencer).unwrap();

        let err = encode_answer(&answer, &caps("carol"), &mut sequencer).unwrap_err();
        assert_eq!(err.kind(), crate::utils::ErrorKind::MalformedDescriptor);
    }

    #[test]
    fn test_merge_candidate_leaves_original_untouched() {
        let mut sequencer = DescriptorSequencer::new();
        let offer = encode_offer(&caps("alice"), &mut sequencer);
        let alice = offer.peer_id().clone();

        let first = offer.merge_candidate(IceCandidate::new(alice.clone(), b"c1".to_vec()));
        let second = first.merge_candidate(IceCandidate::new(alice, b"c2".to_vec()));

        assert!(offer.candidates().is_empty());
        assert_eq!(first.candidates().len(), 1);
        let payloads: Vec<_> = second.candidates().iter().map(|c| c.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"c1".as_slice(), b"c2".as_slice()]);
    }

    #[test]
    fn test_foreign_candidate_fails_shape_check() {
        let mut sequencer = DescriptorSequencer::new();
        let offer = encode_offer(&caps("alice"), &mut sequencer)
            .merge_candidate(IceCandidate::new(PeerId::parse("mallory").unwrap(), vec![1]));
        assert!(offer.check_shape().is_err());
    }
}
