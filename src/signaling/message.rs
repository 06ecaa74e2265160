//! Signaling wire format.
//!
//! A [`SignalMessage`] wraps one descriptor or candidate with routing
//! information and the protocol version. The binary form is bincode; the text
//! form is the same bytes in standard base64, for carriage over channels that
//! only move strings (QR codes, clipboard, chat relays).

use crate::network::PeerId;
use crate::signaling::descriptor::{unix_millis, IceCandidate, SessionDescriptor};
use crate::utils::{Result, SignalingConfig, SignalingError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Payload of a signal message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalBody {
    /// Offer or answer
    Descriptor(SessionDescriptor),
    /// Trickled connectivity hint
    Candidate(IceCandidate),
}

/// One signaling frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Protocol version
    pub version: u32,
    /// Originating peer
    pub from: PeerId,
    /// Intended recipient
    pub to: PeerId,
    /// Descriptor or candidate
    pub body: SignalBody,
}

impl SignalMessage {
    /// Wrap a descriptor addressed to `to`
    pub fn descriptor(to: PeerId, descriptor: SessionDescriptor) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            from: descriptor.peer_id().clone(),
            to,
            body: SignalBody::Descriptor(descriptor),
        }
    }

    /// Wrap a candidate addressed to `to`
    pub fn candidate(to: PeerId, candidate: IceCandidate) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            from: candidate.peer_id.clone(),
            to,
            body: SignalBody::Candidate(candidate),
        }
    }

    /// Short name of the body for logs
    pub fn kind_name(&self) -> &'static str {
        match &self.body {
            SignalBody::Descriptor(d) if d.is_offer() => "offer",
            SignalBody::Descriptor(_) => "answer",
            SignalBody::Candidate(_) => "candidate",
        }
    }

    /// Serialize to the binary wire form
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::MessageTooLarge` past [`MAX_SIGNAL_SIZE`](super::MAX_SIGNAL_SIZE)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let serialized = bincode::serialize(self).map_err(|e| SignalingError::MalformedDescriptor {
            reason: format!("encoding failed: {e}"),
        })?;

        if serialized.len() > super::MAX_SIGNAL_SIZE {
            return Err(SignalingError::MessageTooLarge {
                size: serialized.len(),
                max: super::MAX_SIGNAL_SIZE,
            }
            .into());
        }

        Ok(serialized)
    }

    /// Serialize to base64 text
    pub fn to_text(&self) -> Result<String> {
        Ok(STANDARD.encode(self.to_bytes()?))
    }

    /// Stateless parse: size limit, decoding and version only.
    ///
    /// Inbound traffic should go through [`SignalCodec::decode`], which adds
    /// the sequence and clock checks.
    pub fn from_bytes(bytes: &[u8], max_size: usize) -> Result<Self> {
        if bytes.len() > max_size {
            return Err(SignalingError::MessageTooLarge {
                size: bytes.len(),
                max: max_size,
            }
            .into());
        }

        let message: Self =
            bincode::deserialize(bytes).map_err(|e| SignalingError::MalformedDescriptor {
                reason: format!("undecodable signal: {e}"),
            })?;

        if message.version != crate::PROTOCOL_VERSION {
            return Err(SignalingError::UnsupportedVersion {
                version: message.version,
            }
            .into());
        }

        Ok(message)
    }
}

/// Stateful decoder for inbound signaling.
///
/// Remembers the highest descriptor sequence accepted from each originating
/// peer so replayed or reordered descriptors are refused. Sequences must also
/// fall within `max_clock_skew_ms` of the local clock in either direction,
/// which lets watermarks older than that window be dropped.
#[derive(Debug)]
pub struct SignalCodec {
    config: SignalingConfig,
    last_seen: HashMap<PeerId, u64>,
}

impl SignalCodec {
    /// Create a codec with the given limits
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            config,
            last_seen: HashMap::new(),
        }
    }

    /// Decode and validate an inbound binary frame
    ///
    /// # Errors
    ///
    /// Every rejection maps to `ErrorKind::MalformedDescriptor`
    pub fn decode(&mut self, bytes: &[u8]) -> Result<SignalMessage> {
        self.decode_at(bytes, unix_millis())
    }

    /// Decode and validate an inbound base64 frame
    pub fn decode_text(&mut self, text: &str) -> Result<SignalMessage> {
        let bytes = STANDARD
            .decode(text.trim())
            .map_err(|e| SignalingError::MalformedDescriptor {
                reason: format!("invalid base64: {e}"),
            })?;
        self.decode(&bytes)
    }

    /// Drop watermarks the clock window already rejects; returns how many
    pub fn expire(&mut self) -> usize {
        self.expire_at(unix_millis())
    }

    pub(crate) fn expire_at(&mut self, now_ms: u64) -> usize {
        let floor = now_ms.saturating_sub(self.config.max_clock_skew_ms);
        let before = self.last_seen.len();
        self.last_seen.retain(|_, last| *last >= floor);
        before - self.last_seen.len()
    }

    /// Peers with a live watermark
    pub fn tracked_peers(&self) -> usize {
        self.last_seen.len()
    }

    pub(crate) fn decode_at(&mut self, bytes: &[u8], now_ms: u64) -> Result<SignalMessage> {
        let message = SignalMessage::from_bytes(bytes, self.config.max_message_size)?;

        match &message.body {
            SignalBody::Descriptor(descriptor) => {
                if descriptor.peer_id() != &message.from {
                    return Err(malformed(format!(
                        "descriptor from {} relayed as {}",
                        descriptor.peer_id(),
                        message.from
                    )));
                }
                descriptor.check_shape()?;

                let sequence = descriptor.sequence();
                let horizon = now_ms.saturating_add(self.config.max_clock_skew_ms);
                if sequence > horizon {
                    return Err(malformed(format!(
                        "sequence {sequence} is too far in the future"
                    )));
                }
                let floor = now_ms.saturating_sub(self.config.max_clock_skew_ms);
                if sequence < floor {
                    return Err(malformed(format!("sequence {sequence} is too old")));
                }

                if let Some(&last) = self.last_seen.get(&message.from) {
                    if sequence <= last {
                        return Err(malformed(format!(
                            "sequence {sequence} from {} is not after {last}",
                            message.from
                        )));
                    }
                }
                self.last_seen.insert(message.from.clone(), sequence);
            }
            SignalBody::Candidate(candidate) => {
                if candidate.peer_id != message.from {
                    return Err(malformed(format!(
                        "candidate for {} relayed by {}",
                        candidate.peer_id, message.from
                    )));
                }
                if candidate.payload.is_empty() {
                    return Err(malformed("empty candidate payload".to_string()));
                }
            }
        }

        Ok(message)
    }
}

fn malformed(reason: String) -> crate::utils::PeerLinkError {
    SignalingError::MalformedDescriptor { reason }.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{encode_answer, encode_offer, DescriptorSequencer, LocalCapabilities};
    use crate::utils::ErrorKind;

    fn peer(name: &str) -> PeerId {
        PeerId::parse(name).unwrap()
    }

    fn caps(name: &str) -> LocalCapabilities {
        LocalCapabilities {
            peer_id: peer(name),
            connectivity: vec![9; 32],
        }
    }

    fn offer_frame(sequencer: &mut DescriptorSequencer) -> Vec<u8> {
        let offer = encode_offer(&caps("alice"), sequencer);
        SignalMessage::descriptor(peer("bob"), offer).to_bytes().unwrap()
    }

    #[test]
    fn test_decode_offer_and_text_form() {
        let mut sequencer = DescriptorSequencer::new();
        let offer = encode_offer(&caps("alice"), &mut sequencer);
        let message = SignalMessage::descriptor(peer("bob"), offer.clone());

        let mut codec = SignalCodec::new(SignalingConfig::default());
        let decoded = codec.decode_text(&message.to_text().unwrap()).unwrap();
        assert_eq!(decoded.kind_name(), "offer");
        assert_eq!(decoded.body, SignalBody::Descriptor(offer));
    }

    #[test]
    fn test_replayed_descriptor_rejected() {
        let mut sequencer = DescriptorSequencer::new();
        let frame = offer_frame(&mut sequencer);
        let mut codec = SignalCodec::new(SignalingConfig::default());

        assert!(codec.decode(&frame).is_ok());
        let err = codec.decode(&frame).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedDescriptor);

        // A fresh descriptor from the same peer is still accepted
        assert!(codec.decode(&offer_frame(&mut sequencer)).is_ok());
    }

    #[test]
    fn test_far_future_sequence_rejected() {
        let mut sequencer = DescriptorSequencer::new();
        let far = sequencer.next_at(unix_millis() + 10 * 60 * 1000);
        assert!(far > 0);
        let frame = offer_frame(&mut sequencer);

        let mut codec = SignalCodec::new(SignalingConfig::default());
        assert!(codec.decode(&frame).is_err());
        assert!(codec.decode_at(&frame, unix_millis() + 12 * 60 * 1000).is_ok());
    }

    #[test]
    fn test_watermarks_expire_with_the_clock_window() {
        let mut sequencer = DescriptorSequencer::new();
        let frame = offer_frame(&mut sequencer);
        let mut codec = SignalCodec::new(SignalingConfig::default());
        let now = unix_millis();
        let window = SignalingConfig::default().max_clock_skew_ms;

        codec.decode_at(&frame, now).unwrap();
        assert_eq!(codec.tracked_peers(), 1);
        assert_eq!(codec.expire_at(now), 0);

        let later = now + window + 1_000;
        assert_eq!(codec.expire_at(later), 1);
        assert_eq!(codec.tracked_peers(), 0);

        // the replay is still refused once the watermark is gone
        let err = codec.decode_at(&frame, later).unwrap_err();
        assert!(err.to_string().contains("too old"));
    }

    #[test]
    fn test_truncated_and_garbage_frames_rejected() {
        let mut sequencer = DescriptorSequencer::new();
        let frame = offer_frame(&mut sequencer);
        let mut codec = SignalCodec::new(SignalingConfig::default());

        assert!(codec.decode(&frame[..frame.len() / 2]).is_err());
        assert!(codec.decode(&[0xFF; 40]).is_err());
        assert!(codec.decode_text("not base64 !!").is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut sequencer = DescriptorSequencer::new();
        let offer = encode_offer(&caps("alice"), &mut sequencer);
        let mut message = SignalMessage::descriptor(peer("bob"), offer);
        message.version = 99;
        let bytes = bincode::serialize(&message).unwrap();

        let mut codec = SignalCodec::new(SignalingConfig::default());
        let err = codec.decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let config = SignalingConfig {
            max_message_size: 64,
            ..SignalingConfig::default()
        };
        let mut codec = SignalCodec::new(config);
        assert!(codec.decode(&[0u8; 65]).is_err());
    }

    #[test]
    fn test_spoofed_origin_rejected() {
        let mut sequencer = DescriptorSequencer::new();
        let offer = encode_offer(&caps("alice"), &mut sequencer);
        let answer = encode_answer(&offer, &caps("bob"), &mut sequencer).unwrap();
        let mut message = SignalMessage::descriptor(peer("alice"), answer);
        message.from = peer("mallory");

        let mut codec = SignalCodec::new(SignalingConfig::default());
        assert!(codec.decode(&message.to_bytes().unwrap()).is_err());

        let candidate = SignalMessage {
            from: peer("mallory"),
            ..SignalMessage::candidate(peer("bob"), IceCandidate::new(peer("alice"), vec![1]))
        };
        assert!(codec.decode(&candidate.to_bytes().unwrap()).is_err());
    }
}
