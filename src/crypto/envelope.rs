//! Wire unit exchanged once a session is connected.

use crate::network::PeerId;
use crate::utils::{CryptoError, Result};
use serde::{Deserialize, Serialize};

/// ChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Largest encoded envelope accepted from the wire
pub const MAX_ENVELOPE_SIZE: usize = crate::MAX_MESSAGE_SIZE + 1024;

/// Data authenticated alongside every payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedData {
    /// Peer that sealed the envelope
    pub sender: PeerId,
    /// Per-direction sequence number, equal to the nonce counter
    pub sequence: u64,
}

impl AssociatedData {
    /// Canonical byte form fed to the AEAD
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.sender.to_ad_bytes();
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out
    }
}

/// Ciphertext, tag, associated data and nonce of one sealed payload.
///
/// Only [`SecureChannel::seal`](crate::crypto::SecureChannel::seal) and
/// [`EncryptedEnvelope::from_bytes`] produce values of this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub(crate) associated: AssociatedData,
    pub(crate) nonce: [u8; NONCE_SIZE],
    #[serde(with = "serde_bytes")]
    pub(crate) ciphertext: Vec<u8>,
    pub(crate) tag: [u8; TAG_SIZE],
}

impl EncryptedEnvelope {
    /// Associated data bound into the tag
    pub fn associated_data(&self) -> &AssociatedData {
        &self.associated
    }

    /// Sequence number of this envelope
    pub fn sequence(&self) -> u64 {
        self.associated.sequence
    }

    /// Sender recorded in the associated data
    pub fn sender(&self) -> &PeerId {
        &self.associated.sender
    }

    /// Nonce used for this envelope
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// Encrypted payload without the tag
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Authentication tag
    pub fn tag(&self) -> &[u8; TAG_SIZE] {
        &self.tag
    }

    /// Serialize for the raw channel
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| {
            CryptoError::Encryption {
                reason: format!("envelope encoding failed: {e}"),
            }
            .into()
        })
    }

    /// Parse a frame received from the raw channel.
    ///
    /// Undecodable frames are reported as authentication failures: at this
    /// layer they are indistinguishable from corruption.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(CryptoError::Authentication {
                reason: format!("envelope of {} bytes exceeds {MAX_ENVELOPE_SIZE}", bytes.len()),
            }
            .into());
        }

        bincode::deserialize(bytes).map_err(|e| {
            CryptoError::Authentication {
                reason: format!("malformed envelope: {e}"),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedEnvelope {
        EncryptedEnvelope {
            associated: AssociatedData {
                sender: PeerId::parse("alice").unwrap(),
                sequence: 7,
            },
            nonce: [1u8; NONCE_SIZE],
            ciphertext: b"opaque".to_vec(),
            tag: [2u8; TAG_SIZE],
        }
    }

    #[test]
    fn test_wire_encoding() {
        let envelope = sample();
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(EncryptedEnvelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_truncated_frame_is_authentication_error() {
        let bytes = sample().to_bytes().unwrap();
        let err = EncryptedEnvelope::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn test_associated_data_layout() {
        let ad = sample().associated;
        let bytes = ad.to_bytes();
        assert_eq!(&bytes[..2], &[0, 5]);
        assert_eq!(&bytes[bytes.len() - 8..], &7u64.to_be_bytes());
    }
}
