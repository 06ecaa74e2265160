//! Per-session key derivation and authenticated encryption.
//!
//! Both peers feed the shared secret produced by connectivity negotiation into
//! HKDF-SHA256 and expand two directional keys. The session [`Role`] decides
//! which one seals and which one opens, so the initiator's sending key is
//! bit-identical to the responder's receiving key and vice versa, and the two
//! directions never share a (key, nonce) pair.
//!
//! Nonces are not random: each direction uses a 64-bit counter that doubles
//! as the envelope sequence number. The receiver accepts strictly increasing
//! sequences only, which rejects replays while tolerating drops.

use crate::crypto::envelope::{AssociatedData, EncryptedEnvelope, NONCE_SIZE, TAG_SIZE};
use crate::network::PeerId;
use crate::utils::{CryptoConfig, CryptoError, Result};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

/// Size of symmetric encryption keys
pub const KEY_SIZE: usize = 32;

/// Default lower bound on shared secret length
pub const MIN_SHARED_SECRET_LEN: usize = 16;

/// HKDF salt, a fixed domain separator for session keys
const SESSION_SALT: &[u8] = b"peerlink/session/v1";

/// HKDF info for the initiator's sending direction
const INITIATOR_TO_RESPONDER: &[u8] = b"peerlink initiator->responder";

/// HKDF info for the responder's sending direction
const RESPONDER_TO_INITIATOR: &[u8] = b"peerlink responder->initiator";

/// Which side of the descriptor exchange this endpoint played
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Created the offer
    Initiator,
    /// Answered the offer
    Responder,
}

impl Role {
    /// The role the remote endpoint plays
    pub fn opposite(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// Directional keys and counters for one session.
///
/// Not `Clone`; key bytes are zeroized on [`wipe`](Self::wipe) and on drop.
pub struct SessionKeyMaterial {
    /// Key sealing our outbound direction
    send_key: [u8; KEY_SIZE],
    /// Key opening the inbound direction
    recv_key: [u8; KEY_SIZE],
    /// Remote peer the material is bound to
    peer_id: PeerId,
    /// Our role in the exchange
    role: Role,
    /// Next outbound sequence
    next_send: u64,
    /// Highest inbound sequence that verified
    last_accepted: Option<u64>,
    /// Outbound sequences available before exhaustion
    send_limit: u64,
    wiped: bool,
}

impl std::fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeyMaterial")
            .field("send_key", &"[REDACTED]")
            .field("recv_key", &"[REDACTED]")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("next_send", &self.next_send)
            .field("last_accepted", &self.last_accepted)
            .field("wiped", &self.wiped)
            .finish()
    }
}

impl SessionKeyMaterial {
    /// Remote peer this material is bound to
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Local role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Orientation-independent digest both peers can compare out of band
    pub fn fingerprint(&self) -> String {
        let (i2r, r2i) = match self.role {
            Role::Initiator => (&self.send_key, &self.recv_key),
            Role::Responder => (&self.recv_key, &self.send_key),
        };
        let mut hasher = Sha256::new();
        hasher.update(i2r);
        hasher.update(r2i);
        hex::encode(&hasher.finalize()[..8])
    }

    /// Overwrite both keys; later seal/open calls fail with `KeyWiped`
    pub fn wipe(&mut self) {
        self.send_key.zeroize();
        self.recv_key.zeroize();
        self.wiped = true;
    }

    /// Whether the keys were wiped
    pub fn is_wiped(&self) -> bool {
        self.wiped
    }
}

impl Drop for SessionKeyMaterial {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Derive session keys from a negotiated shared secret.
///
/// # Arguments
///
/// * `shared_secret` - Output of connectivity negotiation, opaque here
/// * `peer_id` - Remote peer; inbound envelopes must name it as sender
/// * `role` - Local role, selects the key orientation
/// * `config` - Minimum secret length and per-key message limit
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivation` if the secret is empty or shorter
/// than `config.min_shared_secret_len`
pub fn derive_session_key(
    shared_secret: &[u8],
    peer_id: &PeerId,
    role: Role,
    config: &CryptoConfig,
) -> Result<SessionKeyMaterial> {
    if shared_secret.is_empty() {
        return Err(CryptoError::KeyDerivation {
            reason: "shared secret is empty".to_string(),
        }
        .into());
    }
    if shared_secret.len() < config.min_shared_secret_len {
        return Err(CryptoError::KeyDerivation {
            reason: format!(
                "shared secret is {} bytes, need at least {}",
                shared_secret.len(),
                config.min_shared_secret_len
            ),
        }
        .into());
    }

    let hkdf = Hkdf::<Sha256>::new(Some(SESSION_SALT), shared_secret);
    let mut i2r = Zeroizing::new([0u8; KEY_SIZE]);
    let mut r2i = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(INITIATOR_TO_RESPONDER, i2r.as_mut())
        .and_then(|()| hkdf.expand(RESPONDER_TO_INITIATOR, r2i.as_mut()))
        .map_err(|_| CryptoError::KeyDerivation {
            reason: "HKDF expansion failed".to_string(),
        })?;

    let (send_key, recv_key) = match role {
        Role::Initiator => (*i2r, *r2i),
        Role::Responder => (*r2i, *i2r),
    };

    Ok(SessionKeyMaterial {
        send_key,
        recv_key,
        peer_id: peer_id.clone(),
        role,
        next_send: 0,
        last_accepted: None,
        send_limit: config.message_limit(),
        wiped: false,
    })
}

/// Nonce for a sequence number: four zero bytes then the big-endian counter
fn nonce_for(sequence: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Envelopes sealed
    pub sealed: u64,
    /// Envelopes opened successfully
    pub opened: u64,
    /// Envelopes rejected by `open`
    pub rejected: u64,
    /// Highest accepted inbound sequence
    pub last_accepted: Option<u64>,
}

/// Authenticated encryption for one session, owning its key material
#[derive(Debug)]
pub struct SecureChannel {
    keys: SessionKeyMaterial,
    opened: u64,
    rejected: u64,
}

impl SecureChannel {
    /// Wrap freshly derived key material
    pub fn new(keys: SessionKeyMaterial) -> Self {
        Self {
            keys,
            opened: 0,
            rejected: 0,
        }
    }

    /// Derive key material and wrap it in one step
    pub fn derive(
        shared_secret: &[u8],
        peer_id: &PeerId,
        role: Role,
        config: &CryptoConfig,
    ) -> Result<Self> {
        derive_session_key(shared_secret, peer_id, role, config).map(Self::new)
    }

    /// Key material (for fingerprints and role queries)
    pub fn keys(&self) -> &SessionKeyMaterial {
        &self.keys
    }

    /// Seal `plaintext` as the next envelope in our direction.
    ///
    /// The counter advances even if encryption fails, so a nonce is never
    /// handed to the cipher twice.
    ///
    /// # Errors
    ///
    /// * `CryptoError::KeyWiped` after teardown
    /// * `CryptoError::NonceExhausted` once the per-key limit is reached
    pub fn seal(&mut self, plaintext: &[u8], sender: &PeerId) -> Result<EncryptedEnvelope> {
        if self.keys.wiped {
            return Err(CryptoError::KeyWiped.into());
        }

        let sequence = self.keys.next_send;
        if sequence >= self.keys.send_limit {
            return Err(CryptoError::NonceExhausted { sent: sequence }.into());
        }
        self.keys.next_send = sequence + 1;

        let nonce = nonce_for(sequence);
        let associated = AssociatedData {
            sender: sender.clone(),
            sequence,
        };

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.keys.send_key));
        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &associated.to_bytes(), &mut buffer)
            .map_err(|_| CryptoError::Encryption {
                reason: "AEAD seal failed".to_string(),
            })?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(tag.as_slice());

        Ok(EncryptedEnvelope {
            associated,
            nonce,
            ciphertext: buffer,
            tag: tag_bytes,
        })
    }

    /// Verify and decrypt an inbound envelope.
    ///
    /// The sequence must be strictly greater than the last accepted one;
    /// ties are replays, gaps are drops. The watermark moves only after the
    /// tag verifies.
    ///
    /// # Errors
    ///
    /// * `CryptoError::KeyWiped` after teardown
    /// * `CryptoError::Authentication` for foreign senders, replays, nonce
    ///   mismatches and tag failures
    pub fn open(&mut self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
        if self.keys.wiped {
            return Err(CryptoError::KeyWiped.into());
        }

        match self.check_and_decrypt(envelope) {
            Ok(plaintext) => {
                self.keys.last_accepted = Some(envelope.associated.sequence);
                self.opened += 1;
                Ok(plaintext)
            }
            Err(e) => {
                self.rejected += 1;
                Err(e)
            }
        }
    }

    fn check_and_decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
        let associated = &envelope.associated;
        if associated.sender != self.keys.peer_id {
            return Err(CryptoError::Authentication {
                reason: format!(
                    "envelope from {} on a channel bound to {}",
                    associated.sender, self.keys.peer_id
                ),
            }
            .into());
        }

        if let Some(last) = self.keys.last_accepted {
            if associated.sequence <= last {
                return Err(CryptoError::Authentication {
                    reason: format!(
                        "sequence {} replayed or stale (last accepted {last})",
                        associated.sequence
                    ),
                }
                .into());
            }
        }

        if envelope.nonce != nonce_for(associated.sequence) {
            return Err(CryptoError::Authentication {
                reason: "nonce does not match sequence".to_string(),
            }
            .into());
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.keys.recv_key));
        let mut buffer = envelope.ciphertext.clone();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&envelope.nonce),
                &associated.to_bytes(),
                &mut buffer,
                Tag::from_slice(&envelope.tag),
            )
            .map_err(|_| CryptoError::Authentication {
                reason: "tag mismatch".to_string(),
            })?;

        Ok(buffer)
    }

    /// Zeroize the keys; every teardown path calls this
    pub fn wipe(&mut self) {
        self.keys.wipe();
    }

    /// Diagnostic counters
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            sealed: self.keys.next_send,
            opened: self.opened,
            rejected: self.rejected,
            last_accepted: self.keys.last_accepted,
        }
    }
}
