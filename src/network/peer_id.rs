//! Opaque peer identifiers.

use crate::utils::{Result, SignalingError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest accepted identifier, in bytes
pub const MAX_PEER_ID_LEN: usize = 256;

/// Stable identifier for a remote device, as supplied by discovery.
///
/// The value is opaque to this crate; it is only compared, hashed, logged and
/// bound into associated data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap an identifier
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::MalformedDescriptor` for empty or oversized ids
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(SignalingError::MalformedDescriptor {
                reason: "peer id is empty".to_string(),
            }
            .into());
        }
        if value.len() > MAX_PEER_ID_LEN {
            return Err(SignalingError::MalformedDescriptor {
                reason: format!("peer id is {} bytes (max {MAX_PEER_ID_LEN})", value.len()),
            }
            .into());
        }
        Ok(Self(value))
    }

    /// Generate a random local identifier of the form `peer-xxxxxxxx`
    pub fn random() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("peer-{}", &id[..8]))
    }

    /// Borrow the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical bytes for associated data: big-endian length prefix then UTF-8
    pub fn to_ad_bytes(&self) -> Vec<u8> {
        let bytes = self.0.as_bytes();
        let mut out = Vec::with_capacity(2 + bytes.len());
        // MAX_PEER_ID_LEN fits in u16
        out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(bytes);
        out
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = crate::utils::PeerLinkError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for PeerId {
    type Error = crate::utils::PeerLinkError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<PeerId> for String {
    fn from(value: PeerId) -> Self {
        value.0
    }
}
