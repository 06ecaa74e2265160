//! Error types and handling for the peer session layer.
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! [`PeerLinkError`] wraps one enum per concern. [`PeerLinkError::kind`]
//! collapses the tree into the flat [`ErrorKind`] that lifecycle events carry
//! to the presentation layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for the peerlink library
pub type Result<T> = std::result::Result<T, PeerLinkError>;

/// Crate-wide error type
#[derive(Error, Debug, Clone)]
pub enum PeerLinkError {
    /// Secure channel errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Descriptor and signaling errors
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Session lifecycle errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Transport capability errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Secure channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Shared secret rejected or HKDF expansion failed
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    /// The per-direction counter reached its limit
    #[error("Nonce space exhausted after {sent} messages")]
    NonceExhausted { sent: u64 },

    /// Tag mismatch, replayed sequence or foreign sender
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// AEAD encryption failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Key material was wiped by teardown
    #[error("Session keys have been wiped")]
    KeyWiped,
}

/// Descriptor and signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Inbound descriptor or candidate could not be accepted
    #[error("Malformed descriptor: {reason}")]
    MalformedDescriptor { reason: String },

    /// Unsupported signaling protocol version
    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: u32 },

    /// Frame exceeds the configured size limit
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Descriptor role does not fit the operation
    #[error("Unexpected descriptor role: expected {expected}, got {actual}")]
    UnexpectedRole { expected: String, actual: String },
}

/// Session lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No counterpart descriptor within the negotiation window
    #[error("Negotiation with {peer} timed out after {window_ms} ms")]
    NegotiationTimeout { peer: String, window_ms: u64 },

    /// A live session for the peer already exists
    #[error("Duplicate session for peer {peer}")]
    DuplicateSession { peer: String },

    /// The session reached a terminal state
    #[error("Session with {peer} is closed")]
    SessionClosed { peer: String },

    /// Operation not valid in the current state
    #[error("Cannot {operation} while session is {state}")]
    InvalidState { state: String, operation: String },

    /// Answer does not belong to the outstanding offer
    #[error("Stale answer: expected reply to offer {expected}, got {actual:?}")]
    StaleAnswer { expected: u64, actual: Option<u64> },

    /// Peer not tracked by the registry
    #[error("Session not found: {peer}")]
    NotFound { peer: String },

    /// Application payload over the per-message limit
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Transport capability errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport could not open a channel
    #[error("Failed to open channel to {peer}: {reason}")]
    OpenFailed { peer: String, reason: String },

    /// The raw channel is closed
    #[error("Channel closed")]
    ChannelClosed,

    /// A write on the raw channel failed
    #[error("Write failed: {reason}")]
    WriteFailed { reason: String },

    /// Connectivity payload could not be interpreted
    #[error("Invalid connectivity payload: {reason}")]
    InvalidPayload { reason: String },
}

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Flat classification carried by failure events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Counterpart descriptor never arrived
    NegotiationTimeout,
    /// Transport could not open or keep the channel
    Transport,
    /// Shared secret rejected
    KeyDerivation,
    /// Send counter exhausted
    NonceExhausted,
    /// Integrity or replay failure
    Authentication,
    /// Undecodable or out-of-order signaling input
    MalformedDescriptor,
    /// Second live session for a peer
    DuplicateSession,
    /// Operation on a terminal session
    SessionClosed,
    /// Operation not valid in the current state
    InvalidState,
    /// No session tracked for the peer
    NotFound,
    /// Caller-supplied argument rejected
    InvalidInput,
    /// Bad configuration
    Config,
    /// Anything else
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NegotiationTimeout => "NegotiationTimeout",
            Self::Transport => "TransportError",
            Self::KeyDerivation => "KeyDerivationError",
            Self::NonceExhausted => "NonceExhaustedError",
            Self::Authentication => "AuthenticationError",
            Self::MalformedDescriptor => "MalformedDescriptorError",
            Self::DuplicateSession => "DuplicateSessionError",
            Self::SessionClosed => "SessionClosedError",
            Self::InvalidState => "InvalidState",
            Self::NotFound => "NotFound",
            Self::InvalidInput => "InvalidInput",
            Self::Config => "ConfigError",
            Self::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

impl PeerLinkError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Shorthand for a closed-session error
    pub fn closed(peer: impl fmt::Display) -> Self {
        SessionError::SessionClosed {
            peer: peer.to_string(),
        }
        .into()
    }

    /// Classifies the error for lifecycle events
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Crypto(CryptoError::KeyDerivation { .. }) => ErrorKind::KeyDerivation,
            Self::Crypto(CryptoError::NonceExhausted { .. }) => ErrorKind::NonceExhausted,
            Self::Crypto(CryptoError::Authentication { .. }) => ErrorKind::Authentication,
            Self::Crypto(CryptoError::KeyWiped) => ErrorKind::SessionClosed,
            Self::Crypto(CryptoError::Encryption { .. }) => ErrorKind::Internal,
            Self::Signaling(_) => ErrorKind::MalformedDescriptor,
            Self::Session(SessionError::NegotiationTimeout { .. }) => ErrorKind::NegotiationTimeout,
            Self::Session(SessionError::DuplicateSession { .. }) => ErrorKind::DuplicateSession,
            Self::Session(SessionError::SessionClosed { .. }) => ErrorKind::SessionClosed,
            Self::Session(SessionError::StaleAnswer { .. }) => ErrorKind::MalformedDescriptor,
            Self::Session(SessionError::InvalidState { .. }) => ErrorKind::InvalidState,
            Self::Session(SessionError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Session(SessionError::PayloadTooLarge { .. }) => ErrorKind::InvalidInput,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) | Self::Serialization(_) | Self::Unexpected(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the caller may retry by renegotiating
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NegotiationTimeout | ErrorKind::Transport | ErrorKind::DuplicateSession
        )
    }

    /// Returns true if this error indicates tampering or replay
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::Crypto(CryptoError::Authentication { .. }))
    }
}

impl From<std::io::Error> for PeerLinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PeerLinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = PeerLinkError::from(CryptoError::KeyDerivation {
            reason: "shared secret is empty".to_string(),
        });
        assert!(error.to_string().contains("Key derivation failed"));
    }

    #[test]
    fn test_error_kinds() {
        let timeout = PeerLinkError::from(SessionError::NegotiationTimeout {
            peer: "bob".to_string(),
            window_ms: 10,
        });
        assert_eq!(timeout.kind(), ErrorKind::NegotiationTimeout);
        assert!(timeout.is_recoverable());

        let wiped = PeerLinkError::from(CryptoError::KeyWiped);
        assert_eq!(wiped.kind(), ErrorKind::SessionClosed);
        assert!(!wiped.is_recoverable());

        let malformed = PeerLinkError::from(SignalingError::UnsupportedVersion { version: 9 });
        assert_eq!(malformed.kind(), ErrorKind::MalformedDescriptor);

        let missing = PeerLinkError::from(SessionError::NotFound {
            peer: "carol".to_string(),
        });
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert!(!missing.is_recoverable());

        let oversize = PeerLinkError::from(SessionError::PayloadTooLarge { size: 10, max: 5 });
        assert_eq!(oversize.kind(), ErrorKind::InvalidInput);
        assert!(oversize.to_string().contains("max: 5"));
    }

    #[test]
    fn test_security_violations() {
        let auth = PeerLinkError::from(CryptoError::Authentication {
            reason: "replay".to_string(),
        });
        assert!(auth.is_security_violation());

        let transport = PeerLinkError::from(TransportError::ChannelClosed);
        assert!(!transport.is_security_violation());
    }

    #[test]
    fn test_kind_display_names() {
        assert_eq!(ErrorKind::DuplicateSession.to_string(), "DuplicateSessionError");
        assert_eq!(ErrorKind::NegotiationTimeout.to_string(), "NegotiationTimeout");
    }
}
