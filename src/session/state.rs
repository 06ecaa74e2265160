//! Session lifecycle states and the events sessions publish.

use crate::network::PeerId;
use crate::utils::ErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, no descriptor exchanged yet
    Idle,
    /// Local offer sent or remote offer received
    Negotiating,
    /// Both descriptors known, transport opening the raw channel
    AwaitingTransport,
    /// Raw channel open, deriving session keys
    KeyDeriving,
    /// Secure channel established
    Connected,
    /// Teardown requested, flushing and wiping
    Closing,
    /// Orderly end
    Closed,
    /// Absorbing failure state
    Failed,
}

impl SessionState {
    /// Whether no further transitions can happen
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether the session is live and past `Idle`
    pub fn is_engaged(self) -> bool {
        !self.is_terminal() && self != Self::Idle
    }

    /// Whether candidates are still buffered for the transport
    pub fn accepts_candidates(self) -> bool {
        matches!(self, Self::Idle | Self::Negotiating | Self::AwaitingTransport)
    }

    /// Stable name used in lifecycle events
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Negotiating => "Negotiating",
            Self::AwaitingTransport => "AwaitingTransport",
            Self::KeyDeriving => "KeyDeriving",
            Self::Connected => "Connected",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Something a session did, as seen by subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The session entered `state`
    Lifecycle {
        /// Remote peer
        peer_id: PeerId,
        /// State entered
        state: SessionState,
        /// Set when `state` is `Failed`
        failure: Option<ErrorKind>,
        /// Human-readable failure detail
        detail: Option<String>,
        /// When the transition happened
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// A verified inbound message
    Message {
        /// Remote peer
        peer_id: PeerId,
        /// Decrypted payload
        plaintext: Vec<u8>,
        /// When the message was opened
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl SessionEvent {
    pub(crate) fn lifecycle(peer_id: &PeerId, state: SessionState) -> Self {
        Self::Lifecycle {
            peer_id: peer_id.clone(),
            state,
            failure: None,
            detail: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub(crate) fn failed(peer_id: &PeerId, kind: ErrorKind, detail: String) -> Self {
        Self::Lifecycle {
            peer_id: peer_id.clone(),
            state: SessionState::Failed,
            failure: Some(kind),
            detail: Some(detail),
            timestamp: chrono::Utc::now(),
        }
    }

    pub(crate) fn message(peer_id: &PeerId, plaintext: Vec<u8>) -> Self {
        Self::Message {
            peer_id: peer_id.clone(),
            plaintext,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Peer the event concerns
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Lifecycle { peer_id, .. } | Self::Message { peer_id, .. } => peer_id,
        }
    }

    /// State entered, for lifecycle events
    pub fn state(&self) -> Option<SessionState> {
        match self {
            Self::Lifecycle { state, .. } => Some(*state),
            Self::Message { .. } => None,
        }
    }

    /// Failure kind, for `Failed` lifecycle events
    pub fn failure(&self) -> Option<ErrorKind> {
        match self {
            Self::Lifecycle { failure, .. } => *failure,
            Self::Message { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Closing.is_terminal());

        assert!(!SessionState::Idle.is_engaged());
        assert!(SessionState::Negotiating.is_engaged());
        assert!(SessionState::Connected.is_engaged());

        assert!(SessionState::AwaitingTransport.accepts_candidates());
        assert!(!SessionState::KeyDeriving.accepts_candidates());
    }

    #[test]
    fn test_event_accessors() {
        let peer = PeerId::parse("bob").unwrap();
        let failed = SessionEvent::failed(&peer, ErrorKind::NegotiationTimeout, "late".into());
        assert_eq!(failed.state(), Some(SessionState::Failed));
        assert_eq!(failed.failure(), Some(ErrorKind::NegotiationTimeout));
        assert_eq!(failed.peer_id(), &peer);

        let message = SessionEvent::message(&peer, b"hi".to_vec());
        assert_eq!(message.state(), None);
        assert_eq!(SessionState::AwaitingTransport.to_string(), "AwaitingTransport");
    }
}
