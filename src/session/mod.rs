//! Peer sessions and the registry that owns them.
//!
//! [`PeerSession`] is the per-peer connection state machine: it drives the
//! descriptor exchange, asks the transport for a raw channel, attaches a
//! secure channel once keys are derived, and publishes lifecycle and message
//! events. [`SessionRegistry`] keeps at most one live session per peer, reaps
//! finished ones and merges their events for the presentation layer.

pub mod peer;
pub mod registry;
pub mod state;

pub use peer::{PeerSession, SessionContext, SessionStats};
pub use registry::SessionRegistry;
pub use state::{SessionEvent, SessionState};
