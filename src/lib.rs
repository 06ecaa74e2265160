//! # peerlink
//!
//! Encrypted peer-to-peer sessions between devices that find each other
//! locally: offer/answer descriptor exchange, a per-peer connection state
//! machine, and an authenticated secure channel keyed from the negotiated
//! shared secret.
//!
//! ## Features
//!
//! - **Secure Channel**: HKDF-SHA256 directional keys, ChaCha20-Poly1305 with
//!   counter nonces and strict replay rejection, zeroized on teardown
//! - **Descriptor Exchange**: offer/answer/candidate signaling with
//!   clock-anchored monotonic sequence numbers
//! - **Peer Sessions**: an async state machine from `Idle` to `Connected` with
//!   negotiation timeouts and ordered lifecycle events
//! - **Session Registry**: one live session per peer, grace-period reaping and
//!   merged event fan-out
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerlink::{App, PeerLinkConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PeerLinkConfig::default();
//!     let app = App::loopback(config)?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: key derivation, sealed envelopes and the secure channel
//! - [`signaling`]: session descriptors, candidates and their wire codec
//! - [`session`]: the per-peer state machine and the session registry
//! - [`transport`]: the raw channel capability and an in-memory implementation
//! - [`network`]: peer identifiers and discovery
//! - [`utils`]: configuration and error handling
//!
//! Network I/O, candidate gathering and discovery are consumed through traits;
//! the crate never opens sockets itself.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod network;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::App;
pub use crypto::{EncryptedEnvelope, Role, SecureChannel};
pub use network::PeerId;
pub use session::{PeerSession, SessionEvent, SessionRegistry, SessionState};
pub use signaling::{IceCandidate, SessionDescriptor, SignalMessage};
pub use utils::{ErrorKind, PeerLinkConfig, PeerLinkError, Result};

/// Signaling protocol version carried in every signal message
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum application payload size in bytes (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default configuration values
pub mod defaults {
    /// Default negotiation window in milliseconds
    pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 15_000;

    /// Default number of consecutive authentication failures tolerated
    pub const DEFAULT_AUTH_FAILURE_THRESHOLD: u32 = 8;

    /// Default time terminal sessions stay visible, in milliseconds
    pub const DEFAULT_REAP_GRACE_MS: u64 = 5_000;
}
