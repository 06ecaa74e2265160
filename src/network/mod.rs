//! Peer identity and discovery.
//!
//! This module defines the opaque [`PeerId`] used throughout the crate and the
//! discovery capability that feeds reachable peers into the session registry.

pub mod discovery;
pub mod peer_id;

pub use discovery::*;
pub use peer_id::*;
