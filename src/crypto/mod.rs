//! Secure channel primitives.
//!
//! Key derivation from a negotiated shared secret, the sealed envelope wire
//! unit, and the replay-protected AEAD channel built from them.

pub mod channel;
pub mod envelope;

pub use channel::*;
pub use envelope::*;
