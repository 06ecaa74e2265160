//! Configuration and error types shared across the crate.

pub mod config;
pub mod errors;

pub use config::*;
pub use errors::*;