//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for connection strings so callers
//! don't need a direct dependency to expose them.

pub use secrecy::{ExposeSecret, SecretString};
