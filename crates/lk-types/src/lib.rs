//! Shared types for loopkey

pub mod errors;

pub use errors::{AuthError, AuthResult};
