//! Error types for the Matryoshka environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
///
/// A request that simply receives no answer is not an error: `express`
/// reports it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The face or hub is gone (shutdown, channel closed)
    #[error("Network error: {0}")]
    NetworkError(String),
    
    /// Prefix registration was refused
    #[error("Registration failed for {prefix}: {reason}")]
    RegistrationFailed { prefix: String, reason: String },
    
    /// No registration with this id exists
    #[error("Unknown registration: {0}")]
    UnknownRegistration(u64),
    
    /// A textual name could not be parsed
    #[error("Invalid name: {0}")]
    InvalidName(String),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }
    
    /// Creates a registration failure.
    pub fn registration(prefix: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::RegistrationFailed {
            prefix: prefix.to_string(),
            reason: reason.into(),
        }
    }
}
