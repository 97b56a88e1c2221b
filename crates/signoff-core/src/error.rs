//! Error types and result aliases shared across signoff components.
//!
//! Errors are structured for programmatic handling and include context for
//! debugging. The orchestration crate layers its own domain errors on top
//! of these.

/// The result type used throughout signoff-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A callback token failed minting or verification.
    ///
    /// Covers malformed tokens, signature mismatches, and the fail-closed
    /// path where no signing key is configured.
    #[error("token invalid: {message}")]
    TokenInvalid {
        /// Description of the verification failure.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new token-invalid error.
    #[must_use]
    pub fn token_invalid(message: impl Into<String>) -> Self {
        Self::TokenInvalid {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
