//! Core error model.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error raised while constructing or parsing core primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A payload reference was empty or otherwise unusable.
    #[error("invalid payload reference: {0}")]
    InvalidPayloadRef(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_payload_ref(msg: impl Into<String>) -> Self {
        Self::InvalidPayloadRef(msg.into())
    }
}
