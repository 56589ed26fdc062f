//! Error types for MetaFS
//!
//! This module defines the common error type used across the workspace.

use thiserror::Error;

/// Common result type for MetaFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for MetaFS
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed persisted data: a corrupt key, a truncated value, or a
    /// record newer than this reader understands
    #[error("malformed input: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create an object store error
    pub fn object_store(msg: impl Into<String>) -> Self {
        Self::ObjectStore(msg.into())
    }

    /// Check if this is a decode error
    #[must_use]
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_decode() {
        let err = Error::decode("short buffer");
        assert!(err.is_decode());
        assert_eq!(err.to_string(), "malformed input: short buffer");
    }
}
