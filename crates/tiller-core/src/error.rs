//! Error types and result aliases for Tiller.
//!
//! This module defines the shared error types used across all Tiller
//! components. Errors are structured for programmatic handling and include
//! context for debugging.

use std::fmt;

/// The result type used throughout Tiller.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Tiller operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested record was not found.
    #[error("not found: {resource} with id {id}")]
    NotFound {
        /// The type of record that was looked up.
        resource: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A lifecycle precondition was violated.
    #[error("invalid state for {id}: expected {expected}, found {actual}")]
    InvalidState {
        /// The execution the transition was attempted on.
        id: String,
        /// The status the operation requires.
        expected: String,
        /// The status that was actually found.
        actual: String,
    },

    /// An argument failed validation.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of what made the argument invalid.
        message: String,
    },

    /// A backend operation failed; surfaced unchanged to the caller.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },
}

impl Error {
    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(resource: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Creates a new invalid-state error.
    #[must_use]
    pub fn invalid_state(
        id: impl fmt::Display,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            id: id.to_string(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a new invalid-argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a new backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new backend error with a source cause.
    #[must_use]
    pub fn backend_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true if this error is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
