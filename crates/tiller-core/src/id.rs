//! Execution identifiers.
//!
//! Execution ids are opaque strings on the wire: the repository accepts any
//! caller-supplied id and never inspects its structure. Ids generated by
//! Tiller itself are ULIDs, which sort lexicographically by creation time
//! and are globally unique without coordination.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// A unique identifier for an execution.
///
/// Wraps an opaque string. Use [`ExecutionId::generate`] to mint a new
/// ULID-backed id, or convert from any string the caller supplies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Generates a new unique execution id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ExecutionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ExecutionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for ExecutionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
