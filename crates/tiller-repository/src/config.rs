//! Repository configuration.

use serde::{Deserialize, Serialize};

/// Default number of ids handed to one query worker at a time.
pub const DEFAULT_CHUNK_SIZE: usize = 75;

/// Default worker count for whole-table scans.
pub const DEFAULT_QUERY_ALL_WORKERS: usize = 10;

/// Default worker count for application- and pipeline-scoped queries.
pub const DEFAULT_QUERY_BY_APP_WORKERS: usize = 50;

/// Tuning knobs for the execution repository.
///
/// All fields have serde defaults, so a partial configuration document
/// deserializes cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// Number of ids handed to one query worker at a time.
    pub chunk_size: usize,
    /// Bound on concurrent workers for whole-table scans.
    pub query_all_workers: usize,
    /// Bound on concurrent workers for application/pipeline-scoped queries.
    pub query_by_app_workers: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            query_all_workers: DEFAULT_QUERY_ALL_WORKERS,
            query_by_app_workers: DEFAULT_QUERY_BY_APP_WORKERS,
        }
    }
}
