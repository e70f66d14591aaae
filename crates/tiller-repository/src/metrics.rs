//! Observability metrics for the execution repository.
//!
//! Metrics are exposed via the `metrics` crate facade; wire an exporter at
//! process bootstrap to publish them.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tiller_repository_streamed_executions_total` | Counter | `backend` | Executions yielded by streaming queries |
//! | `tiller_repository_self_healed_ids_total` | Counter | `backend` | Stale ids removed from seed indices |
//! | `tiller_repository_context_merge_retries_total` | Counter | - | Optimistic context-merge retries |
//! | `tiller_repository_query_chunk_duration_seconds` | Histogram | - | Wall time to decode one query chunk |

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: executions yielded by streaming queries.
    pub const STREAMED_EXECUTIONS_TOTAL: &str = "tiller_repository_streamed_executions_total";
    /// Counter: stale ids removed from seed indices.
    pub const SELF_HEALED_IDS_TOTAL: &str = "tiller_repository_self_healed_ids_total";
    /// Counter: optimistic context-merge retries.
    pub const CONTEXT_MERGE_RETRIES_TOTAL: &str = "tiller_repository_context_merge_retries_total";
    /// Histogram: wall time to decode one query chunk.
    pub const QUERY_CHUNK_DURATION_SECONDS: &str =
        "tiller_repository_query_chunk_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Which backend served the operation.
    pub const BACKEND: &str = "backend";
}

/// High-level interface for recording repository metrics.
///
/// Cheap to clone and share across query workers.
#[derive(Debug, Clone, Default)]
pub struct RepositoryMetrics;

impl RepositoryMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records one execution yielded by a streaming query.
    pub fn record_streamed(&self, backend: &str) {
        counter!(
            names::STREAMED_EXECUTIONS_TOTAL,
            labels::BACKEND => backend.to_string(),
        )
        .increment(1);
    }

    /// Records one stale id removed from a seed index.
    pub fn record_self_healed(&self, backend: &str) {
        counter!(
            names::SELF_HEALED_IDS_TOTAL,
            labels::BACKEND => backend.to_string(),
        )
        .increment(1);
    }

    /// Records one optimistic context-merge retry.
    pub fn record_context_merge_retry(&self) {
        counter!(names::CONTEXT_MERGE_RETRIES_TOTAL).increment(1);
    }

    /// Records the wall time spent decoding one query chunk.
    pub fn observe_chunk_duration(&self, duration: Duration) {
        histogram!(names::QUERY_CHUNK_DURATION_SECONDS).record(duration.as_secs_f64());
    }
}
