//! The execution repository.
//!
//! One shared, process-wide service mediating all persistence between the
//! orchestrator's control plane and the key/value backends. The operations
//! are grouped the way they behave:
//!
//! - [`writer`]: full-aggregate and incremental stage writes
//! - [`reader`]: point retrieval
//! - [`lifecycle`]: status transitions, deletion, context merges
//! - [`query`]: lazy, chunked, concurrently fanned-out streaming queries
//! - [`correlation`]: correlation-key resolution

pub mod correlation;
pub mod lifecycle;
pub mod query;
pub mod reader;
pub mod writer;

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::backend::Backend;
use crate::config::RepositoryConfig;
use crate::metrics::RepositoryMetrics;
use crate::router::BackendRouter;

/// The durable state layer for executions.
///
/// Cheap to clone; clones share the backends, the worker pools, and the
/// configuration. All operations take `&self` and may run concurrently.
#[derive(Debug, Clone)]
pub struct ExecutionRepository {
    router: BackendRouter,
    config: RepositoryConfig,
    query_all_pool: Arc<Semaphore>,
    query_by_app_pool: Arc<Semaphore>,
    metrics: RepositoryMetrics,
}

impl ExecutionRepository {
    /// Creates a repository over a single backend with default configuration.
    #[must_use]
    pub fn new(primary: Arc<dyn Backend>) -> Self {
        Self::with_config(BackendRouter::new(primary), RepositoryConfig::default())
    }

    /// Creates a repository spanning a primary and a previous backend, for
    /// use during rolling data migrations.
    #[must_use]
    pub fn with_previous(primary: Arc<dyn Backend>, previous: Arc<dyn Backend>) -> Self {
        Self::with_config(
            BackendRouter::with_previous(primary, previous),
            RepositoryConfig::default(),
        )
    }

    /// Creates a repository with explicit routing and configuration.
    #[must_use]
    pub fn with_config(router: BackendRouter, config: RepositoryConfig) -> Self {
        Self {
            router,
            config,
            query_all_pool: Arc::new(Semaphore::new(config.query_all_workers.max(1))),
            query_by_app_pool: Arc::new(Semaphore::new(config.query_by_app_workers.max(1))),
            metrics: RepositoryMetrics::new(),
        }
    }

    /// The backend router this repository reads and writes through.
    #[must_use]
    pub fn router(&self) -> &BackendRouter {
        &self.router
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> RepositoryConfig {
        self.config
    }
}
