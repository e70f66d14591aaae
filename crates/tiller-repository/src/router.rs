//! Routing between the current and previous backends.
//!
//! During a rolling migration the repository spans two stores: new records
//! land on the *primary* backend while old records drain from the *previous*
//! one. The router locates which backend actually holds a given execution.
//! Existence probes are cheap key lookups and results are never cached;
//! records move as executions are migrated or cleared.

use std::sync::Arc;

use tiller_core::{ExecutionType, Result};

use crate::backend::Backend;
use crate::keys;

/// Locates the backend holding a given execution.
#[derive(Clone)]
pub struct BackendRouter {
    primary: Arc<dyn Backend>,
    previous: Option<Arc<dyn Backend>>,
}

impl std::fmt::Debug for BackendRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRouter")
            .field("primary", &self.primary.name())
            .field("previous", &self.previous.as_ref().map(|b| b.name()))
            .finish()
    }
}

impl BackendRouter {
    /// Creates a router over a single backend.
    #[must_use]
    pub fn new(primary: Arc<dyn Backend>) -> Self {
        Self {
            primary,
            previous: None,
        }
    }

    /// Creates a router over a primary and a previous backend.
    #[must_use]
    pub fn with_previous(primary: Arc<dyn Backend>, previous: Arc<dyn Backend>) -> Self {
        Self {
            primary,
            previous: Some(previous),
        }
    }

    /// The backend new records are written to.
    #[must_use]
    pub fn primary(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.primary)
    }

    /// Both backends, primary first.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn Backend>> {
        let mut backends = vec![Arc::clone(&self.primary)];
        if let Some(previous) = &self.previous {
            backends.push(Arc::clone(previous));
        }
        backends
    }

    /// Returns the backend holding the execution, preferring the primary.
    ///
    /// Falls back to the primary when neither backend has a record, so new
    /// executions land on the current store.
    ///
    /// # Errors
    ///
    /// Surfaces backend errors from the existence probes.
    pub async fn locate(
        &self,
        execution_type: ExecutionType,
        id: &str,
    ) -> Result<Arc<dyn Backend>> {
        let key = keys::execution_key(execution_type, id);
        if self.primary.exists(&key).await? {
            return Ok(Arc::clone(&self.primary));
        }
        if let Some(previous) = &self.previous {
            if previous.exists(&key).await? {
                return Ok(Arc::clone(previous));
            }
        }
        Ok(Arc::clone(&self.primary))
    }

    /// Returns the backend holding a fully-qualified key, if any.
    ///
    /// # Errors
    ///
    /// Surfaces backend errors from the existence probes.
    pub async fn locate_key(&self, key: &str) -> Result<Option<Arc<dyn Backend>>> {
        for backend in self.all() {
            if backend.exists(key).await? {
                return Ok(Some(backend));
            }
        }
        Ok(None)
    }
}
