//! Correlation-key resolution.
//!
//! A correlation pointer exists only while the orchestration it points at
//! is still in flight. Pointers are written outside the store transaction,
//! so readers garbage-collect stale ones on discovery.

use tracing::debug;

use tiller_core::execution::{Execution, ExecutionType};
use tiller_core::{Error, Result};

use crate::backend::WriteOp;
use crate::keys;

use super::ExecutionRepository;

impl ExecutionRepository {
    /// Resolves a correlation key to its in-flight orchestration.
    ///
    /// When the pointed-to orchestration has completed (or no longer
    /// exists), the pointer is deleted and the lookup fails.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no pointer exists or the orchestration is no
    /// longer in flight; surfaces backend errors.
    pub async fn retrieve_orchestration_for_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Execution> {
        let pointer_key = keys::correlation_key(correlation_id);

        for backend in self.router.all() {
            let Some(id) = backend.get(&pointer_key).await? else {
                continue;
            };

            match self.retrieve(ExecutionType::Orchestration, &id).await {
                Ok(execution) if !execution.status.is_complete() => return Ok(execution),
                Ok(_) | Err(Error::NotFound { .. }) => {
                    debug!(correlation_id, id, "collecting stale correlation pointer");
                    backend
                        .transaction(vec![WriteOp::Del {
                            key: pointer_key.clone(),
                        }])
                        .await?;
                    return Err(Error::not_found("correlation", correlation_id));
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::not_found("correlation", correlation_id))
    }
}
