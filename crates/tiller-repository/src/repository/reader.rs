//! Point retrieval of executions.

use std::sync::Arc;

use tiller_core::execution::{Execution, ExecutionType};
use tiller_core::{Error, Result};

use crate::backend::Backend;
use crate::codec;
use crate::keys;

use super::ExecutionRepository;

impl ExecutionRepository {
    /// Retrieves one execution by type and id.
    ///
    /// The hash and the ordered stage-id list are read in one backend
    /// transaction, so a stage write racing this read cannot leave an id in
    /// the order whose fields are invisible (missing fields are tolerated
    /// best-effort either way).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no record exists under the id on either
    /// backend; surfaces backend and decode errors.
    pub async fn retrieve(&self, execution_type: ExecutionType, id: &str) -> Result<Execution> {
        let backend = self.router.locate(execution_type, id).await?;
        self.retrieve_on(&backend, execution_type, id).await
    }

    /// Retrieves an execution from one specific backend.
    pub(crate) async fn retrieve_on(
        &self,
        backend: &Arc<dyn Backend>,
        execution_type: ExecutionType,
        id: &str,
    ) -> Result<Execution> {
        let key = keys::execution_key(execution_type, id);
        let index_key = keys::stage_index_key(execution_type, id);
        let (hash, order) = backend.read_hash_and_list(&key, &index_key).await?;
        if hash.is_empty() {
            return Err(Error::not_found(execution_type.as_str(), id));
        }
        codec::decode(execution_type, id, &hash, &order)
    }

    /// Returns true when either backend holds a record under the id.
    ///
    /// # Errors
    ///
    /// Surfaces backend errors from the existence probes.
    pub async fn has_execution(&self, execution_type: ExecutionType, id: &str) -> Result<bool> {
        let key = keys::execution_key(execution_type, id);
        for backend in self.router.all() {
            if backend.exists(&key).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns every known execution id of a type, across both backends.
    ///
    /// # Errors
    ///
    /// Surfaces backend errors.
    pub async fn retrieve_all_execution_ids(
        &self,
        execution_type: ExecutionType,
    ) -> Result<Vec<String>> {
        let index_key = keys::all_jobs_key(execution_type);
        let mut seen = std::collections::HashSet::new();
        let mut ids = Vec::new();
        for backend in self.router.all() {
            for id in backend.smembers(&index_key).await? {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}
