//! Status transitions, deletion, and context merges.
//!
//! Each operation locates the backend for the id, reads what it needs, and
//! writes through one transaction. `store_execution_context` is the one
//! optimistic-retry loop: watch, read, merge, write, restart on contention.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use tiller_core::execution::{ExecutionType, PausedDetails};
use tiller_core::{Error, ExecutionStatus, Result};

use crate::backend::{Backend, WriteOp};
use crate::codec::fields;
use crate::keys;

use super::ExecutionRepository;

/// How many optimistic races a context merge may lose before the contention
/// is surfaced as a backend error.
const MAX_CONTEXT_MERGE_ATTEMPTS: usize = 16;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl ExecutionRepository {
    /// Requests cancellation.
    ///
    /// Sets the `canceled` flag; a `NOT_STARTED` execution additionally
    /// moves to `CANCELED`, while a running one keeps its status for the
    /// runner to observe and stop.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no record exists; surfaces backend errors.
    pub async fn cancel(&self, execution_type: ExecutionType, id: &str) -> Result<()> {
        self.cancel_with(execution_type, id, None, None).await
    }

    /// Requests cancellation, recording who asked and why.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no record exists; surfaces backend errors.
    pub async fn cancel_with(
        &self,
        execution_type: ExecutionType,
        id: &str,
        user: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        let backend = self.router.locate(execution_type, id).await?;
        let key = keys::execution_key(execution_type, id);
        let status = self
            .current_status(&backend, execution_type, &key, id)
            .await?;

        let mut updates = vec![(fields::CANCELED.to_string(), "true".to_string())];
        if let Some(user) = user {
            updates.push((fields::CANCELED_BY.to_string(), user.to_string()));
        }
        if let Some(reason) = reason {
            updates.push((fields::CANCELLATION_REASON.to_string(), reason.to_string()));
        }
        if status == ExecutionStatus::NotStarted {
            updates.push((
                fields::STATUS.to_string(),
                ExecutionStatus::Canceled.as_str().to_string(),
            ));
        }
        backend
            .transaction(vec![WriteOp::HSet {
                key,
                fields: updates,
            }])
            .await
    }

    /// Returns the current value of the `canceled` flag.
    ///
    /// # Errors
    ///
    /// Surfaces backend errors.
    pub async fn is_canceled(&self, execution_type: ExecutionType, id: &str) -> Result<bool> {
        let backend = self.router.locate(execution_type, id).await?;
        let key = keys::execution_key(execution_type, id);
        Ok(backend
            .hget(&key, fields::CANCELED)
            .await?
            .is_some_and(|raw| raw == "true"))
    }

    /// Pauses a running execution.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the execution is `RUNNING`; returns
    /// `NotFound` when no record exists; surfaces backend errors.
    pub async fn pause(&self, execution_type: ExecutionType, id: &str, user: &str) -> Result<()> {
        let backend = self.router.locate(execution_type, id).await?;
        let key = keys::execution_key(execution_type, id);
        let status = self
            .current_status(&backend, execution_type, &key, id)
            .await?;
        if status != ExecutionStatus::Running {
            return Err(Error::invalid_state(
                id,
                ExecutionStatus::Running.as_str(),
                status.as_str(),
            ));
        }

        let paused = PausedDetails {
            paused_by: Some(user.to_string()),
            pause_time: Some(now_ms()),
            ..PausedDetails::default()
        };
        backend
            .transaction(vec![WriteOp::HSet {
                key,
                fields: vec![
                    (fields::PAUSED.to_string(), serde_json::to_string(&paused)?),
                    (
                        fields::STATUS.to_string(),
                        ExecutionStatus::Paused.as_str().to_string(),
                    ),
                ],
            }])
            .await
    }

    /// Resumes a paused execution.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the execution is `PAUSED` (or
    /// `ignore_current_status` is set); returns `NotFound` when no record
    /// exists; surfaces backend errors.
    pub async fn resume(
        &self,
        execution_type: ExecutionType,
        id: &str,
        user: &str,
        ignore_current_status: bool,
    ) -> Result<()> {
        let backend = self.router.locate(execution_type, id).await?;
        let key = keys::execution_key(execution_type, id);
        let status = self
            .current_status(&backend, execution_type, &key, id)
            .await?;
        if !ignore_current_status && status != ExecutionStatus::Paused {
            return Err(Error::invalid_state(
                id,
                ExecutionStatus::Paused.as_str(),
                status.as_str(),
            ));
        }

        let mut paused: PausedDetails = backend
            .hget(&key, fields::PAUSED)
            .await?
            .map(|raw| {
                serde_json::from_str(&raw)
                    .map_err(|err| Error::serialization(format!("field paused is not valid: {err}")))
            })
            .transpose()?
            .unwrap_or_default();
        paused.resumed_by = Some(user.to_string());
        paused.resume_time = Some(now_ms());

        backend
            .transaction(vec![WriteOp::HSet {
                key,
                fields: vec![
                    (fields::PAUSED.to_string(), serde_json::to_string(&paused)?),
                    (
                        fields::STATUS.to_string(),
                        ExecutionStatus::Running.as_str().to_string(),
                    ),
                ],
            }])
            .await
    }

    /// Overwrites the status.
    ///
    /// Moving to `RUNNING` clears the `canceled` flag and stamps the start
    /// time; moving to any completed status stamps the end time.
    ///
    /// # Errors
    ///
    /// Surfaces backend errors.
    pub async fn update_status(
        &self,
        execution_type: ExecutionType,
        id: &str,
        status: ExecutionStatus,
    ) -> Result<()> {
        let backend = self.router.locate(execution_type, id).await?;
        let key = keys::execution_key(execution_type, id);

        let mut updates = vec![(fields::STATUS.to_string(), status.as_str().to_string())];
        if status == ExecutionStatus::Running {
            updates.push((fields::CANCELED.to_string(), "false".to_string()));
            updates.push((fields::START_TIME.to_string(), now_ms().to_string()));
        } else if status.is_complete() {
            updates.push((fields::END_TIME.to_string(), now_ms().to_string()));
        }
        backend
            .transaction(vec![WriteOp::HSet {
                key,
                fields: updates,
            }])
            .await
    }

    /// Deletes an execution and its index memberships.
    ///
    /// The application and configuration lookups are best-effort: the
    /// per-execution hash, the stage-id list, and the `allJobs` membership
    /// are removed even when those reads fail.
    ///
    /// # Errors
    ///
    /// Surfaces backend errors from the final transaction.
    pub async fn delete(&self, execution_type: ExecutionType, id: &str) -> Result<()> {
        let backend = self.router.locate(execution_type, id).await?;
        let key = keys::execution_key(execution_type, id);
        let index_key = keys::stage_index_key(execution_type, id);

        let mut ops = Vec::new();
        match backend.hget(&key, fields::APPLICATION).await {
            Ok(Some(application)) => ops.push(WriteOp::SRem {
                key: keys::app_key(execution_type, &application),
                member: id.to_string(),
            }),
            Ok(None) => {}
            Err(err) => warn!(error = %err, id, "application lookup failed during delete"),
        }
        if execution_type == ExecutionType::Pipeline {
            let config_id = match backend.hget(&key, fields::PIPELINE_CONFIG_ID).await {
                Ok(config_id) => config_id,
                Err(err) => {
                    warn!(error = %err, id, "config lookup failed during delete");
                    None
                }
            };
            ops.push(WriteOp::ZRem {
                key: keys::executions_for_config_key(config_id.as_deref()),
                member: id.to_string(),
            });
        }
        ops.push(WriteOp::Del { key });
        ops.push(WriteOp::Del { key: index_key });
        ops.push(WriteOp::SRem {
            key: keys::all_jobs_key(execution_type),
            member: id.to_string(),
        });

        backend.transaction(ops).await
    }

    /// Merges a patch into the execution's `context` field under optimistic
    /// concurrency: watch, read, merge, write, restart on contention.
    ///
    /// The id may be a raw execution id or an already-qualified key
    /// (`pipeline:<id>` / `orchestration:<id>`); both forms are probed on
    /// both backends. An empty patch is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no record exists under any probed key;
    /// surfaces repeated contention as a backend error.
    pub async fn store_execution_context(
        &self,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let (backend, key) = self.resolve_context_key(id).await?;

        for attempt in 1..=MAX_CONTEXT_MERGE_ATTEMPTS {
            let current = backend.hget(&key, fields::CONTEXT).await?;
            let mut merged: Map<String, Value> = current
                .as_deref()
                .map(|raw| {
                    serde_json::from_str(raw).map_err(|err| {
                        Error::serialization(format!("field context is not valid: {err}"))
                    })
                })
                .transpose()?
                .unwrap_or_default();
            for (field, value) in patch {
                merged.insert(field.clone(), value.clone());
            }
            let value = serde_json::to_string(&merged)?;

            if backend
                .hset_if_unchanged(&key, fields::CONTEXT, current.as_deref(), &value)
                .await?
                .is_applied()
            {
                return Ok(());
            }
            self.metrics.record_context_merge_retry();
            debug!(key, attempt, "context moved under us, retrying merge");
        }

        Err(Error::backend(format!(
            "context merge for {key} lost {MAX_CONTEXT_MERGE_ATTEMPTS} optimistic races"
        )))
    }

    async fn resolve_context_key(&self, id: &str) -> Result<(Arc<dyn Backend>, String)> {
        let candidates: Vec<String> = if id.starts_with("pipeline:") || id.starts_with("orchestration:")
        {
            vec![id.to_string()]
        } else {
            ExecutionType::all()
                .iter()
                .map(|t| keys::execution_key(*t, id))
                .collect()
        };
        for backend in self.router.all() {
            for key in &candidates {
                if backend.exists(key).await? {
                    return Ok((backend, key.clone()));
                }
            }
        }
        Err(Error::not_found("execution", id))
    }

    async fn current_status(
        &self,
        backend: &Arc<dyn Backend>,
        execution_type: ExecutionType,
        key: &str,
        id: &str,
    ) -> Result<ExecutionStatus> {
        backend
            .hget(key, fields::STATUS)
            .await?
            .ok_or_else(|| Error::not_found(execution_type.as_str(), id))?
            .parse()
    }
}
