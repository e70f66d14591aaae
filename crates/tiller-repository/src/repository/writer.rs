//! Full-aggregate and incremental stage writes.
//!
//! Every write picks its backend through the router once and stays on it for
//! the whole call. Multi-field writes go through one backend transaction;
//! the only write outside a transaction is the correlation pointer, which
//! readers self-heal.

use tracing::debug;

use tiller_core::execution::{Execution, ExecutionType};
use tiller_core::stage::{Stage, SyntheticStageOwner};
use tiller_core::{Error, Result};

use crate::backend::{InsertPosition, WriteOp};
use crate::codec::{self, fields};
use crate::keys;

use super::ExecutionRepository;

impl ExecutionRepository {
    /// Stores a full execution: the hash record, the ordered stage-id list,
    /// and the secondary indices, atomically on one backend.
    ///
    /// When the trigger carries a `correlationId`, the correlation pointer
    /// is set after the transaction commits.
    ///
    /// # Errors
    ///
    /// Surfaces backend and serialization errors.
    #[allow(clippy::cast_precision_loss)] // build times fit comfortably in f64 scores
    pub async fn store(&self, execution: &Execution) -> Result<()> {
        let id = execution.id.as_str();
        let execution_type = execution.execution_type;
        let backend = self.router.locate(execution_type, id).await?;
        let key = keys::execution_key(execution_type, id);
        let index_key = keys::stage_index_key(execution_type, id);
        let encoded = codec::encode(execution)?;

        let mut ops = vec![
            WriteOp::SAdd {
                key: keys::all_jobs_key(execution_type),
                member: id.to_string(),
            },
            WriteOp::SAdd {
                key: keys::app_key(execution_type, &execution.application),
                member: id.to_string(),
            },
        ];
        if execution_type == ExecutionType::Pipeline {
            ops.push(WriteOp::ZAdd {
                key: keys::executions_for_config_key(execution.pipeline_config_id.as_deref()),
                score: execution.build_time as f64,
                member: id.to_string(),
            });
        }
        ops.push(WriteOp::HDel {
            key: key.clone(),
            fields: vec![fields::LEGACY_CONFIG.to_string()],
        });
        ops.push(WriteOp::HSet {
            key,
            fields: encoded.fields,
        });
        ops.push(WriteOp::Del {
            key: index_key.clone(),
        });
        if !encoded.stage_ids.is_empty() {
            ops.push(WriteOp::RPush {
                key: index_key,
                values: encoded.stage_ids,
            });
        }
        backend.transaction(ops).await?;

        if let Some(correlation_id) = execution.correlation_id() {
            backend
                .transaction(vec![WriteOp::Set {
                    key: keys::correlation_key(correlation_id),
                    value: id.to_string(),
                }])
                .await?;
        }

        debug!(
            backend = backend.name(),
            execution_type = %execution_type,
            id,
            "stored execution"
        );
        Ok(())
    }

    /// Overwrites one stage's namespaced fields; fields whose new value is
    /// absent are deleted in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a detached stage; surfaces backend and
    /// serialization errors.
    pub async fn store_stage(&self, stage: &Stage) -> Result<()> {
        let parent = stage.execution_ref()?.clone();
        let backend = self
            .router
            .locate(parent.execution_type, parent.id.as_str())
            .await?;
        let key = keys::execution_key(parent.execution_type, parent.id.as_str());
        let encoded = codec::encode_stage(stage)?;

        let mut ops = Vec::new();
        if !encoded.present.is_empty() {
            ops.push(WriteOp::HSet {
                key: key.clone(),
                fields: encoded.present,
            });
        }
        if !encoded.absent.is_empty() {
            ops.push(WriteOp::HDel {
                key,
                fields: encoded.absent,
            });
        }
        backend.transaction(ops).await
    }

    /// Overwrites only a stage's `context` field.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a detached stage; surfaces backend and
    /// serialization errors.
    pub async fn update_stage_context(&self, stage: &Stage) -> Result<()> {
        let parent = stage.execution_ref()?.clone();
        let backend = self
            .router
            .locate(parent.execution_type, parent.id.as_str())
            .await?;
        let key = keys::execution_key(parent.execution_type, parent.id.as_str());
        let context = serde_json::to_string(&stage.context)?;

        backend
            .transaction(vec![WriteOp::HSet {
                key,
                fields: vec![(keys::stage_field(&stage.id, "context"), context)],
            }])
            .await
    }

    /// Inserts a synthetic stage, splicing its id into the ordered list
    /// before or after its parent stage.
    ///
    /// The denormalized `stageIndex` field is rewritten from the ordered
    /// list after the transaction commits; a concurrent reader may briefly
    /// observe the two disagreeing and must prefer the list.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the stage is not synthetic (it must
    /// declare both an owner relation and a parent stage) or is detached;
    /// surfaces backend and serialization errors.
    pub async fn add_stage(&self, stage: &Stage) -> Result<()> {
        let (Some(owner), Some(parent_stage_id)) = (
            stage.synthetic_stage_owner,
            stage.parent_stage_id.as_deref(),
        ) else {
            return Err(Error::invalid_argument(
                "only synthetic stages can be inserted ad-hoc",
            ));
        };

        let parent = stage.execution_ref()?.clone();
        let backend = self
            .router
            .locate(parent.execution_type, parent.id.as_str())
            .await?;
        let key = keys::execution_key(parent.execution_type, parent.id.as_str());
        let index_key = keys::stage_index_key(parent.execution_type, parent.id.as_str());
        let encoded = codec::encode_stage(stage)?;
        let position = match owner {
            SyntheticStageOwner::StageBefore => InsertPosition::Before,
            SyntheticStageOwner::StageAfter => InsertPosition::After,
        };

        backend
            .transaction(vec![
                WriteOp::HSet {
                    key: key.clone(),
                    fields: encoded.present,
                },
                WriteOp::LInsert {
                    key: index_key.clone(),
                    position,
                    pivot: parent_stage_id.to_string(),
                    value: stage.id.clone(),
                },
            ])
            .await?;

        let order = backend.lrange(&index_key, 0, -1).await?;
        backend
            .transaction(vec![WriteOp::HSet {
                key,
                fields: vec![(fields::STAGE_INDEX.to_string(), order.join(","))],
            }])
            .await
    }

    /// Removes a stage: drops it from the ordered list, rewrites the
    /// denormalized `stageIndex` field, and deletes every namespaced field
    /// of the stage, in one transaction.
    ///
    /// # Errors
    ///
    /// Surfaces backend errors.
    pub async fn remove_stage(&self, execution: &Execution, stage_id: &str) -> Result<()> {
        let execution_type = execution.execution_type;
        let id = execution.id.as_str();
        let backend = self.router.locate(execution_type, id).await?;
        let key = keys::execution_key(execution_type, id);
        let index_key = keys::stage_index_key(execution_type, id);

        let current = backend.lrange(&index_key, 0, -1).await?;
        let list_exists = !current.is_empty();
        let current = if list_exists {
            current
        } else {
            // Legacy record: the order only lives in the denormalized field.
            backend
                .hget(&key, fields::STAGE_INDEX)
                .await?
                .map(|joined| {
                    joined
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let remaining: Vec<String> = current.into_iter().filter(|s| s != stage_id).collect();

        let mut ops = vec![WriteOp::HSet {
            key: key.clone(),
            fields: vec![(fields::STAGE_INDEX.to_string(), remaining.join(","))],
        }];
        if list_exists {
            ops.push(WriteOp::LRem {
                key: index_key,
                value: stage_id.to_string(),
            });
        } else {
            ops.push(WriteOp::Del {
                key: index_key.clone(),
            });
            if !remaining.is_empty() {
                ops.push(WriteOp::RPush {
                    key: index_key,
                    values: remaining,
                });
            }
        }
        ops.push(WriteOp::HDel {
            key,
            fields: codec::STAGE_FIELD_SUFFIXES
                .iter()
                .map(|suffix| keys::stage_field(stage_id, suffix))
                .collect(),
        });

        backend.transaction(ops).await
    }
}
