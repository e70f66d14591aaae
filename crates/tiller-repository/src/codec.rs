//! Encoding between the execution aggregate and its flat persisted form.
//!
//! An execution is stored as a field-addressed hash plus an ordered
//! stage-id list. Top-level scalars live under fixed field names; each
//! stage contributes a fixed set of fields namespaced `stage.<id>.<suffix>`.
//! Structured values (`context`, `trigger`, `paused`, ...) are JSON-encoded
//! strings; numbers are decimal strings; absent optional values are simply
//! omitted — the literal string "null" is never written.
//!
//! The ordered stage-id list is authoritative for stage order. The hash
//! also carries a denormalized comma-joined `stageIndex` field, kept in
//! agreement by the writer and used as a fallback for legacy records whose
//! list key is missing.

use std::collections::HashMap;

use serde_json::{Map, Value};

use tiller_core::execution::{Execution, ExecutionType, DEFAULT_EXECUTION_ENGINE};
use tiller_core::stage::{ExecutionRef, Stage};
use tiller_core::{Error, ExecutionId, ExecutionStatus, Result};

use crate::keys;

/// Top-level hash field names.
pub mod fields {
    /// The application tag.
    pub const APPLICATION: &str = "application";
    /// Pipeline name.
    pub const NAME: &str = "name";
    /// Pipeline configuration id.
    pub const PIPELINE_CONFIG_ID: &str = "pipelineConfigId";
    /// Orchestration description.
    pub const DESCRIPTION: &str = "description";
    /// Execution status.
    pub const STATUS: &str = "status";
    /// Build time, epoch milliseconds.
    pub const BUILD_TIME: &str = "buildTime";
    /// Start time, epoch milliseconds.
    pub const START_TIME: &str = "startTime";
    /// End time, epoch milliseconds.
    pub const END_TIME: &str = "endTime";
    /// Cancellation flag.
    pub const CANCELED: &str = "canceled";
    /// Who requested cancellation.
    pub const CANCELED_BY: &str = "canceledBy";
    /// Why cancellation was requested.
    pub const CANCELLATION_REASON: &str = "cancellationReason";
    /// Concurrency-limit flag.
    pub const LIMIT_CONCURRENT: &str = "limitConcurrent";
    /// Keep-waiting flag for queued pipelines.
    pub const KEEP_WAITING_PIPELINES: &str = "keepWaitingPipelines";
    /// Authentication details, JSON.
    pub const AUTHENTICATION: &str = "authentication";
    /// Pause bookkeeping, JSON.
    pub const PAUSED: &str = "paused";
    /// Execution engine tag.
    pub const EXECUTION_ENGINE: &str = "executionEngine";
    /// Origin of the execution.
    pub const ORIGIN: &str = "origin";
    /// Trigger, JSON.
    pub const TRIGGER: &str = "trigger";
    /// Notifications, JSON array.
    pub const NOTIFICATIONS: &str = "notifications";
    /// Initial pipeline configuration, JSON.
    pub const INITIAL_CONFIG: &str = "initialConfig";
    /// Denormalized comma-joined stage order.
    pub const STAGE_INDEX: &str = "stageIndex";
    /// Stage-scoped working data, merged by `store_execution_context`.
    pub const CONTEXT: &str = "context";
    /// Legacy field cleaned up on every full store.
    pub const LEGACY_CONFIG: &str = "config";
}

/// Every namespaced field suffix a stage persists, in encode order.
///
/// Stage removal deletes exactly these suffixes, so the set must stay in
/// lockstep with [`encode_stage`].
pub const STAGE_FIELD_SUFFIXES: [&str; 14] = [
    "refId",
    "type",
    "name",
    "startTime",
    "endTime",
    "status",
    "syntheticStageOwner",
    "parentStageId",
    "requisiteStageRefIds",
    "scheduledTime",
    "context",
    "outputs",
    "tasks",
    "lastModified",
];

/// The flat persisted form of an execution.
#[derive(Debug, Clone)]
pub struct EncodedExecution {
    /// Hash fields, absent values already filtered out.
    pub fields: Vec<(String, String)>,
    /// Stage ids in authoritative order.
    pub stage_ids: Vec<String>,
}

/// The flat persisted form of one stage.
#[derive(Debug, Clone)]
pub struct EncodedStage {
    /// Namespaced fields with present values.
    pub present: Vec<(String, String)>,
    /// Namespaced field names whose value is absent; the writer deletes
    /// these on a stage overwrite.
    pub absent: Vec<String>,
}

fn push_present(
    out: &mut Vec<(String, String)>,
    name: impl Into<String>,
    value: Option<String>,
) {
    if let Some(value) = value {
        out.push((name.into(), value));
    }
}

/// Serializes an execution into its hash fields and ordered stage-id list.
///
/// # Errors
///
/// Returns a serialization error when a structured value cannot be
/// JSON-encoded.
pub fn encode(execution: &Execution) -> Result<EncodedExecution> {
    let stage_ids: Vec<String> = execution.stages.iter().map(|s| s.id.clone()).collect();

    let mut out = Vec::new();
    out.push((
        fields::APPLICATION.to_string(),
        execution.application.clone(),
    ));
    out.push((
        fields::STATUS.to_string(),
        execution.status.as_str().to_string(),
    ));
    out.push((
        fields::BUILD_TIME.to_string(),
        execution.build_time.to_string(),
    ));
    push_present(
        &mut out,
        fields::START_TIME,
        execution.start_time.map(|t| t.to_string()),
    );
    push_present(
        &mut out,
        fields::END_TIME,
        execution.end_time.map(|t| t.to_string()),
    );
    out.push((
        fields::CANCELED.to_string(),
        execution.canceled.to_string(),
    ));
    push_present(&mut out, fields::CANCELED_BY, execution.canceled_by.clone());
    push_present(
        &mut out,
        fields::CANCELLATION_REASON,
        execution.cancellation_reason.clone(),
    );
    out.push((
        fields::LIMIT_CONCURRENT.to_string(),
        execution.limit_concurrent.to_string(),
    ));
    out.push((
        fields::KEEP_WAITING_PIPELINES.to_string(),
        execution.keep_waiting_pipelines.to_string(),
    ));
    push_present(
        &mut out,
        fields::AUTHENTICATION,
        execution
            .authentication
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
    );
    push_present(
        &mut out,
        fields::PAUSED,
        execution
            .paused
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
    );
    out.push((
        fields::EXECUTION_ENGINE.to_string(),
        execution.execution_engine.clone(),
    ));
    push_present(&mut out, fields::ORIGIN, execution.origin.clone());
    out.push((
        fields::TRIGGER.to_string(),
        serde_json::to_string(&execution.trigger)?,
    ));

    match execution.execution_type {
        ExecutionType::Pipeline => {
            push_present(&mut out, fields::NAME, execution.name.clone());
            push_present(
                &mut out,
                fields::PIPELINE_CONFIG_ID,
                execution.pipeline_config_id.clone(),
            );
            out.push((
                fields::NOTIFICATIONS.to_string(),
                serde_json::to_string(&execution.notifications)?,
            ));
            out.push((
                fields::INITIAL_CONFIG.to_string(),
                serde_json::to_string(&execution.initial_config)?,
            ));
        }
        ExecutionType::Orchestration => {
            push_present(&mut out, fields::DESCRIPTION, execution.description.clone());
        }
    }

    out.push((fields::STAGE_INDEX.to_string(), stage_ids.join(",")));

    for stage in &execution.stages {
        out.extend(encode_stage(stage)?.present);
    }

    Ok(EncodedExecution {
        fields: out,
        stage_ids,
    })
}

/// Serializes one stage into its namespaced fields.
///
/// # Errors
///
/// Returns a serialization error when a structured value cannot be
/// JSON-encoded.
pub fn encode_stage(stage: &Stage) -> Result<EncodedStage> {
    let values: [(&str, Option<String>); 14] = [
        ("refId", stage.ref_id.clone()),
        ("type", Some(stage.stage_type.clone())),
        ("name", stage.name.clone()),
        ("startTime", stage.start_time.map(|t| t.to_string())),
        ("endTime", stage.end_time.map(|t| t.to_string())),
        ("status", Some(stage.status.as_str().to_string())),
        (
            "syntheticStageOwner",
            stage.synthetic_stage_owner.map(|o| o.as_str().to_string()),
        ),
        ("parentStageId", stage.parent_stage_id.clone()),
        (
            "requisiteStageRefIds",
            if stage.requisite_stage_ref_ids.is_empty() {
                None
            } else {
                Some(
                    stage
                        .requisite_stage_ref_ids
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(","),
                )
            },
        ),
        ("scheduledTime", stage.scheduled_time.map(|t| t.to_string())),
        ("context", Some(serde_json::to_string(&stage.context)?)),
        ("outputs", Some(serde_json::to_string(&stage.outputs)?)),
        ("tasks", Some(serde_json::to_string(&stage.tasks)?)),
        (
            "lastModified",
            stage
                .last_modified
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        ),
    ];

    let mut present = Vec::new();
    let mut absent = Vec::new();
    for (suffix, value) in values {
        let field = keys::stage_field(&stage.id, suffix);
        match value {
            Some(value) => present.push((field, value)),
            None => absent.push(field),
        }
    }

    Ok(EncodedStage { present, absent })
}

fn parse_i64(fields: &HashMap<String, String>, name: &str) -> Result<Option<i64>> {
    fields
        .get(name)
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|_| Error::serialization(format!("field {name} is not a number: {raw}")))
        })
        .transpose()
}

fn parse_bool(fields: &HashMap<String, String>, name: &str) -> bool {
    fields.get(name).is_some_and(|raw| raw == "true")
}

fn parse_json<T: serde::de::DeserializeOwned + Default>(
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<T> {
    fields
        .get(name)
        .map(|raw| {
            serde_json::from_str(raw)
                .map_err(|err| Error::serialization(format!("field {name} is not valid: {err}")))
        })
        .transpose()
        .map(Option::unwrap_or_default)
}

fn parse_status(fields: &HashMap<String, String>, name: &str) -> Result<ExecutionStatus> {
    fields
        .get(name)
        .map(|raw| raw.parse())
        .transpose()
        .map(Option::unwrap_or_default)
}

/// Reconstructs an execution from its hash fields and ordered stage-id list.
///
/// Falls back to the denormalized `stageIndex` field when the ordered list
/// is empty (legacy records). Stage ids present in the order with no visible
/// fields are tolerated and skipped. Each decoded stage is re-parented to
/// the execution.
///
/// # Errors
///
/// Returns a serialization error when a field cannot be parsed.
pub fn decode(
    execution_type: ExecutionType,
    id: &str,
    fields_map: &HashMap<String, String>,
    stage_ids: &[String],
) -> Result<Execution> {
    let order: Vec<String> = if stage_ids.is_empty() {
        fields_map
            .get(fields::STAGE_INDEX)
            .map(|joined| {
                joined
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    } else {
        stage_ids.to_vec()
    };

    let mut stages = Vec::new();
    for stage_id in &order {
        if let Some(mut stage) = decode_stage(fields_map, stage_id)? {
            stage.execution = Some(ExecutionRef {
                id: ExecutionId::from(id),
                execution_type,
            });
            stages.push(stage);
        }
    }

    let execution_engine = fields_map
        .get(fields::EXECUTION_ENGINE)
        .cloned()
        .unwrap_or_else(|| DEFAULT_EXECUTION_ENGINE.to_string());

    Ok(Execution {
        id: ExecutionId::from(id),
        execution_type,
        application: fields_map
            .get(fields::APPLICATION)
            .cloned()
            .unwrap_or_default(),
        name: fields_map.get(fields::NAME).cloned(),
        pipeline_config_id: fields_map.get(fields::PIPELINE_CONFIG_ID).cloned(),
        description: fields_map.get(fields::DESCRIPTION).cloned(),
        status: parse_status(fields_map, fields::STATUS)?,
        build_time: parse_i64(fields_map, fields::BUILD_TIME)?.unwrap_or_default(),
        start_time: parse_i64(fields_map, fields::START_TIME)?,
        end_time: parse_i64(fields_map, fields::END_TIME)?,
        canceled: parse_bool(fields_map, fields::CANCELED),
        canceled_by: fields_map.get(fields::CANCELED_BY).cloned(),
        cancellation_reason: fields_map.get(fields::CANCELLATION_REASON).cloned(),
        limit_concurrent: parse_bool(fields_map, fields::LIMIT_CONCURRENT),
        keep_waiting_pipelines: parse_bool(fields_map, fields::KEEP_WAITING_PIPELINES),
        authentication: fields_map
            .get(fields::AUTHENTICATION)
            .map(|raw| {
                serde_json::from_str(raw).map_err(|err| {
                    Error::serialization(format!("field authentication is not valid: {err}"))
                })
            })
            .transpose()?,
        paused: fields_map
            .get(fields::PAUSED)
            .map(|raw| {
                serde_json::from_str(raw)
                    .map_err(|err| Error::serialization(format!("field paused is not valid: {err}")))
            })
            .transpose()?,
        execution_engine,
        origin: fields_map.get(fields::ORIGIN).cloned(),
        trigger: parse_json(fields_map, fields::TRIGGER)?,
        notifications: parse_json(fields_map, fields::NOTIFICATIONS)?,
        initial_config: parse_json(fields_map, fields::INITIAL_CONFIG)?,
        stages,
    })
}

fn decode_stage(fields_map: &HashMap<String, String>, stage_id: &str) -> Result<Option<Stage>> {
    let get = |suffix: &str| fields_map.get(&keys::stage_field(stage_id, suffix));

    // Tolerate an id in the order whose fields are not (yet) visible.
    if !STAGE_FIELD_SUFFIXES.iter().any(|suffix| get(suffix).is_some()) {
        return Ok(None);
    }

    let parse_time = |suffix: &str| -> Result<Option<i64>> {
        get(suffix)
            .map(|raw| {
                raw.parse::<i64>().map_err(|_| {
                    Error::serialization(format!(
                        "stage {stage_id} field {suffix} is not a number: {raw}"
                    ))
                })
            })
            .transpose()
    };
    let parse_blob = |suffix: &str| -> Result<Option<Value>> {
        get(suffix)
            .map(|raw| {
                serde_json::from_str(raw).map_err(|err| {
                    Error::serialization(format!(
                        "stage {stage_id} field {suffix} is not valid: {err}"
                    ))
                })
            })
            .transpose()
    };

    let context: Map<String, Value> = match parse_blob("context")? {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let outputs: Map<String, Value> = match parse_blob("outputs")? {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let tasks: Vec<Value> = match parse_blob("tasks")? {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    let last_modified = get("lastModified")
        .map(|raw| {
            serde_json::from_str(raw).map_err(|err| {
                Error::serialization(format!(
                    "stage {stage_id} field lastModified is not valid: {err}"
                ))
            })
        })
        .transpose()?;

    Ok(Some(Stage {
        id: stage_id.to_string(),
        ref_id: get("refId").cloned(),
        stage_type: get("type").cloned().unwrap_or_default(),
        name: get("name").cloned(),
        start_time: parse_time("startTime")?,
        end_time: parse_time("endTime")?,
        status: get("status")
            .map(|raw| raw.parse())
            .transpose()?
            .unwrap_or_default(),
        synthetic_stage_owner: get("syntheticStageOwner")
            .map(|raw| raw.parse())
            .transpose()?,
        parent_stage_id: get("parentStageId").cloned(),
        requisite_stage_ref_ids: get("requisiteStageRefIds")
            .map(|joined| {
                joined
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        scheduled_time: parse_time("scheduledTime")?,
        context,
        outputs,
        tasks,
        last_modified,
        execution: None,
    }))
}
