//! Executions: the root aggregate of the repository.
//!
//! An execution is one run of a workflow. Pipelines are long-running and
//! versioned by a configuration id; orchestrations are ad-hoc and scoped to
//! an application.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::id::ExecutionId;
use crate::stage::Stage;
use crate::status::ExecutionStatus;

/// The execution engine tag assumed when a persisted record carries none.
pub const DEFAULT_EXECUTION_ENGINE: &str = "v2";

/// The trigger field holding an external correlation key.
pub const CORRELATION_ID_FIELD: &str = "correlationId";

/// The trigger field holding a nested parent execution.
pub const PARENT_EXECUTION_FIELD: &str = "parentExecution";

/// The two kinds of workflow record the repository stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    /// Long-running, versioned by a pipeline configuration id.
    Pipeline,
    /// Ad-hoc, scoped to an application.
    Orchestration,
}

impl ExecutionType {
    /// Returns the wire form, used as a key prefix.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pipeline => "pipeline",
            Self::Orchestration => "orchestration",
        }
    }

    /// Both execution types, pipelines first.
    #[must_use]
    pub fn all() -> [Self; 2] {
        [Self::Pipeline, Self::Orchestration]
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pipeline" => Ok(Self::Pipeline),
            "orchestration" => Ok(Self::Orchestration),
            other => Err(Error::serialization(format!(
                "unrecognized execution type '{other}'"
            ))),
        }
    }
}

/// The identity under which an execution runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationDetails {
    /// The authenticated user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Accounts the user may act on.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_accounts: BTreeSet<String>,
}

/// Pause bookkeeping for an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedDetails {
    /// Who paused the execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_by: Option<String>,
    /// Who resumed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_by: Option<String>,
    /// When it was paused, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_time: Option<i64>,
    /// When it was resumed, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_time: Option<i64>,
}

impl PausedDetails {
    /// Returns true while paused: a pause time exists with no resume time.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.pause_time.is_some() && self.resume_time.is_none()
    }

    /// Milliseconds spent paused, zero until resumed.
    #[must_use]
    pub fn paused_ms(&self) -> i64 {
        match (self.pause_time, self.resume_time) {
            (Some(paused), Some(resumed)) => resumed - paused,
            _ => 0,
        }
    }
}

/// One run of a workflow, either a pipeline or an orchestration.
///
/// The repository persists this aggregate as a flat field-addressed record
/// plus an ordered stage-id list; see the repository crate for the encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    /// Globally unique, opaque identifier.
    pub id: ExecutionId,

    /// Whether this is a pipeline or an orchestration.
    #[serde(rename = "type")]
    pub execution_type: ExecutionType,

    /// The application this execution belongs to.
    pub application: String,

    /// Pipeline name. Pipelines only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The pipeline configuration this execution was built from. Pipelines only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_config_id: Option<String>,

    /// Free-form description. Orchestrations only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Current status.
    #[serde(default)]
    pub status: ExecutionStatus,

    /// When the execution record was built, epoch milliseconds.
    #[serde(default)]
    pub build_time: i64,

    /// When execution began, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,

    /// When execution finished, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,

    /// Set when cancellation has been requested. A running execution keeps
    /// its status; the runner observes the flag and stops.
    #[serde(default)]
    pub canceled: bool,

    /// Who requested cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled_by: Option<String>,

    /// Why cancellation was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,

    /// Whether concurrent executions of the same configuration are limited.
    #[serde(default)]
    pub limit_concurrent: bool,

    /// Whether queued pipelines keep waiting when this one completes.
    #[serde(default)]
    pub keep_waiting_pipelines: bool,

    /// The identity under which this execution runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationDetails>,

    /// Pause bookkeeping, present once the execution has been paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<PausedDetails>,

    /// Which engine executes this record.
    #[serde(default = "default_execution_engine")]
    pub execution_engine: String,

    /// Where the execution was created (API, UI, scheduled trigger, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// What started this execution. May contain a `correlationId` and a
    /// nested `parentExecution`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub trigger: Map<String, Value>,

    /// Notification subscriptions. Pipelines only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<Value>,

    /// The pipeline configuration as submitted. Pipelines only.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub initial_config: Map<String, Value>,

    /// Ordered stages. The order on disk is authoritative.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,
}

fn default_execution_engine() -> String {
    DEFAULT_EXECUTION_ENGINE.to_string()
}

impl Execution {
    /// Returns the correlation key carried in the trigger, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.trigger
            .get(CORRELATION_ID_FIELD)
            .and_then(Value::as_str)
    }

    /// Reifies the parent execution nested in the trigger, if any.
    #[must_use]
    pub fn parent_execution(&self) -> Option<Execution> {
        self.trigger
            .get(PARENT_EXECUTION_FIELD)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Looks up a stage by id.
    #[must_use]
    pub fn stage_by_id(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.id == stage_id)
    }

    /// Looks up a stage by its caller-chosen logical id.
    #[must_use]
    pub fn stage_by_ref_id(&self, ref_id: &str) -> Option<&Stage> {
        self.stages
            .iter()
            .find(|stage| stage.ref_id.as_deref() == Some(ref_id))
    }
}

/// Fluent construction of executions, mainly for callers assembling new
/// records and for tests.
#[derive(Debug, Clone)]
pub struct ExecutionBuilder {
    execution: Execution,
}

impl ExecutionBuilder {
    /// Starts a pipeline execution for the given application.
    #[must_use]
    pub fn pipeline(application: impl Into<String>) -> Self {
        Self::new(ExecutionType::Pipeline, application)
    }

    /// Starts an orchestration execution for the given application.
    #[must_use]
    pub fn orchestration(application: impl Into<String>) -> Self {
        Self::new(ExecutionType::Orchestration, application)
    }

    fn new(execution_type: ExecutionType, application: impl Into<String>) -> Self {
        Self {
            execution: Execution {
                id: ExecutionId::generate(),
                execution_type,
                application: application.into(),
                name: None,
                pipeline_config_id: None,
                description: None,
                status: ExecutionStatus::NotStarted,
                build_time: Utc::now().timestamp_millis(),
                start_time: None,
                end_time: None,
                canceled: false,
                canceled_by: None,
                cancellation_reason: None,
                limit_concurrent: false,
                keep_waiting_pipelines: false,
                authentication: None,
                paused: None,
                execution_engine: default_execution_engine(),
                origin: None,
                trigger: Map::new(),
                notifications: Vec::new(),
                initial_config: Map::new(),
                stages: Vec::new(),
            },
        }
    }

    /// Overrides the generated id, re-parenting any stages already added.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<ExecutionId>) -> Self {
        self.execution.id = id.into();
        for stage in &mut self.execution.stages {
            if let Some(parent) = &mut stage.execution {
                parent.id = self.execution.id.clone();
            }
        }
        self
    }

    /// Sets the pipeline name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.execution.name = Some(name.into());
        self
    }

    /// Sets the pipeline configuration id.
    #[must_use]
    pub fn with_pipeline_config_id(mut self, config_id: impl Into<String>) -> Self {
        self.execution.pipeline_config_id = Some(config_id.into());
        self
    }

    /// Sets the orchestration description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.execution.description = Some(description.into());
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.execution.status = status;
        self
    }

    /// Sets the build time, epoch milliseconds.
    #[must_use]
    pub fn with_build_time(mut self, build_time: i64) -> Self {
        self.execution.build_time = build_time;
        self
    }

    /// Sets a trigger entry.
    #[must_use]
    pub fn with_trigger_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.execution.trigger.insert(key.into(), value);
        self
    }

    /// Sets the authentication details.
    #[must_use]
    pub fn with_authentication(mut self, authentication: AuthenticationDetails) -> Self {
        self.execution.authentication = Some(authentication);
        self
    }

    /// Sets the origin.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.execution.origin = Some(origin.into());
        self
    }

    /// Limits concurrent executions of the same configuration.
    #[must_use]
    pub fn with_limit_concurrent(mut self, limit: bool) -> Self {
        self.execution.limit_concurrent = limit;
        self
    }

    /// Appends a stage, attaching its back-reference.
    #[must_use]
    pub fn with_stage(mut self, mut stage: Stage) -> Self {
        stage.execution = Some(crate::stage::ExecutionRef {
            id: self.execution.id.clone(),
            execution_type: self.execution.execution_type,
        });
        self.execution.stages.push(stage);
        self
    }

    /// Finishes construction.
    #[must_use]
    pub fn build(self) -> Execution {
        self.execution
    }
}
