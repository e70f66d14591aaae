//! Stages: the ordered children of an execution.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::execution::ExecutionType;
use crate::id::ExecutionId;
use crate::status::ExecutionStatus;

/// Who inserted a synthetic stage, relative to its parent.
///
/// Wire form is `STAGE_BEFORE` / `STAGE_AFTER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyntheticStageOwner {
    /// The stage runs before its parent.
    StageBefore,
    /// The stage runs after its parent.
    StageAfter,
}

impl SyntheticStageOwner {
    /// Returns the wire form of this owner.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StageBefore => "STAGE_BEFORE",
            Self::StageAfter => "STAGE_AFTER",
        }
    }
}

impl fmt::Display for SyntheticStageOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyntheticStageOwner {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "STAGE_BEFORE" => Ok(Self::StageBefore),
            "STAGE_AFTER" => Ok(Self::StageAfter),
            other => Err(Error::serialization(format!(
                "unrecognized synthetic stage owner '{other}'"
            ))),
        }
    }
}

/// A non-owning handle from a stage back to the execution that contains it.
///
/// The persisted form of an execution is a tree; this back-reference is
/// reconstructed at decode time and never serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRef {
    /// The id of the owning execution.
    pub id: ExecutionId,
    /// The type of the owning execution.
    pub execution_type: ExecutionType,
}

/// Audit fields recording the most recent mutation of a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastModifiedDetails {
    /// Who performed the mutation.
    pub user: String,
    /// Accounts the user was allowed to act on at the time.
    #[serde(default)]
    pub allowed_accounts: Vec<String>,
    /// When the mutation happened, epoch milliseconds.
    pub last_modified_time: i64,
}

/// One node of an execution.
///
/// Stages are ordered within their execution; the order on disk is
/// authoritative. A stage may be synthetic, in which case it declares the
/// parent stage it was inserted around and whether it runs before or after
/// it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Unique id of this stage within its execution.
    pub id: String,

    /// Caller-chosen logical id, used by `requisite_stage_ref_ids`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,

    /// The stage type, resolved against the stage-type registry by the runner.
    #[serde(rename = "type")]
    pub stage_type: String,

    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// When the stage started, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,

    /// When the stage ended, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,

    /// Current status.
    #[serde(default)]
    pub status: ExecutionStatus,

    /// Set when this stage was inserted by machinery rather than authored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_stage_owner: Option<SyntheticStageOwner>,

    /// The stage this synthetic stage was inserted around.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_stage_id: Option<String>,

    /// Logical ids of stages that must complete before this one starts.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub requisite_stage_ref_ids: BTreeSet<String>,

    /// When the stage is scheduled to run, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<i64>,

    /// Stage-scoped working data.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,

    /// Values this stage published for downstream stages.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub outputs: Map<String, Value>,

    /// The stage's tasks; persisted and restored whole.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<Value>,

    /// Audit record of the latest mutation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<LastModifiedDetails>,

    /// Back-reference to the owning execution. Reconstructed on load,
    /// never persisted.
    #[serde(skip)]
    pub execution: Option<ExecutionRef>,
}

impl Stage {
    /// Creates a stage of the given type with a generated id.
    #[must_use]
    pub fn new(stage_type: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            ref_id: None,
            stage_type: stage_type.into(),
            name: None,
            start_time: None,
            end_time: None,
            status: ExecutionStatus::NotStarted,
            synthetic_stage_owner: None,
            parent_stage_id: None,
            requisite_stage_ref_ids: BTreeSet::new(),
            scheduled_time: None,
            context: Map::new(),
            outputs: Map::new(),
            tasks: Vec::new(),
            last_modified: None,
            execution: None,
        }
    }

    /// Overrides the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the caller-chosen logical id.
    #[must_use]
    pub fn with_ref_id(mut self, ref_id: impl Into<String>) -> Self {
        self.ref_id = Some(ref_id.into());
        self
    }

    /// Sets the stage name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the stage status.
    #[must_use]
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = status;
        self
    }

    /// Marks this stage synthetic, inserted around `parent_stage_id`.
    #[must_use]
    pub fn with_synthetic_owner(
        mut self,
        owner: SyntheticStageOwner,
        parent_stage_id: impl Into<String>,
    ) -> Self {
        self.synthetic_stage_owner = Some(owner);
        self.parent_stage_id = Some(parent_stage_id.into());
        self
    }

    /// Sets a context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Attaches the back-reference to the owning execution.
    #[must_use]
    pub fn with_execution(mut self, id: impl Into<ExecutionId>, execution_type: ExecutionType) -> Self {
        self.execution = Some(ExecutionRef {
            id: id.into(),
            execution_type,
        });
        self
    }

    /// Returns true if this stage was inserted by machinery: it declares
    /// both an owner relation and a parent stage.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.synthetic_stage_owner.is_some() && self.parent_stage_id.is_some()
    }

    /// Returns the back-reference to the owning execution.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the stage is detached, i.e. was built
    /// by hand and never attached to an execution.
    pub fn execution_ref(&self) -> Result<&ExecutionRef> {
        self.execution.as_ref().ok_or_else(|| {
            Error::invalid_argument(format!(
                "stage {} is not attached to an execution",
                self.id
            ))
        })
    }
}
