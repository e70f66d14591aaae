//! The backend key layout.
//!
//! Every key the repository touches is built here; no other module formats
//! key strings. The layout:
//!
//! | Key | Kind | Holds |
//! |-----|------|-------|
//! | `pipeline:<id>`, `orchestration:<id>` | hash | the execution record |
//! | `<type>:<id>:stageIndex` | list | stage ids in order |
//! | `allJobs:<type>` | set | every execution id of that type |
//! | `<type>:app:<app>` | set | execution ids per application |
//! | `pipeline:executions:<configId>` | sorted set | pipeline ids scored by build time |
//! | `correlation:<correlationId>` | string | id of an in-flight orchestration |

use tiller_core::ExecutionType;

/// Sentinel stored in place of a missing pipeline configuration id.
pub const MISSING_CONFIG_SENTINEL: &str = "---";

/// The hash holding an execution record.
#[must_use]
pub fn execution_key(execution_type: ExecutionType, id: &str) -> String {
    format!("{execution_type}:{id}")
}

/// The list holding an execution's stage ids in order.
#[must_use]
pub fn stage_index_key(execution_type: ExecutionType, id: &str) -> String {
    format!("{execution_type}:{id}:stageIndex")
}

/// The set of all execution ids of a type.
#[must_use]
pub fn all_jobs_key(execution_type: ExecutionType) -> String {
    format!("allJobs:{execution_type}")
}

/// The set of execution ids for one application.
#[must_use]
pub fn app_key(execution_type: ExecutionType, application: &str) -> String {
    format!("{execution_type}:app:{application}")
}

/// The sorted set of pipeline ids for one pipeline configuration,
/// scored by build time. A missing configuration id is stored under the
/// sentinel `---`.
#[must_use]
pub fn executions_for_config_key(pipeline_config_id: Option<&str>) -> String {
    format!(
        "pipeline:executions:{}",
        pipeline_config_id.unwrap_or(MISSING_CONFIG_SENTINEL)
    )
}

/// The string pointer from a correlation key to an in-flight orchestration.
#[must_use]
pub fn correlation_key(correlation_id: &str) -> String {
    format!("correlation:{correlation_id}")
}

/// The hash-field prefix under which one stage's fields live.
#[must_use]
pub fn stage_prefix(stage_id: &str) -> String {
    format!("stage.{stage_id}.")
}

/// One namespaced stage field, e.g. `stage.<id>.context`.
#[must_use]
pub fn stage_field(stage_id: &str, suffix: &str) -> String {
    format!("stage.{stage_id}.{suffix}")
}
