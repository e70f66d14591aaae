//! Execution and stage status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The status of an execution or one of its stages.
///
/// The wire form is `SCREAMING_SNAKE_CASE` (`NOT_STARTED`, `RUNNING`, ...),
/// both in persisted hash fields and in JSON blobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Queued but not yet started.
    #[default]
    NotStarted,
    /// Currently executing.
    Running,
    /// Paused by an operator; resumable.
    Paused,
    /// Suspended waiting on an external condition.
    Suspended,
    /// Completed successfully.
    Succeeded,
    /// Failed, but downstream work was allowed to continue.
    FailedContinue,
    /// Failed terminally; no further work will run.
    Terminal,
    /// Canceled by a user or by policy.
    Canceled,
    /// Redirected to re-run part of the workflow.
    Redirect,
    /// Stopped early without error.
    Stopped,
    /// Skipped entirely.
    Skipped,
    /// Held back by a concurrency limit.
    Buffered,
}

impl ExecutionStatus {
    /// Returns true if this status is a completed end state.
    #[must_use]
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::FailedContinue
                | Self::Terminal
                | Self::Canceled
                | Self::Stopped
                | Self::Skipped
        )
    }

    /// Returns true if this status halts the execution and everything below it.
    #[must_use]
    pub fn is_halt(self) -> bool {
        matches!(self, Self::Terminal | Self::Canceled | Self::Stopped)
    }

    /// Returns the wire form of this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Suspended => "SUSPENDED",
            Self::Succeeded => "SUCCEEDED",
            Self::FailedContinue => "FAILED_CONTINUE",
            Self::Terminal => "TERMINAL",
            Self::Canceled => "CANCELED",
            Self::Redirect => "REDIRECT",
            Self::Stopped => "STOPPED",
            Self::Skipped => "SKIPPED",
            Self::Buffered => "BUFFERED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(Self::NotStarted),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "SUSPENDED" => Ok(Self::Suspended),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED_CONTINUE" => Ok(Self::FailedContinue),
            "TERMINAL" => Ok(Self::Terminal),
            "CANCELED" => Ok(Self::Canceled),
            "REDIRECT" => Ok(Self::Redirect),
            "STOPPED" => Ok(Self::Stopped),
            "SKIPPED" => Ok(Self::Skipped),
            "BUFFERED" => Ok(Self::Buffered),
            other => Err(Error::serialization(format!(
                "unrecognized execution status '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_statuses() {
        for status in [
            ExecutionStatus::Succeeded,
            ExecutionStatus::FailedContinue,
            ExecutionStatus::Terminal,
            ExecutionStatus::Canceled,
            ExecutionStatus::Stopped,
            ExecutionStatus::Skipped,
        ] {
            assert!(status.is_complete(), "{status} should be complete");
        }
        for status in [
            ExecutionStatus::NotStarted,
            ExecutionStatus::Running,
            ExecutionStatus::Paused,
            ExecutionStatus::Suspended,
            ExecutionStatus::Redirect,
            ExecutionStatus::Buffered,
        ] {
            assert!(!status.is_complete(), "{status} should not be complete");
        }
    }

    #[test]
    fn wire_form_round_trips() {
        for status in [
            ExecutionStatus::NotStarted,
            ExecutionStatus::FailedContinue,
            ExecutionStatus::Buffered,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("BOGUS".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn json_form_matches_hash_field_form() {
        let json = serde_json::to_string(&ExecutionStatus::FailedContinue).unwrap();
        assert_eq!(json, "\"FAILED_CONTINUE\"");
    }
}
