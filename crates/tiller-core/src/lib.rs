//! # tiller-core
//!
//! Core primitives for the Tiller pipeline-orchestration service.
//!
//! This crate provides the foundational types used across all Tiller
//! components:
//!
//! - **Execution Model**: Executions, stages, tasks, and their statuses
//! - **Identifiers**: Opaque, ULID-generated execution ids
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging bootstrap for hosting binaries
//!
//! ## Crate Boundary
//!
//! `tiller-core` is the **only** crate allowed to define shared primitives.
//! The repository crate and the execution engine both speak the types
//! defined here.
//!
//! ## Example
//!
//! ```rust
//! use tiller_core::prelude::*;
//!
//! let execution = ExecutionBuilder::pipeline("demo")
//!     .with_pipeline_config_id("cfg-1")
//!     .with_stage(Stage::new("wait"))
//!     .build();
//!
//! assert_eq!(execution.execution_type, ExecutionType::Pipeline);
//! assert!(!execution.status.is_complete());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod execution;
pub mod id;
pub mod observability;
pub mod stage;
pub mod status;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use tiller_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::execution::{
        AuthenticationDetails, Execution, ExecutionBuilder, ExecutionType, PausedDetails,
    };
    pub use crate::id::ExecutionId;
    pub use crate::stage::{ExecutionRef, LastModifiedDetails, Stage, SyntheticStageOwner};
    pub use crate::status::ExecutionStatus;
}

pub use error::{Error, Result};
pub use execution::{
    AuthenticationDetails, Execution, ExecutionBuilder, ExecutionType, PausedDetails,
    DEFAULT_EXECUTION_ENGINE,
};
pub use id::ExecutionId;
pub use observability::{init_logging, LogFormat};
pub use stage::{ExecutionRef, LastModifiedDetails, Stage, SyntheticStageOwner};
pub use status::ExecutionStatus;
