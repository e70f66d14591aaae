//! # tiller-repository
//!
//! The durable state layer for the Tiller pipeline-orchestration service.
//!
//! This crate stores two kinds of workflow record — long-running
//! **pipelines** and ad-hoc **orchestrations** — together with their
//! ordered stages, tasks, and contextual data, inside a flat key/value
//! store. It provides:
//!
//! - **Aggregate persistence**: full executions and incremental stage
//!   mutations, written atomically with their secondary indices
//! - **Backend routing**: a unified view over a current and an optional
//!   previous store during rolling migrations
//! - **Streaming queries**: lazy, chunked, concurrently fanned-out scans
//!   with bounded worker pools and self-healing indices
//! - **Lifecycle control**: cancel, pause, resume, status updates, and
//!   optimistic context merges
//!
//! ## Guarantees
//!
//! - Multi-field writes and the hash-plus-stage-list read are atomic per
//!   operation on one backend
//! - The ordered stage-id list is authoritative; the denormalized
//!   `stageIndex` field agrees with it after every write that touches
//!   either
//! - An id present in both backends always resolves to the primary
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tiller_core::prelude::*;
//! use tiller_repository::{Backend, ExecutionRepository, MemoryBackend};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
//! let repository = ExecutionRepository::new(backend);
//!
//! let execution = ExecutionBuilder::pipeline("demo")
//!     .with_pipeline_config_id("cfg-1")
//!     .with_stage(Stage::new("wait"))
//!     .build();
//!
//! repository.store(&execution).await?;
//! let loaded = repository
//!     .retrieve(ExecutionType::Pipeline, execution.id.as_str())
//!     .await?;
//! assert_eq!(loaded.stages.len(), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod codec;
pub mod config;
pub mod keys;
pub mod metrics;
pub mod repository;
pub mod router;

pub use backend::{
    Backend, CasOutcome, InsertPosition, KeyKind, MemoryBackend, RedisBackend, WriteOp,
};
pub use config::RepositoryConfig;
pub use metrics::RepositoryMetrics;
pub use repository::query::ExecutionCriteria;
pub use repository::ExecutionRepository;
pub use router::BackendRouter;
