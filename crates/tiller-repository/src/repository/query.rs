//! Lazy, chunked, concurrently fanned-out streaming queries.
//!
//! Every query follows the same shape: resolve a seed id collection from an
//! index key on each backend, pre-filter by status when asked, deduplicate
//! the previous backend against the primary's chosen ids, then hand the ids
//! to workers in chunks. Workers are bounded by one of two pools: a small
//! fixed pool for whole-table scans and a larger configurable pool for
//! application- and pipeline-scoped queries. Both backends' output merges
//! into one channel; dropping the receiver stops the fan-out.
//!
//! A seed id whose record no longer exists is removed from the seed index
//! on discovery (set-remove or sorted-set-remove, picked by the key's
//! runtime type). Removal is idempotent, so concurrent readers healing the
//! same id are safe.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use tiller_core::execution::{Execution, ExecutionType};
use tiller_core::{Error, ExecutionStatus, Result};

use crate::backend::{Backend, KeyKind, WriteOp};
use crate::codec::fields;
use crate::keys;

use super::ExecutionRepository;

/// Filtering applied while resolving a query's seed ids.
#[derive(Debug, Clone)]
pub struct ExecutionCriteria {
    /// Keep only executions whose status is in this set. Empty keeps all.
    pub statuses: HashSet<ExecutionStatus>,
    /// Maximum number of ids selected per backend, applied after filtering.
    pub limit: usize,
}

impl Default for ExecutionCriteria {
    fn default() -> Self {
        Self {
            statuses: HashSet::new(),
            limit: usize::MAX,
        }
    }
}

impl ExecutionCriteria {
    /// Caps the number of ids selected per backend.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Keeps only executions in the given statuses.
    #[must_use]
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = ExecutionStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }
}

/// Which index seeds a query, with its expected shape.
#[derive(Debug, Clone)]
enum SeedIndex {
    /// An unordered set of ids.
    Set(String),
    /// A sorted set, read newest first.
    Sorted(String),
}

impl SeedIndex {
    fn key(&self) -> &str {
        match self {
            Self::Set(key) | Self::Sorted(key) => key,
        }
    }
}

impl ExecutionRepository {
    /// Streams every execution of a type, across both backends.
    #[must_use]
    pub fn retrieve_all(
        &self,
        execution_type: ExecutionType,
    ) -> ReceiverStream<Result<Execution>> {
        self.stream_query(
            execution_type,
            SeedIndex::Set(keys::all_jobs_key(execution_type)),
            ExecutionCriteria::default(),
            Arc::clone(&self.query_all_pool),
        )
    }

    /// Streams every pipeline execution of an application.
    #[must_use]
    pub fn retrieve_pipelines_for_application(
        &self,
        application: &str,
    ) -> ReceiverStream<Result<Execution>> {
        self.stream_query(
            ExecutionType::Pipeline,
            SeedIndex::Set(keys::app_key(ExecutionType::Pipeline, application)),
            ExecutionCriteria::default(),
            Arc::clone(&self.query_by_app_pool),
        )
    }

    /// Streams the orchestrations of an application matching `criteria`.
    #[must_use]
    pub fn retrieve_orchestrations_for_application(
        &self,
        application: &str,
        criteria: ExecutionCriteria,
    ) -> ReceiverStream<Result<Execution>> {
        self.stream_query(
            ExecutionType::Orchestration,
            SeedIndex::Set(keys::app_key(ExecutionType::Orchestration, application)),
            criteria,
            Arc::clone(&self.query_by_app_pool),
        )
    }

    /// Streams the executions of one pipeline configuration matching
    /// `criteria`, newest first within each chunk.
    #[must_use]
    pub fn retrieve_pipelines_for_pipeline_config_id(
        &self,
        pipeline_config_id: &str,
        criteria: ExecutionCriteria,
    ) -> ReceiverStream<Result<Execution>> {
        self.stream_query(
            ExecutionType::Pipeline,
            SeedIndex::Sorted(keys::executions_for_config_key(Some(pipeline_config_id))),
            criteria,
            Arc::clone(&self.query_by_app_pool),
        )
    }

    fn stream_query(
        &self,
        execution_type: ExecutionType,
        index: SeedIndex,
        criteria: ExecutionCriteria,
        pool: Arc<Semaphore>,
    ) -> ReceiverStream<Result<Execution>> {
        let (tx, rx) = mpsc::channel(self.config.chunk_size.max(1));
        let repository = self.clone();
        tokio::spawn(async move {
            repository
                .drive_query(execution_type, index, criteria, pool, tx)
                .await;
        });
        ReceiverStream::new(rx)
    }

    async fn drive_query(
        &self,
        execution_type: ExecutionType,
        index: SeedIndex,
        criteria: ExecutionCriteria,
        pool: Arc<Semaphore>,
        tx: mpsc::Sender<Result<Execution>>,
    ) {
        let mut chosen: HashSet<String> = HashSet::new();
        for backend in self.router.all() {
            let ids = match self
                .resolve_seed(&backend, execution_type, &index, &criteria, &chosen)
                .await
            {
                Ok(ids) => ids,
                Err(err) => {
                    if tx.send(Err(err)).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            chosen.extend(ids.iter().cloned());

            for chunk in ids.chunks(self.config.chunk_size.max(1)) {
                if tx.is_closed() {
                    return;
                }
                let repository = self.clone();
                let backend = Arc::clone(&backend);
                let index_key = index.key().to_string();
                let chunk = chunk.to_vec();
                let pool = Arc::clone(&pool);
                let tx = tx.clone();
                tokio::spawn(async move {
                    repository
                        .process_chunk(backend, execution_type, index_key, chunk, pool, tx)
                        .await;
                });
            }
        }
    }

    /// Resolves the ids one backend contributes: seed from the index,
    /// filter by status (all status fields read in one pipelined batch),
    /// drop ids a preceding backend already chose, then apply the limit.
    async fn resolve_seed(
        &self,
        backend: &Arc<dyn Backend>,
        execution_type: ExecutionType,
        index: &SeedIndex,
        criteria: &ExecutionCriteria,
        exclude: &HashSet<String>,
    ) -> Result<Vec<String>> {
        if criteria.limit == 0 {
            return Ok(Vec::new());
        }

        let plain = criteria.statuses.is_empty() && exclude.is_empty();
        let mut ids = match index {
            SeedIndex::Sorted(key) => {
                // With no filtering, the index itself can apply the limit.
                let stop = if plain {
                    isize::try_from(criteria.limit)
                        .map(|limit| limit - 1)
                        .unwrap_or(-1)
                } else {
                    -1
                };
                backend.zrevrange(key, 0, stop).await?
            }
            SeedIndex::Set(key) => backend.smembers(key).await?,
        };

        ids.retain(|id| !exclude.contains(id));

        if !criteria.statuses.is_empty() {
            let hash_keys: Vec<String> = ids
                .iter()
                .map(|id| keys::execution_key(execution_type, id))
                .collect();
            let statuses = backend.hget_many(&hash_keys, fields::STATUS).await?;
            ids = ids
                .into_iter()
                .zip(statuses)
                .filter(|(_, status)| {
                    status
                        .as_deref()
                        .and_then(|raw| raw.parse::<ExecutionStatus>().ok())
                        .is_some_and(|status| criteria.statuses.contains(&status))
                })
                .map(|(id, _)| id)
                .collect();
        }

        if ids.len() > criteria.limit {
            ids.truncate(criteria.limit);
        }
        Ok(ids)
    }

    async fn process_chunk(
        &self,
        backend: Arc<dyn Backend>,
        execution_type: ExecutionType,
        index_key: String,
        ids: Vec<String>,
        pool: Arc<Semaphore>,
        tx: mpsc::Sender<Result<Execution>>,
    ) {
        let Ok(_permit) = pool.acquire_owned().await else {
            return;
        };
        let started = Instant::now();

        for id in ids {
            if tx.is_closed() {
                return;
            }
            match self.retrieve_on(&backend, execution_type, &id).await {
                Ok(execution) => {
                    self.metrics.record_streamed(backend.name());
                    if tx.send(Ok(execution)).await.is_err() {
                        return;
                    }
                }
                Err(err) if err.is_not_found() => {
                    debug!(
                        backend = backend.name(),
                        index_key, id, "seed id has no record, healing index"
                    );
                    self.self_heal(&backend, &index_key, &id).await;
                }
                Err(err @ Error::Serialization { .. }) => {
                    warn!(error = %err, id, "skipping undecodable execution");
                }
                Err(err) => {
                    if tx.send(Err(err)).await.is_err() {
                        return;
                    }
                }
            }
        }

        self.metrics.observe_chunk_duration(started.elapsed());
    }

    /// Removes a stale id from a seed index, dispatching on the index key's
    /// runtime type. Failures are logged and swallowed; the next query will
    /// try again.
    async fn self_heal(&self, backend: &Arc<dyn Backend>, index_key: &str, id: &str) {
        let op = match backend.key_kind(index_key).await {
            Ok(KeyKind::Set) => WriteOp::SRem {
                key: index_key.to_string(),
                member: id.to_string(),
            },
            Ok(KeyKind::SortedSet) => WriteOp::ZRem {
                key: index_key.to_string(),
                member: id.to_string(),
            },
            Ok(_) => return,
            Err(err) => {
                warn!(error = %err, index_key, "could not type seed index for healing");
                return;
            }
        };
        match backend.transaction(vec![op]).await {
            Ok(()) => self.metrics.record_self_healed(backend.name()),
            Err(err) => warn!(error = %err, index_key, id, "failed to heal seed index"),
        }
    }
}
