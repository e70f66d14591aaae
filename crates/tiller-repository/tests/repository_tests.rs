//! Integration tests for the execution repository over the memory backend.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio_stream::StreamExt;

use tiller_core::prelude::*;
use tiller_repository::{Backend, ExecutionRepository, MemoryBackend, WriteOp};

fn memory_repository() -> (ExecutionRepository, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let repository = ExecutionRepository::new(Arc::clone(&backend) as Arc<dyn Backend>);
    (repository, backend)
}

fn pipeline_with_stages(id: &str, config_id: &str, stage_ids: &[&str]) -> Execution {
    let mut builder = ExecutionBuilder::pipeline("demo")
        .with_id(id)
        .with_name("deploy")
        .with_pipeline_config_id(config_id)
        .with_build_time(1_000);
    for stage_id in stage_ids {
        builder = builder.with_stage(Stage::new("wait").with_id(*stage_id));
    }
    builder.build()
}

async fn stage_order(backend: &MemoryBackend, id: &str) -> (Vec<String>, String) {
    let list = backend
        .lrange(&format!("pipeline:{id}:stageIndex"), 0, -1)
        .await
        .unwrap();
    let field = backend
        .hget(&format!("pipeline:{id}"), "stageIndex")
        .await
        .unwrap()
        .unwrap_or_default();
    (list, field)
}

#[tokio::test]
async fn store_and_retrieve_round_trips_a_pipeline() {
    let (repository, backend) = memory_repository();
    let execution = pipeline_with_stages("p1", "cfg", &["s1"]);

    repository.store(&execution).await.unwrap();
    let loaded = repository
        .retrieve(ExecutionType::Pipeline, "p1")
        .await
        .unwrap();

    assert_eq!(loaded, execution);
    assert_eq!(loaded.stages[0].id, "s1");

    // The pipeline lands in the per-config sorted set, scored by build time.
    assert_eq!(
        backend
            .zrevrange("pipeline:executions:cfg", 0, -1)
            .await
            .unwrap(),
        ["p1"]
    );
    assert_eq!(
        backend.zscore("pipeline:executions:cfg", "p1").unwrap(),
        Some(1_000.0)
    );
}

#[tokio::test]
async fn store_maintains_secondary_indices() {
    let (repository, backend) = memory_repository();
    repository
        .store(&pipeline_with_stages("p1", "cfg", &[]))
        .await
        .unwrap();

    assert_eq!(backend.smembers("allJobs:pipeline").await.unwrap(), ["p1"]);
    assert_eq!(backend.smembers("pipeline:app:demo").await.unwrap(), ["p1"]);
}

#[tokio::test]
async fn retrieve_unknown_id_is_not_found() {
    let (repository, _backend) = memory_repository();
    let err = repository
        .retrieve(ExecutionType::Orchestration, "missing")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn stage_index_field_agrees_with_ordered_list_after_every_write() {
    let (repository, backend) = memory_repository();
    let execution = pipeline_with_stages("p1", "cfg", &["A", "B", "C"]);
    repository.store(&execution).await.unwrap();

    let (list, field) = stage_order(&backend, "p1").await;
    assert_eq!(field, list.join(","));

    let synthetic = Stage::new("check")
        .with_id("X")
        .with_synthetic_owner(SyntheticStageOwner::StageBefore, "B")
        .with_execution("p1", ExecutionType::Pipeline);
    repository.add_stage(&synthetic).await.unwrap();
    let (list, field) = stage_order(&backend, "p1").await;
    assert_eq!(field, list.join(","));

    repository.remove_stage(&execution, "A").await.unwrap();
    let (list, field) = stage_order(&backend, "p1").await;
    assert_eq!(field, list.join(","));
}

#[tokio::test]
async fn add_stage_splices_before_and_after_its_parent() {
    let (repository, backend) = memory_repository();
    repository
        .store(&pipeline_with_stages("p1", "cfg", &["A", "B", "C"]))
        .await
        .unwrap();

    let before = Stage::new("check")
        .with_id("X")
        .with_synthetic_owner(SyntheticStageOwner::StageBefore, "B")
        .with_execution("p1", ExecutionType::Pipeline);
    repository.add_stage(&before).await.unwrap();

    let (list, field) = stage_order(&backend, "p1").await;
    assert_eq!(list, ["A", "X", "B", "C"]);
    assert_eq!(field, "A,X,B,C");

    let after = Stage::new("verify")
        .with_id("Y")
        .with_synthetic_owner(SyntheticStageOwner::StageAfter, "B")
        .with_execution("p1", ExecutionType::Pipeline);
    repository.add_stage(&after).await.unwrap();

    let (list, _) = stage_order(&backend, "p1").await;
    assert_eq!(list, ["A", "X", "B", "Y", "C"]);

    let loaded = repository
        .retrieve(ExecutionType::Pipeline, "p1")
        .await
        .unwrap();
    let loaded_ids: Vec<&str> = loaded.stages.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(loaded_ids, ["A", "X", "B", "Y", "C"]);
}

#[tokio::test]
async fn add_stage_rejects_non_synthetic_stages() {
    let (repository, _backend) = memory_repository();
    repository
        .store(&pipeline_with_stages("p1", "cfg", &["A"]))
        .await
        .unwrap();

    let plain = Stage::new("wait")
        .with_id("X")
        .with_execution("p1", ExecutionType::Pipeline);
    let err = repository.add_stage(&plain).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
}

#[tokio::test]
async fn store_stage_overwrites_fields_and_deletes_absent_ones() {
    let (repository, backend) = memory_repository();
    let mut builder = ExecutionBuilder::pipeline("demo")
        .with_id("p1")
        .with_pipeline_config_id("cfg");
    builder = builder.with_stage(
        Stage::new("wait")
            .with_id("s1")
            .with_name("first wait")
            .with_context_entry("waitTime", json!(30)),
    );
    repository.store(&builder.build()).await.unwrap();

    let loaded = repository
        .retrieve(ExecutionType::Pipeline, "p1")
        .await
        .unwrap();
    let mut stage = loaded.stages[0].clone();
    stage.status = ExecutionStatus::Running;
    stage.name = None;
    repository.store_stage(&stage).await.unwrap();

    let hash = backend.hgetall("pipeline:p1").await.unwrap();
    assert_eq!(hash["stage.s1.status"], "RUNNING");
    assert!(!hash.contains_key("stage.s1.name"));
}

#[tokio::test]
async fn update_stage_context_touches_only_the_context_field() {
    let (repository, backend) = memory_repository();
    repository
        .store(&pipeline_with_stages("p1", "cfg", &["s1"]))
        .await
        .unwrap();

    let loaded = repository
        .retrieve(ExecutionType::Pipeline, "p1")
        .await
        .unwrap();
    let mut stage = loaded.stages[0].clone();
    stage.context.insert("region".into(), json!("us-west-2"));
    stage.status = ExecutionStatus::Running; // must NOT be written
    repository.update_stage_context(&stage).await.unwrap();

    let hash = backend.hgetall("pipeline:p1").await.unwrap();
    assert!(hash["stage.s1.context"].contains("us-west-2"));
    assert_eq!(hash["stage.s1.status"], "NOT_STARTED");
}

#[tokio::test]
async fn remove_stage_deletes_every_namespaced_field() {
    let (repository, backend) = memory_repository();
    let execution = pipeline_with_stages("p1", "cfg", &["A", "B"]);
    repository.store(&execution).await.unwrap();

    repository.remove_stage(&execution, "A").await.unwrap();

    let hash = backend.hgetall("pipeline:p1").await.unwrap();
    assert!(hash.keys().all(|field| !field.starts_with("stage.A.")));
    assert!(hash.contains_key("stage.B.status"));
    let (list, field) = stage_order(&backend, "p1").await;
    assert_eq!(list, ["B"]);
    assert_eq!(field, "B");
}

#[tokio::test]
async fn remove_stage_rematerializes_the_list_for_legacy_records() {
    let (repository, backend) = memory_repository();

    // A legacy record: stage order only in the denormalized field.
    backend
        .transaction(vec![
            WriteOp::HSet {
                key: "pipeline:legacy".into(),
                fields: vec![
                    ("application".into(), "demo".into()),
                    ("status".into(), "RUNNING".into()),
                    ("buildTime".into(), "1".into()),
                    ("stageIndex".into(), "A,B,C".into()),
                    ("stage.A.type".into(), "wait".into()),
                    ("stage.B.type".into(), "wait".into()),
                    ("stage.C.type".into(), "wait".into()),
                ],
            },
            WriteOp::SAdd {
                key: "allJobs:pipeline".into(),
                member: "legacy".into(),
            },
        ])
        .await
        .unwrap();

    let execution = repository
        .retrieve(ExecutionType::Pipeline, "legacy")
        .await
        .unwrap();
    assert_eq!(execution.stages.len(), 3);

    repository.remove_stage(&execution, "B").await.unwrap();

    let (list, field) = stage_order(&backend, "legacy").await;
    assert_eq!(list, ["A", "C"]);
    assert_eq!(field, "A,C");
}

#[tokio::test]
async fn reader_prefers_the_ordered_list_over_a_stale_denormalized_field() {
    let (repository, backend) = memory_repository();
    repository
        .store(&pipeline_with_stages("p1", "cfg", &["s1", "s2"]))
        .await
        .unwrap();

    // Simulate the window after an add-stage transaction where the
    // denormalized field has not caught up with the list yet.
    backend
        .transaction(vec![WriteOp::HSet {
            key: "pipeline:p1".into(),
            fields: vec![("stageIndex".into(), "s2".into())],
        }])
        .await
        .unwrap();

    let loaded = repository
        .retrieve(ExecutionType::Pipeline, "p1")
        .await
        .unwrap();
    let ids: Vec<&str> = loaded.stages.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["s1", "s2"]);
}

#[tokio::test]
async fn pause_requires_a_running_execution() {
    let (repository, backend) = memory_repository();
    let execution = ExecutionBuilder::orchestration("demo").with_id("o1").build();
    repository.store(&execution).await.unwrap();

    let err = repository
        .pause(ExecutionType::Orchestration, "o1", "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(
        backend.hget("orchestration:o1", "status").await.unwrap(),
        Some("NOT_STARTED".into())
    );
}

#[tokio::test]
async fn pause_and_resume_cycle() {
    let (repository, _backend) = memory_repository();
    let execution = ExecutionBuilder::orchestration("demo")
        .with_id("o1")
        .with_status(ExecutionStatus::Running)
        .build();
    repository.store(&execution).await.unwrap();

    repository
        .pause(ExecutionType::Orchestration, "o1", "alice")
        .await
        .unwrap();
    let paused = repository
        .retrieve(ExecutionType::Orchestration, "o1")
        .await
        .unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    let details = paused.paused.unwrap();
    assert_eq!(details.paused_by.as_deref(), Some("alice"));
    assert!(details.is_paused());

    repository
        .resume(ExecutionType::Orchestration, "o1", "bob", false)
        .await
        .unwrap();
    let resumed = repository
        .retrieve(ExecutionType::Orchestration, "o1")
        .await
        .unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Running);
    let details = resumed.paused.unwrap();
    assert_eq!(details.resumed_by.as_deref(), Some("bob"));
    assert!(!details.is_paused());

    // A second resume finds RUNNING and fails without the override.
    let err = repository
        .resume(ExecutionType::Orchestration, "o1", "bob", false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    repository
        .resume(ExecutionType::Orchestration, "o1", "bob", true)
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_moves_a_not_started_execution_to_canceled() {
    let (repository, _backend) = memory_repository();
    let execution = ExecutionBuilder::orchestration("demo").with_id("o1").build();
    repository.store(&execution).await.unwrap();

    repository
        .cancel(ExecutionType::Orchestration, "o1")
        .await
        .unwrap();

    let loaded = repository
        .retrieve(ExecutionType::Orchestration, "o1")
        .await
        .unwrap();
    assert!(loaded.canceled);
    assert_eq!(loaded.status, ExecutionStatus::Canceled);
}

#[tokio::test]
async fn cancel_only_flags_a_running_execution() {
    let (repository, _backend) = memory_repository();
    let execution = ExecutionBuilder::orchestration("demo")
        .with_id("o1")
        .with_status(ExecutionStatus::Running)
        .build();
    repository.store(&execution).await.unwrap();

    repository
        .cancel_with(
            ExecutionType::Orchestration,
            "o1",
            Some("alice"),
            Some("rollback requested"),
        )
        .await
        .unwrap();

    let loaded = repository
        .retrieve(ExecutionType::Orchestration, "o1")
        .await
        .unwrap();
    assert!(loaded.canceled);
    assert_eq!(loaded.status, ExecutionStatus::Running);
    assert_eq!(loaded.canceled_by.as_deref(), Some("alice"));
    assert_eq!(
        loaded.cancellation_reason.as_deref(),
        Some("rollback requested")
    );
    assert!(repository
        .is_canceled(ExecutionType::Orchestration, "o1")
        .await
        .unwrap());
}

#[tokio::test]
async fn cancel_persists_a_reason_even_when_it_is_empty() {
    let (repository, backend) = memory_repository();
    let execution = ExecutionBuilder::orchestration("demo")
        .with_id("o1")
        .with_status(ExecutionStatus::Running)
        .build();
    repository.store(&execution).await.unwrap();

    repository
        .cancel_with(ExecutionType::Orchestration, "o1", Some("alice"), Some(""))
        .await
        .unwrap();

    assert_eq!(
        backend
            .hget("orchestration:o1", "cancellationReason")
            .await
            .unwrap(),
        Some(String::new())
    );
}

#[tokio::test]
async fn only_a_running_status_update_clears_the_cancel_flag() {
    let (repository, _backend) = memory_repository();
    let execution = ExecutionBuilder::orchestration("demo")
        .with_id("o1")
        .with_status(ExecutionStatus::Running)
        .build();
    repository.store(&execution).await.unwrap();
    repository
        .cancel(ExecutionType::Orchestration, "o1")
        .await
        .unwrap();

    repository
        .update_status(ExecutionType::Orchestration, "o1", ExecutionStatus::Terminal)
        .await
        .unwrap();
    let loaded = repository
        .retrieve(ExecutionType::Orchestration, "o1")
        .await
        .unwrap();
    assert!(loaded.canceled);
    assert!(loaded.end_time.is_some());

    repository
        .update_status(ExecutionType::Orchestration, "o1", ExecutionStatus::Running)
        .await
        .unwrap();
    let loaded = repository
        .retrieve(ExecutionType::Orchestration, "o1")
        .await
        .unwrap();
    assert!(!loaded.canceled);
    assert!(loaded.start_time.is_some());
}

#[tokio::test]
async fn delete_removes_the_record_and_every_index_membership() {
    let (repository, backend) = memory_repository();
    repository
        .store(&pipeline_with_stages("p1", "cfg", &["s1"]))
        .await
        .unwrap();

    repository
        .delete(ExecutionType::Pipeline, "p1")
        .await
        .unwrap();

    assert!(repository
        .retrieve(ExecutionType::Pipeline, "p1")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(backend.smembers("allJobs:pipeline").await.unwrap().is_empty());
    assert!(backend.smembers("pipeline:app:demo").await.unwrap().is_empty());
    assert!(backend
        .zrevrange("pipeline:executions:cfg", 0, -1)
        .await
        .unwrap()
        .is_empty());
    assert!(!backend.exists("pipeline:p1:stageIndex").await.unwrap());
}

#[tokio::test]
async fn delete_completes_even_when_the_record_is_partial() {
    let (repository, backend) = memory_repository();

    // No application field, no config field: the lookups find nothing but
    // the hash and the allJobs membership still go away.
    backend
        .transaction(vec![
            WriteOp::HSet {
                key: "pipeline:partial".into(),
                fields: vec![("status".into(), "RUNNING".into())],
            },
            WriteOp::SAdd {
                key: "allJobs:pipeline".into(),
                member: "partial".into(),
            },
        ])
        .await
        .unwrap();

    repository
        .delete(ExecutionType::Pipeline, "partial")
        .await
        .unwrap();

    assert!(!backend.exists("pipeline:partial").await.unwrap());
    assert!(backend.smembers("allJobs:pipeline").await.unwrap().is_empty());
}

#[tokio::test]
async fn execution_context_merges_and_is_idempotent() {
    let (repository, backend) = memory_repository();
    let execution = ExecutionBuilder::orchestration("demo").with_id("o1").build();
    repository.store(&execution).await.unwrap();

    // An empty patch is a no-op.
    repository
        .store_execution_context("o1", &Map::new())
        .await
        .unwrap();
    assert_eq!(
        backend.hget("orchestration:o1", "context").await.unwrap(),
        None
    );

    let mut patch = Map::new();
    patch.insert("deployedArtifacts".into(), json!(["artifact-1"]));
    repository
        .store_execution_context("o1", &patch)
        .await
        .unwrap();
    repository
        .store_execution_context("o1", &patch)
        .await
        .unwrap();

    let stored: Value = serde_json::from_str(
        &backend
            .hget("orchestration:o1", "context")
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(stored, json!({"deployedArtifacts": ["artifact-1"]}));

    // A second patch merges alongside the first.
    let mut second = Map::new();
    second.insert("region".into(), json!("us-west-2"));
    repository
        .store_execution_context("o1", &second)
        .await
        .unwrap();
    let stored: Value = serde_json::from_str(
        &backend
            .hget("orchestration:o1", "context")
            .await
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(
        stored,
        json!({"deployedArtifacts": ["artifact-1"], "region": "us-west-2"})
    );
}

#[tokio::test]
async fn execution_context_accepts_an_already_qualified_key() {
    let (repository, backend) = memory_repository();
    let execution = ExecutionBuilder::orchestration("demo").with_id("o1").build();
    repository.store(&execution).await.unwrap();

    let mut patch = Map::new();
    patch.insert("key".into(), json!("value"));
    repository
        .store_execution_context("orchestration:o1", &patch)
        .await
        .unwrap();

    assert!(backend
        .hget("orchestration:o1", "context")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn execution_context_for_an_unknown_id_is_not_found() {
    let (repository, _backend) = memory_repository();
    let mut patch = Map::new();
    patch.insert("key".into(), json!("value"));
    let err = repository
        .store_execution_context("missing", &patch)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn correlation_pointer_resolves_and_garbage_collects() {
    let (repository, backend) = memory_repository();
    let execution = ExecutionBuilder::orchestration("demo")
        .with_id("o1")
        .with_status(ExecutionStatus::Running)
        .with_trigger_entry("correlationId", json!("corr-1"))
        .build();
    repository.store(&execution).await.unwrap();

    let resolved = repository
        .retrieve_orchestration_for_correlation_id("corr-1")
        .await
        .unwrap();
    assert_eq!(resolved.id.as_str(), "o1");

    repository
        .update_status(ExecutionType::Orchestration, "o1", ExecutionStatus::Succeeded)
        .await
        .unwrap();

    let err = repository
        .retrieve_orchestration_for_correlation_id("corr-1")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(backend.get("correlation:corr-1").await.unwrap(), None);
}

#[tokio::test]
async fn unknown_correlation_key_is_not_found() {
    let (repository, _backend) = memory_repository();
    let err = repository
        .retrieve_orchestration_for_correlation_id("nope")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn has_execution_probes_by_type() {
    let (repository, _backend) = memory_repository();
    repository
        .store(&pipeline_with_stages("p1", "cfg", &[]))
        .await
        .unwrap();

    assert!(repository
        .has_execution(ExecutionType::Pipeline, "p1")
        .await
        .unwrap());
    assert!(!repository
        .has_execution(ExecutionType::Orchestration, "p1")
        .await
        .unwrap());
}

#[tokio::test]
async fn streamed_retrieve_all_yields_every_execution() {
    let (repository, _backend) = memory_repository();
    for id in ["o1", "o2", "o3"] {
        repository
            .store(&ExecutionBuilder::orchestration("demo").with_id(id).build())
            .await
            .unwrap();
    }

    let mut stream = repository.retrieve_all(ExecutionType::Orchestration);
    let mut ids = Vec::new();
    while let Some(item) = stream.next().await {
        ids.push(item.unwrap().id.as_str().to_string());
    }
    ids.sort();
    assert_eq!(ids, ["o1", "o2", "o3"]);
}
