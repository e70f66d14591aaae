//! Streaming-query and dual-backend behavior.

use std::sync::Arc;

use tokio_stream::StreamExt;

use tiller_core::prelude::*;
use tiller_repository::{
    Backend, ExecutionCriteria, ExecutionRepository, MemoryBackend, WriteOp,
};

fn dual_repository() -> (ExecutionRepository, Arc<MemoryBackend>, Arc<MemoryBackend>) {
    let primary = Arc::new(MemoryBackend::new());
    let previous = Arc::new(MemoryBackend::new());
    let repository = ExecutionRepository::with_previous(
        Arc::clone(&primary) as Arc<dyn Backend>,
        Arc::clone(&previous) as Arc<dyn Backend>,
    );
    (repository, primary, previous)
}

fn orchestration(id: &str, status: ExecutionStatus) -> Execution {
    ExecutionBuilder::orchestration("demo")
        .with_id(id)
        .with_status(status)
        .build()
}

async fn collect_ids(
    mut stream: tokio_stream::wrappers::ReceiverStream<Result<Execution>>,
) -> Vec<String> {
    let mut ids = Vec::new();
    while let Some(item) = stream.next().await {
        ids.push(item.unwrap().id.as_str().to_string());
    }
    ids
}

#[tokio::test]
async fn lookups_prefer_the_primary_record() {
    let (repository, primary, previous) = dual_repository();

    // The same id on both backends, with diverging content.
    ExecutionRepository::new(Arc::clone(&previous) as Arc<dyn Backend>)
        .store(
            &ExecutionBuilder::orchestration("demo")
                .with_id("o1")
                .with_description("stale copy")
                .build(),
        )
        .await
        .unwrap();
    ExecutionRepository::new(Arc::clone(&primary) as Arc<dyn Backend>)
        .store(
            &ExecutionBuilder::orchestration("demo")
                .with_id("o1")
                .with_description("current copy")
                .build(),
        )
        .await
        .unwrap();

    let loaded = repository
        .retrieve(ExecutionType::Orchestration, "o1")
        .await
        .unwrap();
    assert_eq!(loaded.description.as_deref(), Some("current copy"));
}

#[tokio::test]
async fn point_reads_fall_back_to_the_previous_backend() {
    let (repository, _primary, previous) = dual_repository();
    ExecutionRepository::new(Arc::clone(&previous) as Arc<dyn Backend>)
        .store(&orchestration("old", ExecutionStatus::Running))
        .await
        .unwrap();

    let loaded = repository
        .retrieve(ExecutionType::Orchestration, "old")
        .await
        .unwrap();
    assert_eq!(loaded.id.as_str(), "old");
}

#[tokio::test]
async fn streams_merge_both_backends_without_duplicates() {
    let (repository, primary, previous) = dual_repository();
    let primary_repo = ExecutionRepository::new(Arc::clone(&primary) as Arc<dyn Backend>);
    let previous_repo = ExecutionRepository::new(Arc::clone(&previous) as Arc<dyn Backend>);

    // "both" lives on both backends; "only-old" only on the previous one.
    primary_repo
        .store(&orchestration("both", ExecutionStatus::Running))
        .await
        .unwrap();
    previous_repo
        .store(&orchestration("both", ExecutionStatus::Running))
        .await
        .unwrap();
    previous_repo
        .store(&orchestration("only-old", ExecutionStatus::Running))
        .await
        .unwrap();

    let mut ids = collect_ids(repository.retrieve_all(ExecutionType::Orchestration)).await;
    ids.sort();
    assert_eq!(ids, ["both", "only-old"]);
}

#[tokio::test]
async fn status_filter_applies_before_the_limit() {
    let (repository, _primary, _previous) = dual_repository();
    repository
        .store(&orchestration("running-1", ExecutionStatus::Running))
        .await
        .unwrap();
    repository
        .store(&orchestration("succeeded-1", ExecutionStatus::Succeeded))
        .await
        .unwrap();
    repository
        .store(&orchestration("running-2", ExecutionStatus::Running))
        .await
        .unwrap();

    let criteria = ExecutionCriteria::default()
        .with_statuses([ExecutionStatus::Running])
        .with_limit(2);
    let ids = collect_ids(
        repository.retrieve_orchestrations_for_application("demo", criteria),
    )
    .await;

    assert_eq!(ids.len(), 2);
    assert!(ids.iter().all(|id| id.starts_with("running")));
}

#[tokio::test]
async fn pipeline_config_query_streams_newest_first() {
    let (repository, _primary, _previous) = dual_repository();
    for (id, build_time) in [("p-old", 1_000), ("p-new", 3_000), ("p-mid", 2_000)] {
        repository
            .store(
                &ExecutionBuilder::pipeline("demo")
                    .with_id(id)
                    .with_pipeline_config_id("cfg")
                    .with_build_time(build_time)
                    .build(),
            )
            .await
            .unwrap();
    }

    let ids = collect_ids(
        repository.retrieve_pipelines_for_pipeline_config_id("cfg", ExecutionCriteria::default()),
    )
    .await;
    assert_eq!(ids, ["p-new", "p-mid", "p-old"]);

    let ids = collect_ids(repository.retrieve_pipelines_for_pipeline_config_id(
        "cfg",
        ExecutionCriteria::default().with_limit(2),
    ))
    .await;
    assert_eq!(ids, ["p-new", "p-mid"]);
}

#[tokio::test]
async fn pipelines_for_application_streams_the_app_index() {
    let (repository, _primary, _previous) = dual_repository();
    repository
        .store(
            &ExecutionBuilder::pipeline("demo")
                .with_id("p1")
                .with_pipeline_config_id("cfg")
                .build(),
        )
        .await
        .unwrap();
    repository
        .store(
            &ExecutionBuilder::pipeline("other-app")
                .with_id("p2")
                .with_pipeline_config_id("cfg")
                .build(),
        )
        .await
        .unwrap();

    let ids = collect_ids(repository.retrieve_pipelines_for_application("demo")).await;
    assert_eq!(ids, ["p1"]);
}

#[tokio::test]
async fn ghost_ids_heal_out_of_the_all_jobs_set() {
    let (repository, primary, _previous) = dual_repository();
    repository
        .store(&orchestration("real", ExecutionStatus::Running))
        .await
        .unwrap();
    primary
        .transaction(vec![WriteOp::SAdd {
            key: "allJobs:orchestration".into(),
            member: "ghost".into(),
        }])
        .await
        .unwrap();

    let ids = collect_ids(repository.retrieve_all(ExecutionType::Orchestration)).await;
    assert_eq!(ids, ["real"]);
    assert_eq!(
        primary.smembers("allJobs:orchestration").await.unwrap(),
        ["real"]
    );
}

#[tokio::test]
async fn ghost_ids_heal_out_of_the_config_sorted_set() {
    let (repository, primary, _previous) = dual_repository();
    repository
        .store(
            &ExecutionBuilder::pipeline("demo")
                .with_id("real")
                .with_pipeline_config_id("cfg")
                .with_build_time(2_000)
                .build(),
        )
        .await
        .unwrap();
    primary
        .transaction(vec![WriteOp::ZAdd {
            key: "pipeline:executions:cfg".into(),
            score: 1_000.0,
            member: "ghost".into(),
        }])
        .await
        .unwrap();

    let ids = collect_ids(
        repository.retrieve_pipelines_for_pipeline_config_id("cfg", ExecutionCriteria::default()),
    )
    .await;
    assert_eq!(ids, ["real"]);
    assert_eq!(
        primary
            .zrevrange("pipeline:executions:cfg", 0, -1)
            .await
            .unwrap(),
        ["real"]
    );
}

#[tokio::test]
async fn undecodable_records_are_skipped_but_keep_their_seed_entry() {
    let (repository, primary, _previous) = dual_repository();
    repository
        .store(&orchestration("good", ExecutionStatus::Running))
        .await
        .unwrap();
    primary
        .transaction(vec![
            WriteOp::HSet {
                key: "orchestration:bad".into(),
                fields: vec![
                    ("application".into(), "demo".into()),
                    ("status".into(), "RUNNING".into()),
                    ("buildTime".into(), "not-a-number".into()),
                ],
            },
            WriteOp::SAdd {
                key: "allJobs:orchestration".into(),
                member: "bad".into(),
            },
        ])
        .await
        .unwrap();

    let ids = collect_ids(repository.retrieve_all(ExecutionType::Orchestration)).await;
    assert_eq!(ids, ["good"]);

    // The id stays in the index; only missing records are healed away.
    let mut members = primary.smembers("allJobs:orchestration").await.unwrap();
    members.sort();
    assert_eq!(members, ["bad", "good"]);
}

#[tokio::test]
async fn dropping_the_receiver_cancels_the_fan_out() {
    let (repository, _primary, _previous) = dual_repository();
    for i in 0..20 {
        repository
            .store(&orchestration(&format!("o{i}"), ExecutionStatus::Running))
            .await
            .unwrap();
    }

    let mut stream = repository.retrieve_all(ExecutionType::Orchestration);
    let first = stream.next().await;
    assert!(first.is_some());
    drop(stream);

    // Workers notice the closed channel and stop; nothing hangs or panics.
    tokio::task::yield_now().await;
}
