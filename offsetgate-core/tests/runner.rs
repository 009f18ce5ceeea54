mod common;

use std::time::Duration;

use futures::stream;

use offsetgate_core::Error;
use offsetgate_core::config::{Settings, StreamIdGenerator};
use offsetgate_core::planner::PlannerOptions;
use offsetgate_core::recovery::RecoveryOutcome;
use offsetgate_core::retry::Backoff;
use offsetgate_core::tracker::TrackerOptions;
use offsetgate_core::types::{PartitionId, PartitionOffset};
use offsetgate_testing::simengine::SimulatedEngine;
use offsetgate_testing::simsource::SimulatedSource;

use common::{Harness, STREAM, planner_options, seq_of};

#[tokio::test]
async fn test_static_cap_cycles() {
    let harness = Harness::new(2);
    harness.source.append_all(1000);
    let mut runner = harness.runner(100).await;

    runner.run(stream::iter(0..5)).await.unwrap();

    let committed = runner.planner().tracker().current();
    assert_eq!(committed.batch_id, 4);
    // each batch reads cap messages
    assert_eq!(seq_of(&runner, 0), 500);
    assert_eq!(seq_of(&runner, 1), 500);
    assert_eq!(harness.engine.executed().len(), 5);
    assert_eq!(harness.store.error_injector().writes(), 5);
}

#[tokio::test]
async fn test_dynamic_rate_splits_by_lag() {
    let harness = Harness::new(2);
    harness.source.append(0, 100);
    harness.source.append(1, 300);
    harness.signal.publish(40.0);
    let mut runner = harness.runner(1000).await;

    runner.recover().await.unwrap();
    let report = runner.run_cycle().await.unwrap();

    assert_eq!(report.batch_id, 0);
    assert_eq!(report.planned_messages, 40);
    assert_eq!(seq_of(&runner, 0), 10);
    assert_eq!(seq_of(&runner, 1), 30);
}

#[tokio::test]
async fn test_single_message_cap_makes_progress() {
    let harness = Harness::new(2);
    harness.source.append_all(100);
    let mut runner = harness.runner(1).await;
    runner.recover().await.unwrap();

    for batch_id in 0..5 {
        let report = runner.run_cycle().await.unwrap();
        assert_eq!(report.batch_id, batch_id);
        assert_eq!(report.planned_messages, 2);
        assert_eq!(seq_of(&runner, 0), batch_id + 1);
        assert_eq!(seq_of(&runner, 1), batch_id + 1);
    }
    assert_eq!(harness.engine.consumed_messages(), 10);
}

#[tokio::test]
async fn test_dynamic_share_of_one_makes_progress() {
    let harness = Harness::new(2);
    harness.source.append_all(100);
    harness.signal.publish(2.0);
    let mut runner = harness.runner(1000).await;

    runner.run(stream::iter(0..5)).await.unwrap();

    assert_eq!(runner.planner().tracker().current().batch_id, 4);
    assert_eq!(seq_of(&runner, 0), 5);
    assert_eq!(seq_of(&runner, 1), 5);
    assert_eq!(harness.engine.consumed_messages(), 10);
}

#[tokio::test]
async fn test_caught_up_stream_commits_empty_batches() {
    let harness = Harness::new(1);
    harness.source.append_all(5);
    let mut runner = harness.runner(100).await;
    runner.recover().await.unwrap();

    runner.run_cycle().await.unwrap();
    let report = runner.run_cycle().await.unwrap();
    assert_eq!(report.batch_id, 1);
    assert_eq!(report.planned_messages, 0);
    assert_eq!(seq_of(&runner, 0), 5);
}

#[tokio::test]
async fn test_engine_failure_replans_same_batch() {
    let harness = Harness::new(1);
    harness.source.append_all(50);
    harness.engine.error_injector().crash_before_end_marker(1);
    let mut runner = harness.runner(10).await;
    runner.recover().await.unwrap();

    assert!(matches!(runner.run_cycle().await, Err(Error::Executor(_))));
    assert!(runner.planner().in_flight().is_none());
    assert!(runner.planner().tracker().current().is_initial());

    let report = runner.run_cycle().await.unwrap();
    assert_eq!(report.batch_id, 0);
}

#[tokio::test]
async fn test_upstream_outage_plans_on_stale_horizon() {
    let harness = Harness::new(1);
    harness.source.append_all(100);
    let mut runner = harness.runner(10).await;
    runner.recover().await.unwrap();
    runner.run_cycle().await.unwrap();

    harness.source.error_injector().set_unreachable(true);
    harness.source.append_all(1000);
    let report = runner.run_cycle().await.unwrap();
    assert!(report.stale_horizon);
    assert_eq!(seq_of(&runner, 0), 20);

    harness.source.error_injector().set_unreachable(false);
    let report = runner.run_cycle().await.unwrap();
    assert!(!report.stale_horizon);
    assert_eq!(report.batch_id, 2);
}

#[tokio::test]
async fn test_transient_store_failures_are_retried() {
    let harness = Harness::new(1);
    harness.source.append_all(100);
    let mut runner = harness.runner(10).await;
    runner.recover().await.unwrap();

    harness.store.error_injector().fail_writes(2);
    let report = runner.run_cycle().await.unwrap();
    assert_eq!(report.committed.batch_id, 0);
    assert_eq!(harness.store.error_injector().writes(), 1);
}

#[tokio::test]
async fn test_commit_exhaustion_stops_runner() {
    let harness = Harness::new(1);
    harness.source.append_all(100);
    harness.store.error_injector().fail_writes(100);
    let mut runner = harness.runner(10).await;

    let err = runner.run(stream::iter(0..3)).await.unwrap_err();
    match err {
        Error::CommitExhausted {
            batch_id,
            attempts,
            last,
        } => {
            assert_eq!(batch_id, 0);
            assert_eq!(attempts, 3);
            assert!(matches!(*last, Error::Store(_)));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(runner.planner().in_flight().map(|b| b.batch_id()), Some(0));
    assert!(runner.planner().tracker().current().is_initial());
}

#[tokio::test]
async fn test_slow_store_times_out() {
    let harness = Harness::new(1);
    harness.source.append_all(100);
    harness.store.error_injector().set_write_latency(200);
    let mut runner = harness
        .runner_with(
            10,
            TrackerOptions {
                commit_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            PlannerOptions {
                commit_backoff: Backoff::fixed_factor(Duration::from_millis(1), 1),
                ..planner_options()
            },
        )
        .await;
    runner.recover().await.unwrap();

    let err = runner.run_cycle().await.unwrap_err();
    match err {
        Error::CommitExhausted { last, .. } => {
            assert!(matches!(*last, Error::CommitTimeout { batch_id: 0, .. }));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_over_reporting_engine_is_fatal() {
    let harness = Harness::new(1);
    harness.source.append_all(100);
    harness.engine.error_injector().over_report_by(5);
    let mut runner = harness.runner(10).await;

    let err = runner.run(stream::iter(0..1)).await.unwrap_err();
    assert!(matches!(err, Error::OverReported { batch_id: 0, .. }));
}

#[tokio::test]
async fn test_new_partition_starts_at_sentinel() {
    let harness = Harness::new(1);
    harness.source.append_all(100);
    let mut runner = harness.runner(10).await;
    runner.recover().await.unwrap();
    runner.run_cycle().await.unwrap();

    let added = harness.source.add_partition();
    harness.source.append(added.index, 30);
    let report = runner.run_cycle().await.unwrap();

    assert_eq!(report.committed.offsets.len(), 2);
    assert_eq!(seq_of(&runner, 1), 10);
}

#[tokio::test]
async fn test_partition_shrink_stops_runner() {
    let harness = Harness::new(2);
    harness.source.append_all(100);
    let mut runner = harness.runner(10).await;
    runner.recover().await.unwrap();
    runner.run_cycle().await.unwrap();

    harness.source.remove_last_partition();
    let err = runner.run(stream::iter(0..3)).await.unwrap_err();
    match err {
        Error::PartitionDrift { batch_id, missing } => {
            assert_eq!(batch_id, 1);
            assert_eq!(missing, vec![PartitionId::new(STREAM, 1)]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_stops_idle_runner() {
    let harness = Harness::new(1);
    let mut runner = harness.runner(10).await;

    let cancel = harness.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    runner.run(stream::pending::<()>()).await.unwrap();
    assert!(runner.planner().tracker().current().is_initial());
}

#[tokio::test]
async fn test_file_backed_runner_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::load([
        ("streamName", STREAM),
        ("progressTrackingDirectory", dir.path().to_str().unwrap()),
        ("maxRatePerPartition", "10"),
        ("partitionCount", "2"),
    ])
    .unwrap();

    let source = SimulatedSource::new(STREAM, 2);
    source.append_all(100);
    let engine = SimulatedEngine::new();

    let mut first = offsetgate_core::build_runner(
        &settings,
        &StreamIdGenerator::new(),
        source.clone(),
        engine.clone(),
        Default::default(),
        Default::default(),
    )
    .await
    .unwrap();
    first.run(stream::iter(0..3)).await.unwrap();
    drop(first);

    let mut second = offsetgate_core::build_runner(
        &settings,
        &StreamIdGenerator::new(),
        source,
        engine,
        Default::default(),
        Default::default(),
    )
    .await
    .unwrap();
    assert_eq!(second.recover().await.unwrap(), RecoveryOutcome::Resumed(2));

    let current = second.planner().tracker().current();
    assert_eq!(
        current.offsets.get(&PartitionId::new(STREAM, 0)),
        Some(&PartitionOffset::new(30 * 64, 30))
    );
    assert_eq!(second.run_cycle().await.unwrap().batch_id, 3);
}
