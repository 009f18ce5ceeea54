mod common;

use std::collections::BTreeMap;

use offsetgate_core::Error;
use offsetgate_core::engine::EngineMarkers;
use offsetgate_core::recovery::RecoveryOutcome;
use offsetgate_core::store::ProgressStore;
use offsetgate_core::types::{BatchRecord, PartitionId};
use offsetgate_testing::simsource::position_of;

use common::{Harness, STREAM, STREAM_UID, seq_of};

#[tokio::test]
async fn test_cold_start_commits_nothing() {
    let harness = Harness::new(2);
    let mut runner = harness.runner(10).await;

    let outcome = runner.recover().await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::ColdStart);
    assert_eq!(outcome.recovered_batch_id(), -1);

    let current = runner.planner().tracker().current();
    assert!(current.is_initial());
    assert!(current.offsets.values().all(|offset| offset.is_sentinel()));
    assert!(harness.store.list(STREAM_UID).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recovery_is_idempotent_per_runner() {
    let harness = Harness::new(1);
    let mut runner = harness.runner(10).await;
    let first = runner.recover().await.unwrap();
    let second = runner.recover().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_lost_commit_is_recovered_from_engine_markers() {
    let harness = Harness::new(2);
    harness.source.append_all(1000);
    let mut runner = harness.runner(100).await;
    runner.recover().await.unwrap();
    runner.run_cycle().await.unwrap();
    runner.run_cycle().await.unwrap();

    // the engine finishes batch 2 but the process dies before committing it
    harness.engine.error_injector().crash_after_end_marker(1);
    assert!(runner.run_cycle().await.is_err());
    drop(runner);
    assert_eq!(harness.store.list(STREAM_UID).await.unwrap(), vec![0, 1]);

    let mut restarted = harness.runner(100).await;
    let outcome = restarted.recover().await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::CommittedOnBehalf(2));
    assert_eq!(seq_of(&restarted, 0), 300);
    assert_eq!(restarted.run_cycle().await.unwrap().batch_id, 3);
}

#[tokio::test]
async fn test_engine_markers_behind_committed_progress_are_rejected() {
    let harness = Harness::new(2);
    harness.source.append(0, 500);
    harness.source.append(1, 500);
    let mut runner = harness.runner(1000).await;
    runner.recover().await.unwrap();
    for _ in 0..5 {
        runner.run_cycle().await.unwrap();
    }
    drop(runner);

    let p0 = PartitionId::new(STREAM, 0);
    let p1 = PartitionId::new(STREAM, 1);
    harness.engine.set_markers(EngineMarkers {
        start: BatchRecord::new(5, BTreeMap::from([(p0.clone(), 100), (p1.clone(), 200)])),
        consumed: Some(BTreeMap::from([
            (p0.clone(), position_of(100)),
            (p1.clone(), position_of(150)),
        ])),
    });

    // batch 0 already took both partitions to 500, the marker above would move them backwards
    let mut restarted = harness.runner(1000).await;
    let err = restarted.recover().await.unwrap_err();
    assert!(matches!(err, Error::Invariant { batch_id: 5, .. }));
    assert!(restarted.planner().is_first_batch());
}

#[tokio::test]
async fn test_scenario_commit_on_behalf() {
    let harness = Harness::new(2);
    harness.source.append_all(1000);

    // batches 0..=4 advance both partitions to 50
    let mut runner = harness.runner(10).await;
    runner.recover().await.unwrap();
    for _ in 0..5 {
        runner.run_cycle().await.unwrap();
    }
    assert_eq!(seq_of(&runner, 0), 50);
    drop(runner);

    let p0 = PartitionId::new(STREAM, 0);
    let p1 = PartitionId::new(STREAM, 1);
    harness.engine.set_markers(EngineMarkers {
        start: BatchRecord::new(5, BTreeMap::from([(p0.clone(), 100), (p1.clone(), 200)])),
        consumed: Some(BTreeMap::from([
            (p0.clone(), position_of(100)),
            (p1.clone(), position_of(150)),
        ])),
    });

    let mut restarted = harness.runner(10).await;
    assert_eq!(
        restarted.recover().await.unwrap(),
        RecoveryOutcome::CommittedOnBehalf(5)
    );
    let current = restarted.planner().tracker().current();
    assert_eq!(current.batch_id, 5);
    assert_eq!(current.offsets.get(&p0), Some(&position_of(100)));
    assert_eq!(current.offsets.get(&p1), Some(&position_of(150)));
    assert_eq!(restarted.run_cycle().await.unwrap().batch_id, 6);
}

#[tokio::test]
async fn test_started_but_unfinished_batch_is_replanned() {
    let harness = Harness::new(1);
    harness.source.append_all(100);
    let mut runner = harness.runner(10).await;
    runner.recover().await.unwrap();
    runner.run_cycle().await.unwrap();

    harness.engine.error_injector().crash_before_end_marker(1);
    assert!(runner.run_cycle().await.is_err());
    drop(runner);

    // every restart before the batch completes settles on the same committed batch
    for _ in 0..3 {
        let mut restarted = harness.runner(10).await;
        assert_eq!(
            restarted.recover().await.unwrap(),
            RecoveryOutcome::Resumed(0)
        );
        assert_eq!(seq_of(&restarted, 0), 10);
    }

    let mut restarted = harness.runner(10).await;
    restarted.recover().await.unwrap();
    let report = restarted.run_cycle().await.unwrap();
    assert_eq!(report.batch_id, 1);
    assert_eq!(seq_of(&restarted, 0), 20);
    assert_eq!(harness.engine.consumed_messages(), 20);
    assert_eq!(harness.store.list(STREAM_UID).await.unwrap(), vec![0, 1]);
}

#[tokio::test]
async fn test_unreachable_upstream_fails_recovery() {
    let harness = Harness::new(1);
    harness.source.error_injector().set_unreachable(true);
    let mut runner = harness.runner(10).await;

    let err = runner.recover().await.unwrap_err();
    assert!(matches!(err, Error::NoHorizon { .. }));
    assert!(err.is_fatal());
}
