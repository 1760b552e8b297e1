//! Merge-back reconciliation: incremental version apply, validation failure
//! revert, and idempotent re-runs.

mod common;

use std::sync::Arc;

use common::TestCluster;
use holo_failover::{
    CleanupStatus, FailoverConfig, FailoverManager, FailureRecord, FailureRepository,
    InMemoryRepository, MergeStatus, ShardId, ShardStatus, TemporaryShard,
};

const ORIGINAL: ShardId = 10;
const TEMP: ShardId = 90_000;
const FAILED_AT: u64 = 1_000;

fn recovering_record(temp_shard_id: Option<ShardId>) -> FailureRecord {
    let mut record = FailureRecord::failed(ORIGINAL, 2, common::PARTITION, common::TABLE, FAILED_AT);
    if let Some(temp_shard_id) = temp_shard_id {
        record.set_temp_shard(&TemporaryShard {
            temp_shard_id,
            host_node_id: 3,
            temp_partition_id: common::PARTITION + 800,
            original_shard_id: ORIGINAL,
        });
    }
    record.begin_recovery(2_000);
    record
}

struct Fixture {
    cluster: TestCluster,
    manager: FailoverManager,
    repository: Arc<InMemoryRepository>,
}

async fn fixture(record: FailureRecord) -> Fixture {
    let cluster = TestCluster::new();
    let repository = Arc::new(InMemoryRepository::new());
    repository.save(record).await.expect("seed record");
    let manager = FailoverManager::new(
        FailoverConfig::default(),
        repository.clone(),
        cluster.collaborators(),
    );
    Fixture {
        cluster,
        manager,
        repository,
    }
}

#[tokio::test]
async fn post_failure_versions_merge_back_in_order() {
    let f = fixture(recovering_record(Some(TEMP))).await;
    f.cluster
        .versions
        .set_versions(ORIGINAL, &[(2, 100), (3, 200)]);
    // Version 3 predates the failure (shared history); 4 and 5 are new.
    f.cluster
        .versions
        .set_versions(TEMP, &[(3, 200), (4, 1_200), (5, 1_500)]);

    let outcome = f
        .manager
        .reconciler()
        .merge_shard(recovering_record(Some(TEMP)))
        .await;
    assert_eq!(outcome.status, MergeStatus::Success);
    assert_eq!(outcome.applied, vec![4, 5]);
    assert_eq!(
        f.cluster.transfer.applied(),
        vec![(ORIGINAL, 4), (ORIGINAL, 5)],
        "incremental versions apply to the original in ascending order"
    );

    let record = f
        .repository
        .find_by_shard(ORIGINAL)
        .await
        .expect("find")
        .expect("record");
    assert_eq!(record.status, ShardStatus::Recovered);
    assert_eq!(record.cleanup_status, CleanupStatus::NotCleaned);
    assert_eq!(record.merge_error, None);
    assert_eq!(f.manager.metrics().snapshot().merges_completed, 1);
}

#[tokio::test]
async fn validation_failure_reverts_the_record_to_failed() {
    let f = fixture(recovering_record(Some(TEMP))).await;
    f.cluster.versions.set_versions(ORIGINAL, &[(2, 100)]);
    f.cluster.versions.set_versions(TEMP, &[(4, 1_200)]);
    f.cluster.validator.set_valid(false);

    let outcome = f
        .manager
        .reconciler()
        .merge_shard(recovering_record(Some(TEMP)))
        .await;
    assert_eq!(outcome.status, MergeStatus::ValidationFailed);
    assert!(outcome.error.is_some());

    let record = f
        .repository
        .find_by_shard(ORIGINAL)
        .await
        .expect("find")
        .expect("record");
    assert_eq!(record.status, ShardStatus::Failed, "episode restarts");
    assert!(record.merge_error.is_some());
    assert_eq!(f.manager.metrics().snapshot().merges_failed, 1);
}

#[tokio::test]
async fn apply_failure_reverts_and_reports_the_version() {
    let f = fixture(recovering_record(Some(TEMP))).await;
    f.cluster.versions.set_versions(ORIGINAL, &[(2, 100)]);
    f.cluster
        .versions
        .set_versions(TEMP, &[(4, 1_200), (5, 1_500)]);
    f.cluster.transfer.fail_apply_of(5);

    let outcome = f
        .manager
        .reconciler()
        .merge_shard(recovering_record(Some(TEMP)))
        .await;
    assert_eq!(outcome.status, MergeStatus::Failed);
    assert!(outcome.error.expect("error").contains("version 5"));

    let record = f
        .repository
        .find_by_shard(ORIGINAL)
        .await
        .expect("find")
        .expect("record");
    assert_eq!(record.status, ShardStatus::Failed);
}

#[tokio::test]
async fn record_without_temp_shard_recovers_trivially() {
    let f = fixture(recovering_record(None)).await;

    let outcome = f
        .manager
        .reconciler()
        .merge_shard(recovering_record(None))
        .await;
    assert_eq!(outcome.status, MergeStatus::Success);
    assert!(outcome.applied.is_empty());

    let record = f
        .repository
        .find_by_shard(ORIGINAL)
        .await
        .expect("find")
        .expect("record");
    assert_eq!(record.status, ShardStatus::Recovered);
    assert_eq!(
        record.cleanup_status,
        CleanupStatus::Cleaned,
        "nothing was ever rerouted, nothing to clean"
    );
    assert!(f.cluster.transfer.applied().is_empty());
}

#[tokio::test]
async fn rerunning_a_finished_merge_is_a_no_op() {
    let f = fixture(recovering_record(Some(TEMP))).await;
    f.cluster.versions.set_versions(ORIGINAL, &[(2, 100)]);
    f.cluster.versions.set_versions(TEMP, &[(4, 1_200)]);

    let first = f
        .manager
        .reconciler()
        .merge_shard(recovering_record(Some(TEMP)))
        .await;
    assert_eq!(first.status, MergeStatus::Success);
    let applied_once = f.cluster.transfer.applied();

    // A stale scan snapshot hands the same record back in.
    let second = f
        .manager
        .reconciler()
        .merge_shard(recovering_record(Some(TEMP)))
        .await;
    assert_eq!(second.status, MergeStatus::Success);
    assert!(second.applied.is_empty());
    assert_eq!(
        f.cluster.transfer.applied(),
        applied_once,
        "no versions re-applied"
    );
}

#[tokio::test]
async fn reconcile_cycle_picks_up_recovering_records() {
    let f = fixture(recovering_record(Some(TEMP))).await;
    f.cluster.versions.set_versions(ORIGINAL, &[(2, 100)]);
    f.cluster.versions.set_versions(TEMP, &[(4, 1_200)]);

    f.manager
        .reconciler()
        .reconcile_once()
        .await
        .expect("cycle");

    let record = f
        .repository
        .find_by_shard(ORIGINAL)
        .await
        .expect("find")
        .expect("record");
    assert_eq!(record.status, ShardStatus::Recovered);
    assert_eq!(f.cluster.transfer.applied(), vec![(ORIGINAL, 4)]);
}
