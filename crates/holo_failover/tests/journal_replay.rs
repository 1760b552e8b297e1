//! Journal-backed durability: a reopened repository serves the same records
//! it acknowledged before the restart.

mod common;

use holo_failover::{
    CleanupStatus, FailureRecord, FailureRepository, InMemoryRepository, ShardStatus,
};

#[tokio::test]
async fn reopened_repository_serves_the_pre_restart_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("failover.journal");

    {
        let repo = InMemoryRepository::open(&path).expect("open");
        repo.save(FailureRecord::failed(10, 2, common::PARTITION, common::TABLE, 1_000))
            .await
            .expect("save");
        let mut recovering = FailureRecord::failed(11, 2, common::PARTITION, common::TABLE, 1_000);
        recovering.begin_recovery(2_000);
        repo.save(recovering).await.expect("save");
    }

    let repo = InMemoryRepository::open(&path).expect("reopen");
    let failed = repo.find_by_shard(10).await.expect("find").expect("record");
    assert_eq!(failed.status, ShardStatus::Failed);
    let recovering = repo.find_by_shard(11).await.expect("find").expect("record");
    assert_eq!(recovering.status, ShardStatus::Recovering);
    assert_eq!(recovering.recovered_at, Some(2_000));
    assert_eq!(repo.list_by_status(None).await.expect("list").len(), 2);
}

#[tokio::test]
async fn replay_is_last_writer_wins_per_shard() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("failover.journal");

    {
        let repo = InMemoryRepository::open(&path).expect("open");
        let mut record = FailureRecord::failed(10, 2, common::PARTITION, common::TABLE, 1_000);
        repo.save(record.clone()).await.expect("save");
        record.begin_recovery(2_000);
        repo.save(record.clone()).await.expect("save");
        record.mark_recovered();
        repo.save(record).await.expect("save");
        repo.mark_cleaned(10).await.expect("mark");
    }

    let repo = InMemoryRepository::open(&path).expect("reopen");
    let record = repo.find_by_shard(10).await.expect("find").expect("record");
    assert_eq!(record.status, ShardStatus::Recovered);
    assert_eq!(record.cleanup_status, CleanupStatus::Cleaned);
    assert_eq!(repo.count_pending_cleanup().await.expect("count"), 0);
}

#[tokio::test]
async fn torn_tail_from_a_crash_keeps_the_acknowledged_prefix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("failover.journal");

    {
        let repo = InMemoryRepository::open(&path).expect("open");
        repo.save(FailureRecord::failed(10, 2, common::PARTITION, common::TABLE, 1_000))
            .await
            .expect("save");
    }

    // Crash mid-append: a partial frame lands after the last full one.
    let mut raw = std::fs::read(&path).expect("read");
    raw.extend_from_slice(&[200, 0, 0, 0, 1, 2]);
    std::fs::write(&path, &raw).expect("write");

    let repo = InMemoryRepository::open(&path).expect("reopen");
    let record = repo.find_by_shard(10).await.expect("find").expect("record");
    assert_eq!(record.shard_id, 10);
    assert_eq!(repo.list_by_status(None).await.expect("list").len(), 1);
}

#[tokio::test]
async fn removal_interrupted_by_restart_is_retried() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("failover.journal");

    {
        let repo = InMemoryRepository::open(&path).expect("open");
        let mut record = FailureRecord::failed(10, 2, common::PARTITION, common::TABLE, 1_000);
        record.begin_recovery(2_000);
        record.mark_recovered();
        repo.save(record).await.expect("save");
        // Crash after the removal attempt was flagged but before its outcome
        // landed.
        repo.mark_cleaning(10).await.expect("mark");
    }

    let repo = InMemoryRepository::open(&path).expect("reopen");
    let record = repo.find_by_shard(10).await.expect("find").expect("record");
    assert_eq!(record.cleanup_status, CleanupStatus::CleanupFailed);
    assert!(record
        .cleanup_error
        .as_deref()
        .expect("error recorded")
        .contains("interrupted"));
    assert_eq!(repo.count_pending_cleanup().await.expect("count"), 1);
    assert_eq!(
        repo.list_recovered_before(u64::MAX)
            .await
            .expect("scan")
            .len(),
        1,
        "the record is scanned again for removal"
    );
}

#[tokio::test]
async fn admin_delete_survives_as_absence_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("failover.journal");

    {
        let repo = InMemoryRepository::open(&path).expect("open");
        repo.save(FailureRecord::failed(10, 2, common::PARTITION, common::TABLE, 1_000))
            .await
            .expect("save");
        repo.save(FailureRecord::failed(11, 2, common::PARTITION, common::TABLE, 1_000))
            .await
            .expect("save");
        repo.delete_by_shard(10).await.expect("delete");
        assert!(repo.find_by_shard(10).await.expect("find").is_none());
    }

    // Deletes are in-memory only; replay resurrects the record. Operators
    // deleting a record should also rotate the journal, and the record is
    // harmless either way since its episode fields are stale.
    let repo = InMemoryRepository::open(&path).expect("reopen");
    assert_eq!(repo.list_by_status(None).await.expect("list").len(), 2);
}
