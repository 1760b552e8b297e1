//! Durable per-shard failure records.
//!
//! A `FailureRecord` is the audit trail of one failure episode. It is created
//! by the detector on first observed failure, advanced by the detector
//! (recovery), the reconciler (merge completion), and the cleanup daemon
//! (cleanup fields), and never deleted except by explicit administrative
//! action. Exactly one component owns each transition, so concurrent writers
//! to the same record cannot occur by construction.

use serde::{Deserialize, Serialize};

use crate::creator::TemporaryShard;
use crate::{NodeId, PartitionId, ShardId, TableId};

/// Shard failure lifecycle. Transitions are monotonic:
/// `Failed -> Recovering -> Recovered`, with the single exception of a merge
/// failure reverting `Recovering -> Failed` to restart the episode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    Failed,
    Recovering,
    Recovered,
}

/// Cleanup lifecycle of the temporary shard, meaningful once the record is
/// `Recovered`. `CleanupFailed` is retried indefinitely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupStatus {
    NotCleaned,
    Cleaning,
    Cleaned,
    CleanupFailed,
}

/// One failure episode for one shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub shard_id: ShardId,
    /// Node hosting the shard at failure time.
    pub node_id: NodeId,
    pub partition_id: PartitionId,
    pub table_id: TableId,
    /// Unix ms of the first failure observation.
    pub failed_at: u64,
    /// Unix ms when recovery processing started (not when it completed).
    pub recovered_at: Option<u64>,
    pub status: ShardStatus,
    /// Identity of the replacement shard, set at most once per episode.
    pub temp_shard_id: Option<ShardId>,
    /// Node hosting the temporary shard; cleanup batches removals per node.
    pub temp_node_id: Option<NodeId>,
    pub cleanup_status: CleanupStatus,
    pub cleanup_at: Option<u64>,
    pub cleanup_error: Option<String>,
    /// Last merge failure message, kept when the record reverts to `Failed`.
    pub merge_error: Option<String>,
}

impl FailureRecord {
    /// New record for a freshly observed failure.
    pub fn failed(
        shard_id: ShardId,
        node_id: NodeId,
        partition_id: PartitionId,
        table_id: TableId,
        failed_at: u64,
    ) -> Self {
        Self {
            shard_id,
            node_id,
            partition_id,
            table_id,
            failed_at,
            recovered_at: None,
            status: ShardStatus::Failed,
            temp_shard_id: None,
            temp_node_id: None,
            cleanup_status: CleanupStatus::NotCleaned,
            cleanup_at: None,
            cleanup_error: None,
            merge_error: None,
        }
    }

    /// `Failed -> Recovering`, stamping the start of recovery processing.
    /// Returns whether the transition applied.
    pub fn begin_recovery(&mut self, now_ms: u64) -> bool {
        if self.status != ShardStatus::Failed {
            return false;
        }
        self.status = ShardStatus::Recovering;
        self.recovered_at = Some(now_ms);
        true
    }

    /// `Recovering -> Recovered`, arming the cleanup lifecycle.
    pub fn mark_recovered(&mut self) -> bool {
        if self.status != ShardStatus::Recovering {
            return false;
        }
        self.status = ShardStatus::Recovered;
        self.cleanup_status = CleanupStatus::NotCleaned;
        self.merge_error = None;
        true
    }

    /// Revert a failed merge back to `Failed` so the shard re-enters the
    /// failure-handling cycle instead of sticking in `Recovering`.
    pub fn revert_to_failed(&mut self, error: impl Into<String>) -> bool {
        if self.status != ShardStatus::Recovering {
            return false;
        }
        self.status = ShardStatus::Failed;
        self.recovered_at = None;
        self.merge_error = Some(error.into());
        true
    }

    /// Record the temporary shard identity. Write-once: later calls with a
    /// different shard are rejected.
    pub fn set_temp_shard(&mut self, temp: &TemporaryShard) -> bool {
        match self.temp_shard_id {
            None => {
                self.temp_shard_id = Some(temp.temp_shard_id);
                self.temp_node_id = Some(temp.host_node_id);
                true
            }
            Some(existing) => existing == temp.temp_shard_id,
        }
    }

    /// Whether the cleanup daemon still owes this record a removal attempt.
    pub fn cleanup_pending(&self) -> bool {
        self.status == ShardStatus::Recovered
            && matches!(
                self.cleanup_status,
                CleanupStatus::NotCleaned | CleanupStatus::CleanupFailed
            )
    }
}
