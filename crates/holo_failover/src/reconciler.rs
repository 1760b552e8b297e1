//! Background merge-back of temporary-shard data into recovered originals.
//!
//! Each cycle scans `Recovering` records and dispatches one merge task per
//! shard into a bounded worker pool. Versions present only on the temporary
//! shard (created after `failed_at`) are applied to the original in
//! ascending version order, then the result is validated. Success flips the
//! record to `Recovered`; any failure reverts it to `Failed` so the shard
//! re-enters the failure-handling cycle instead of sticking in `Recovering`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cluster::{DataTransfer, MergeValidator, VersionHistory, VersionInfo};
use crate::metrics::FailoverMetrics;
use crate::record::{CleanupStatus, FailureRecord, ShardStatus};
use crate::repository::{FailureRepository, RepositoryError};
use crate::{ShardId, VersionId};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("version history of shard {shard_id} unavailable: {message}")]
    History { shard_id: ShardId, message: String },
    #[error("read of version {version_id} from shard {shard_id} failed: {message}")]
    Read {
        shard_id: ShardId,
        version_id: VersionId,
        message: String,
    },
    #[error("apply of version {version_id} to shard {shard_id} failed: {message}")]
    Apply {
        shard_id: ShardId,
        version_id: VersionId,
        message: String,
    },
    #[error("merge validation failed for shard {shard_id}")]
    Validation { shard_id: ShardId },
    #[error("validator for shard {shard_id} errored: {message}")]
    Validator { shard_id: ShardId, message: String },
}

/// Partition of version ids for one merge attempt: `base` already lives on
/// the original shard, `incremental` exists only on the temporary shard.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub base: Vec<VersionId>,
    pub incremental: Vec<VersionId>,
}

/// Versions created on the temporary shard strictly after the failure are
/// the increment; they are applied in ascending version order since later
/// versions may depend on earlier ones.
pub fn plan_merge(original: &[VersionInfo], temp: &[VersionInfo], failed_at_ms: u64) -> MergePlan {
    let mut incremental: Vec<VersionId> = temp
        .iter()
        .filter(|version| version.created_at_ms > failed_at_ms)
        .map(|version| version.version_id)
        .collect();
    incremental.sort_unstable();
    incremental.dedup();
    MergePlan {
        base: original.iter().map(|version| version.version_id).collect(),
        incremental,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStatus {
    Success,
    ValidationFailed,
    Failed,
}

/// Transient outcome of one merge attempt. Only the resulting record
/// transition is durable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub shard_id: ShardId,
    pub status: MergeStatus,
    pub applied: Vec<VersionId>,
    pub error: Option<String>,
}

pub struct MergeReconciler {
    repository: Arc<dyn FailureRepository>,
    versions: Arc<dyn VersionHistory>,
    transfer: Arc<dyn DataTransfer>,
    validator: Arc<dyn MergeValidator>,
    metrics: Arc<FailoverMetrics>,
    /// Shard ids with a merge task currently running; overlapping scan
    /// cycles skip these instead of queuing duplicates.
    in_flight: Mutex<HashSet<ShardId>>,
    workers: Arc<Semaphore>,
    cycle_budget: Duration,
}

impl MergeReconciler {
    pub fn new(
        repository: Arc<dyn FailureRepository>,
        versions: Arc<dyn VersionHistory>,
        transfer: Arc<dyn DataTransfer>,
        validator: Arc<dyn MergeValidator>,
        metrics: Arc<FailoverMetrics>,
        workers: usize,
        cycle_budget: Duration,
    ) -> Self {
        Self {
            repository,
            versions,
            transfer,
            validator,
            metrics,
            in_flight: Mutex::new(HashSet::new()),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            cycle_budget,
        }
    }

    /// One reconcile cycle: dispatch merges for every `Recovering` shard not
    /// already in flight, then wait up to the cycle budget. Stragglers are
    /// abandoned (they keep running and stay marked in-flight), not killed.
    pub async fn reconcile_once(self: &Arc<Self>) -> Result<(), RepositoryError> {
        let recovering = self
            .repository
            .list_by_status(Some(ShardStatus::Recovering))
            .await?;

        let mut tasks = FuturesUnordered::new();
        for record in recovering {
            let shard_id = record.shard_id;
            {
                let mut in_flight = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if !in_flight.insert(shard_id) {
                    continue;
                }
            }
            let reconciler = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let _permit = match reconciler.workers.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                reconciler.merge_shard(record).await;
                let mut in_flight = reconciler
                    .in_flight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                in_flight.remove(&shard_id);
            }));
        }

        let deadline = tokio::time::sleep(self.cycle_budget);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!("merge cycle budget exhausted, abandoning stragglers");
                    break;
                }
                next = tasks.next() => {
                    if next.is_none() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Merge one shard and persist the resulting record transition.
    pub async fn merge_shard(&self, scanned: FailureRecord) -> MergeOutcome {
        let shard_id = scanned.shard_id;

        // Re-read: the scan snapshot may race a concurrent transition, and a
        // duplicate pickup of an already-recovered record must be a no-op.
        let record = match self.repository.find_by_shard(shard_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return MergeOutcome {
                    shard_id,
                    status: MergeStatus::Failed,
                    applied: Vec::new(),
                    error: Some("failure record vanished".to_string()),
                }
            }
            Err(err) => {
                tracing::warn!(shard_id, error = ?err, "merge aborted, repository unavailable");
                return MergeOutcome {
                    shard_id,
                    status: MergeStatus::Failed,
                    applied: Vec::new(),
                    error: Some(err.to_string()),
                };
            }
        };
        if record.status != ShardStatus::Recovering {
            return MergeOutcome {
                shard_id,
                status: MergeStatus::Success,
                applied: Vec::new(),
                error: None,
            };
        }

        let Some(temp_shard_id) = record.temp_shard_id else {
            // No write was ever rerouted: nothing to merge, nothing to clean.
            return self
                .finish(record, |record| {
                    record.mark_recovered();
                    record.cleanup_status = CleanupStatus::Cleaned;
                })
                .await;
        };

        match self.apply_incremental(shard_id, temp_shard_id, record.failed_at).await {
            Ok(applied) => {
                tracing::info!(
                    shard_id,
                    temp_shard_id,
                    versions = applied.len(),
                    "merge-back complete, shard recovered"
                );
                self.metrics.record_merge_completed();
                let mut outcome = self
                    .finish(record, |record| {
                        record.mark_recovered();
                    })
                    .await;
                outcome.applied = applied;
                outcome
            }
            Err(err) => {
                tracing::warn!(shard_id, temp_shard_id, error = %err, "merge-back failed");
                self.metrics.record_merge_failed();
                let status = match &err {
                    MergeError::Validation { .. } => MergeStatus::ValidationFailed,
                    _ => MergeStatus::Failed,
                };
                let message = err.to_string();
                let mut outcome = self
                    .finish(record, |record| {
                        record.revert_to_failed(message.clone());
                    })
                    .await;
                outcome.status = status;
                outcome.error = Some(message);
                outcome
            }
        }
    }

    async fn apply_incremental(
        &self,
        shard_id: ShardId,
        temp_shard_id: ShardId,
        failed_at_ms: u64,
    ) -> Result<Vec<VersionId>, MergeError> {
        let original = self
            .versions
            .versions_of(shard_id)
            .await
            .map_err(|err| MergeError::History {
                shard_id,
                message: format!("{err:#}"),
            })?;
        let temp = self
            .versions
            .versions_of(temp_shard_id)
            .await
            .map_err(|err| MergeError::History {
                shard_id: temp_shard_id,
                message: format!("{err:#}"),
            })?;
        let plan = plan_merge(&original, &temp, failed_at_ms);

        let mut applied = Vec::with_capacity(plan.incremental.len());
        for version_id in plan.incremental {
            let batch = self
                .transfer
                .read_version(temp_shard_id, version_id)
                .await
                .map_err(|err| MergeError::Read {
                    shard_id: temp_shard_id,
                    version_id,
                    message: format!("{err:#}"),
                })?;
            self.transfer
                .apply_version(shard_id, batch, version_id)
                .await
                .map_err(|err| MergeError::Apply {
                    shard_id,
                    version_id,
                    message: format!("{err:#}"),
                })?;
            applied.push(version_id);
        }

        let valid = self
            .validator
            .validate(shard_id, temp_shard_id)
            .await
            .map_err(|err| MergeError::Validator {
                shard_id,
                message: format!("{err:#}"),
            })?;
        if !valid {
            return Err(MergeError::Validation { shard_id });
        }
        Ok(applied)
    }

    /// Apply a record transition and persist it.
    async fn finish<F>(&self, mut record: FailureRecord, apply: F) -> MergeOutcome
    where
        F: FnOnce(&mut FailureRecord),
    {
        let shard_id = record.shard_id;
        apply(&mut record);
        match self.repository.save(record).await {
            Ok(()) => MergeOutcome {
                shard_id,
                status: MergeStatus::Success,
                applied: Vec::new(),
                error: None,
            },
            Err(err) => {
                tracing::warn!(shard_id, error = ?err, "failed to persist merge transition");
                MergeOutcome {
                    shard_id,
                    status: MergeStatus::Failed,
                    applied: Vec::new(),
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

/// Spawn the periodic reconcile loop.
pub fn spawn(
    reconciler: Arc<MergeReconciler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = reconciler.reconcile_once().await {
                        tracing::warn!(error = ?err, "merge reconcile cycle failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
