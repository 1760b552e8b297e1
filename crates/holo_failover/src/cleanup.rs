//! Retention-based physical removal of merged temporary shards.
//!
//! Each cycle scans recovered records older than the retention window,
//! batches them per hosting node, and issues one remove request per node. An
//! unreachable node defers its whole group to the next cycle without
//! affecting other groups; a failed removal is marked `CleanupFailed` and
//! retried indefinitely.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cluster::{ClusterMembership, ShardRpc};
use crate::creator::TempShardCreator;
use crate::metrics::FailoverMetrics;
use crate::record::FailureRecord;
use crate::repository::{FailureRepository, RepositoryError};
use crate::{unix_time_ms, NodeId, ShardId};

/// Why one temporary shard's removal did not complete. Persisted on the
/// record and retried on a later cycle.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("remove rpc to node {node_id} failed: {message}")]
    Rpc { node_id: NodeId, message: String },
    #[error("node {node_id} rejected removal of shard {temp_shard_id}: {message}")]
    Removal {
        temp_shard_id: ShardId,
        node_id: NodeId,
        message: String,
    },
}

pub struct CleanupDaemon {
    repository: Arc<dyn FailureRepository>,
    membership: Arc<dyn ClusterMembership>,
    rpc: Arc<dyn ShardRpc>,
    creator: Arc<TempShardCreator>,
    metrics: Arc<FailoverMetrics>,
    retention: Duration,
    cycle_budget: Duration,
    /// Shards with a removal currently in flight; overlapping cycles skip
    /// them instead of queuing duplicate requests.
    in_flight: Mutex<HashSet<ShardId>>,
    workers: Arc<Semaphore>,
}

impl CleanupDaemon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn FailureRepository>,
        membership: Arc<dyn ClusterMembership>,
        rpc: Arc<dyn ShardRpc>,
        creator: Arc<TempShardCreator>,
        metrics: Arc<FailoverMetrics>,
        retention: Duration,
        workers: usize,
        cycle_budget: Duration,
    ) -> Self {
        Self {
            repository,
            membership,
            rpc,
            creator,
            metrics,
            retention,
            cycle_budget,
            in_flight: Mutex::new(HashSet::new()),
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// One cleanup cycle. Only repository unavailability aborts the cycle;
    /// everything else is per-group or per-shard.
    pub async fn cleanup_once(self: &Arc<Self>) -> Result<(), RepositoryError> {
        let cutoff = unix_time_ms().saturating_sub(self.retention.as_millis() as u64);
        let due = self.repository.list_recovered_before(cutoff).await?;

        let alive: HashSet<NodeId> = match self.membership.list_nodes().await {
            Ok(nodes) => nodes
                .into_iter()
                .filter(|node| node.alive)
                .map(|node| node.node_id)
                .collect(),
            Err(err) => {
                tracing::warn!(error = ?err, "membership unavailable, deferring cleanup cycle");
                return Ok(());
            }
        };

        let mut groups: BTreeMap<NodeId, Vec<FailureRecord>> = BTreeMap::new();
        for record in due {
            {
                let in_flight = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if in_flight.contains(&record.shard_id) {
                    continue;
                }
            }
            match record.temp_node_id {
                Some(node_id) if record.temp_shard_id.is_some() => {
                    groups.entry(node_id).or_default().push(record);
                }
                _ => {
                    // Recovered with no replacement shard: nothing to remove.
                    self.repository.mark_cleaned(record.shard_id).await?;
                }
            }
        }

        let mut tasks = FuturesUnordered::new();
        for (node_id, records) in groups {
            if !alive.contains(&node_id) {
                tracing::warn!(
                    node_id,
                    shards = records.len(),
                    "temp-shard host unreachable, deferring cleanup group"
                );
                continue;
            }
            {
                let mut in_flight = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                for record in &records {
                    in_flight.insert(record.shard_id);
                }
            }
            let daemon = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let _permit = match daemon.workers.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                daemon.cleanup_node_group(node_id, records).await;
            }));
        }

        let deadline = tokio::time::sleep(self.cycle_budget);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!("cleanup cycle budget exhausted, abandoning stragglers");
                    break;
                }
                next = tasks.next() => {
                    if next.is_none() {
                        break;
                    }
                }
            }
        }

        if let Ok(pending) = self.repository.count_pending_cleanup().await {
            self.metrics.set_pending_cleanups(pending as u64);
        }
        Ok(())
    }

    /// Remove one node's batch of temporary shards and record per-shard
    /// outcomes. One shard's failure never blocks the rest of the batch.
    async fn cleanup_node_group(&self, node_id: NodeId, records: Vec<FailureRecord>) {
        let temp_ids: Vec<ShardId> = records
            .iter()
            .filter_map(|record| record.temp_shard_id)
            .collect();

        for record in &records {
            if let Err(err) = self.repository.mark_cleaning(record.shard_id).await {
                tracing::warn!(shard_id = record.shard_id, error = ?err, "mark cleaning failed");
            }
        }

        match self.rpc.remove_shards(node_id, &temp_ids).await {
            Ok(outcomes) => {
                for record in &records {
                    let Some(temp_shard_id) = record.temp_shard_id else {
                        continue;
                    };
                    let message = match outcomes
                        .iter()
                        .find(|outcome| outcome.temp_shard_id == temp_shard_id)
                    {
                        Some(outcome) => outcome.error.clone(),
                        None => Some("no outcome returned for shard".to_string()),
                    };
                    let error = message.map(|message| CleanupError::Removal {
                        temp_shard_id,
                        node_id,
                        message,
                    });
                    self.settle_shard(record.shard_id, temp_shard_id, node_id, error)
                        .await;
                }
            }
            Err(err) => {
                // Whole batch failed; every shard stays eligible for retry.
                tracing::warn!(node_id, error = ?err, "remove rpc failed for cleanup group");
                for record in &records {
                    if let Some(temp_shard_id) = record.temp_shard_id {
                        self.settle_shard(
                            record.shard_id,
                            temp_shard_id,
                            node_id,
                            Some(CleanupError::Rpc {
                                node_id,
                                message: format!("{err:#}"),
                            }),
                        )
                        .await;
                    }
                }
            }
        }

        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for record in &records {
            in_flight.remove(&record.shard_id);
        }
    }

    async fn settle_shard(
        &self,
        shard_id: ShardId,
        temp_shard_id: ShardId,
        node_id: NodeId,
        error: Option<CleanupError>,
    ) {
        match error {
            None => {
                if let Err(err) = self.repository.mark_cleaned(shard_id).await {
                    tracing::warn!(shard_id, error = ?err, "mark cleaned failed");
                    return;
                }
                self.metrics.record_cleanup_succeeded();
                self.creator.forget(shard_id);
                tracing::info!(shard_id, temp_shard_id, node_id, "temporary shard removed");
            }
            Some(error) => {
                if let Err(err) = self
                    .repository
                    .mark_cleanup_failed(shard_id, &error.to_string())
                    .await
                {
                    tracing::warn!(shard_id, error = ?err, "mark cleanup failed errored");
                    return;
                }
                self.metrics.record_cleanup_failed();
                tracing::warn!(
                    shard_id,
                    temp_shard_id,
                    node_id,
                    error = %error,
                    "temporary shard removal failed, will retry"
                );
            }
        }
    }
}

/// Spawn the periodic cleanup loop.
pub fn spawn(
    daemon: Arc<CleanupDaemon>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = daemon.cleanup_once().await {
                        tracing::warn!(error = ?err, "cleanup cycle failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
