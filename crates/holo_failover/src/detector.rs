//! Node-liveness polling and per-shard failure state.
//!
//! Each detection cycle walks the membership view: every shard hosted on a
//! dead node gets a `Failed` record (idempotently), and every `Failed` shard
//! whose node came back transitions to `Recovering`. Records are
//! read-modify-written one shard at a time, so a partial cycle never leaves a
//! record in an indeterminate state.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cluster::ClusterMembership;
use crate::metrics::FailoverMetrics;
use crate::record::{CleanupStatus, FailureRecord, ShardStatus};
use crate::repository::{FailureRepository, RepositoryError};
use crate::{unix_time_ms, NodeId, ShardId, TableId};

pub struct FailureDetector {
    repository: Arc<dyn FailureRepository>,
    membership: Arc<dyn ClusterMembership>,
    metrics: Arc<FailoverMetrics>,
}

impl FailureDetector {
    pub fn new(
        repository: Arc<dyn FailureRepository>,
        membership: Arc<dyn ClusterMembership>,
        metrics: Arc<FailoverMetrics>,
    ) -> Self {
        Self {
            repository,
            membership,
            metrics,
        }
    }

    /// Whether writes to this shard must be rerouted. Reads the latest
    /// committed record; called on every write and query plan.
    pub async fn is_shard_failed(&self, shard_id: ShardId) -> Result<bool, RepositoryError> {
        Ok(self
            .repository
            .find_by_shard(shard_id)
            .await?
            .is_some_and(|record| record.status == ShardStatus::Failed))
    }

    /// Shards of `table_id` currently in `Failed` state.
    pub async fn failed_shards_of(
        &self,
        table_id: TableId,
    ) -> Result<BTreeSet<ShardId>, RepositoryError> {
        Ok(self
            .repository
            .list_by_status(Some(ShardStatus::Failed))
            .await?
            .into_iter()
            .filter(|record| record.table_id == table_id)
            .map(|record| record.shard_id)
            .collect())
    }

    /// One detection cycle. A liveness-source error aborts the cycle (it is
    /// retried on the next tick); per-node lookup errors skip only that node.
    pub async fn detect_once(&self) -> anyhow::Result<()> {
        let nodes = self
            .membership
            .list_nodes()
            .await
            .context("list cluster nodes")?;

        for node in nodes {
            let shards = match self.membership.shards_hosted_on(node.node_id).await {
                Ok(shards) => shards,
                Err(err) => {
                    tracing::warn!(
                        node_id = node.node_id,
                        error = ?err,
                        "shard listing failed, skipping node this cycle"
                    );
                    continue;
                }
            };

            for shard_id in shards {
                if node.alive {
                    self.observe_alive(shard_id).await?;
                } else {
                    self.observe_failed(node.node_id, shard_id).await?;
                }
            }
        }

        self.metrics.record_detector_cycle();
        Ok(())
    }

    /// Shard hosted on a dead node. Creates a record on first observation;
    /// an in-progress episode coalesces the repeat observation, and a fully
    /// finished episode (recovered and cleaned) starts a fresh one.
    async fn observe_failed(
        &self,
        node_id: NodeId,
        shard_id: ShardId,
    ) -> Result<(), RepositoryError> {
        match self.repository.find_by_shard(shard_id).await? {
            None => self.open_episode(node_id, shard_id).await,
            Some(record) if record.status == ShardStatus::Failed => Ok(()),
            Some(record)
                if record.status == ShardStatus::Recovered
                    && record.cleanup_status == CleanupStatus::Cleaned =>
            {
                tracing::warn!(shard_id, node_id, "shard failed again, opening new episode");
                self.open_episode(node_id, shard_id).await
            }
            Some(record) => {
                tracing::debug!(
                    shard_id,
                    status = ?record.status,
                    "failure observed while prior episode still settling, coalescing"
                );
                Ok(())
            }
        }
    }

    /// Catalog lookup failures skip only this shard; it is observed again
    /// next cycle.
    async fn open_episode(
        &self,
        node_id: NodeId,
        shard_id: ShardId,
    ) -> Result<(), RepositoryError> {
        let table_id = match self.membership.table_of(shard_id).await {
            Ok(table_id) => table_id,
            Err(err) => {
                tracing::warn!(shard_id, error = ?err, "table lookup failed, skipping shard this cycle");
                return Ok(());
            }
        };
        let partition_id = match self.membership.partition_of(shard_id).await {
            Ok(partition_id) => partition_id,
            Err(err) => {
                tracing::warn!(shard_id, error = ?err, "partition lookup failed, skipping shard this cycle");
                return Ok(());
            }
        };

        tracing::warn!(shard_id, node_id, table_id, "marking shard failed");
        self.repository
            .save(FailureRecord::failed(
                shard_id,
                node_id,
                partition_id,
                table_id,
                unix_time_ms(),
            ))
            .await?;
        Ok(())
    }

    /// Shard hosted on an alive node: a `Failed` record starts recovering.
    async fn observe_alive(&self, shard_id: ShardId) -> Result<(), RepositoryError> {
        let Some(mut record) = self.repository.find_by_shard(shard_id).await? else {
            return Ok(());
        };
        if record.begin_recovery(unix_time_ms()) {
            tracing::info!(shard_id, node_id = record.node_id, "shard is recovering");
            self.repository.save(record).await?;
        }
        Ok(())
    }
}

/// Spawn the periodic detection loop.
pub fn spawn(
    detector: Arc<FailureDetector>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = detector.detect_once().await {
                        tracing::warn!(error = ?err, "failure detection cycle failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
