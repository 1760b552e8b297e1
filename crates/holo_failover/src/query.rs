//! Query-time pruning of failed shards from scan shard sets.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::detector::FailureDetector;
use crate::metrics::FailoverMetrics;
use crate::repository::RepositoryError;
use crate::{ShardId, TableId};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// Every shard the query needs is unavailable; the query must fail
    /// instead of silently scanning nothing.
    #[error("all {required} required shards of table {table_id} are unavailable")]
    AllShardsUnavailable { table_id: TableId, required: usize },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Result of pruning one scan's shard set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PruneOutcome {
    pub shard_ids: BTreeSet<ShardId>,
    /// Set when shards were pruned: the query may read incomplete data and
    /// the caller should surface a result-quality warning.
    pub degraded: bool,
}

pub struct QueryFilter {
    detector: Arc<FailureDetector>,
    metrics: Arc<FailoverMetrics>,
}

impl QueryFilter {
    pub fn new(detector: Arc<FailureDetector>, metrics: Arc<FailoverMetrics>) -> Self {
        Self { detector, metrics }
    }

    /// Remove failed shards from `required`. Pure over one detector snapshot
    /// per call; safe to run concurrently with detector updates.
    pub async fn prune(
        &self,
        required: &BTreeSet<ShardId>,
        table_id: TableId,
    ) -> Result<PruneOutcome, QueryError> {
        let failed = self.detector.failed_shards_of(table_id).await?;

        if failed.is_disjoint(required) {
            return Ok(PruneOutcome {
                shard_ids: required.clone(),
                degraded: false,
            });
        }

        let remaining: BTreeSet<ShardId> = required.difference(&failed).copied().collect();
        if remaining.is_empty() {
            self.metrics.record_rejected_query();
            return Err(QueryError::AllShardsUnavailable {
                table_id,
                required: required.len(),
            });
        }

        self.metrics.record_degraded_query();
        tracing::warn!(
            table_id,
            pruned = required.len() - remaining.len(),
            remaining = remaining.len(),
            "query will read incomplete data"
        );
        Ok(PruneOutcome {
            shard_ids: remaining,
            degraded: true,
        })
    }
}
