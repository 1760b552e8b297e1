//! Lazy, exactly-once creation of temporary replacement shards.
//!
//! Concurrent callers for the same original shard share one in-flight
//! provisioning future; completed results are cached so repeat calls return
//! immediately. A failed slot is cleared so a later call can retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::cluster::ShardProvisioner;
use crate::metrics::FailoverMetrics;
use crate::{NodeId, PartitionId, ShardId};

/// Temporary-shard provisioning failed. The caller's write fails fast with
/// a retryable error; the creation slot has already been cleared.
#[derive(Clone, Debug, thiserror::Error)]
#[error("temporary shard provisioning failed for shard {shard_id}: {message}")]
pub struct CreationError {
    pub shard_id: ShardId,
    pub message: String,
}

/// Ephemeral replacement shard absorbing writes for an unavailable original.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TemporaryShard {
    pub temp_shard_id: ShardId,
    pub host_node_id: NodeId,
    /// Container partition the replacement lives in.
    pub temp_partition_id: PartitionId,
    pub original_shard_id: ShardId,
}

type CreationFuture = Shared<BoxFuture<'static, Result<TemporaryShard, CreationError>>>;

enum Slot {
    InFlight { generation: u64, fut: CreationFuture },
    Ready(TemporaryShard),
}

pub struct TempShardCreator {
    provisioner: Arc<dyn ShardProvisioner>,
    metrics: Arc<FailoverMetrics>,
    slots: Mutex<HashMap<ShardId, Slot>>,
    generations: AtomicU64,
}

impl TempShardCreator {
    pub fn new(provisioner: Arc<dyn ShardProvisioner>, metrics: Arc<FailoverMetrics>) -> Self {
        Self {
            provisioner,
            metrics,
            slots: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Get or create the replacement shard for `original_shard_id`.
    ///
    /// Exactly one physical provisioning call happens per shard id no matter
    /// how many callers race here; all of them observe the same result.
    pub async fn create_if_absent(
        &self,
        original_shard_id: ShardId,
    ) -> Result<TemporaryShard, CreationError> {
        let (generation, fut) = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match slots.get(&original_shard_id) {
                Some(Slot::Ready(shard)) => return Ok(*shard),
                Some(Slot::InFlight { generation, fut }) => (*generation, fut.clone()),
                None => {
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                    let fut = self.provision(original_shard_id).boxed().shared();
                    slots.insert(
                        original_shard_id,
                        Slot::InFlight {
                            generation,
                            fut: fut.clone(),
                        },
                    );
                    (generation, fut)
                }
            }
        };

        let result = fut.await;
        self.settle(original_shard_id, generation, &result);
        result
    }

    /// The replacement shard, if provisioning already completed.
    pub fn ready(&self, original_shard_id: ShardId) -> Option<TemporaryShard> {
        let slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match slots.get(&original_shard_id) {
            Some(Slot::Ready(shard)) => Some(*shard),
            _ => None,
        }
    }

    /// Drop the cached result once the temporary shard has been physically
    /// removed, so a later failure episode provisions a fresh one.
    pub fn forget(&self, original_shard_id: ShardId) {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.remove(&original_shard_id);
    }

    fn provision(
        &self,
        original_shard_id: ShardId,
    ) -> impl std::future::Future<Output = Result<TemporaryShard, CreationError>> + Send + 'static
    {
        let provisioner = self.provisioner.clone();
        let metrics = self.metrics.clone();
        async move {
            match provisioner.provision_replacement(original_shard_id).await {
                Ok(provisioned) => {
                    metrics.record_temp_shard_created();
                    tracing::info!(
                        original_shard_id,
                        temp_shard_id = provisioned.temp_shard_id,
                        host_node_id = provisioned.host_node_id,
                        "temporary shard provisioned"
                    );
                    Ok(TemporaryShard {
                        temp_shard_id: provisioned.temp_shard_id,
                        host_node_id: provisioned.host_node_id,
                        temp_partition_id: provisioned.temp_partition_id,
                        original_shard_id,
                    })
                }
                Err(err) => {
                    metrics.record_temp_shard_creation_failure();
                    tracing::warn!(
                        original_shard_id,
                        error = ?err,
                        "temporary shard provisioning failed"
                    );
                    Err(CreationError {
                        shard_id: original_shard_id,
                        message: format!("{err:#}"),
                    })
                }
            }
        }
    }

    /// Publish the result of an awaited creation future. Every waiter calls
    /// this; the generation check keeps a stale failure settle from evicting
    /// a newer in-flight attempt.
    fn settle(
        &self,
        original_shard_id: ShardId,
        generation: u64,
        result: &Result<TemporaryShard, CreationError>,
    ) {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match result {
            Ok(shard) => {
                slots.insert(original_shard_id, Slot::Ready(*shard));
            }
            Err(_) => {
                let stale = matches!(
                    slots.get(&original_shard_id),
                    Some(Slot::InFlight { generation: current, .. }) if *current == generation
                );
                if stale {
                    slots.remove(&original_shard_id);
                }
            }
        }
    }
}
