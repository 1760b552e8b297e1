//! Per-write routing between the original shard and its temporary
//! replacement.
//!
//! Routing is read-only with respect to failure records, with one
//! exception: when a creation this router triggered completes, it persists
//! the temporary shard's identity into the record (write-once) before
//! draining the buffer, since that identity is the durable handle the
//! reconciler and cleanup daemon work from.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::buffer::{WriteBuffer, WriteError};
use crate::cluster::{ShardWriter, WriteRequest};
use crate::creator::{CreationError, TempShardCreator, TemporaryShard};
use crate::detector::FailureDetector;
use crate::repository::{FailureRepository, RepositoryError};
use crate::ShardId;

/// Where one write goes.
#[derive(Debug)]
pub enum RouteDecision {
    /// Target shard is healthy; send to it as usual.
    Original { shard_id: ShardId },
    /// Target shard is failed and its replacement exists; send there.
    Temporary { shard: TemporaryShard },
    /// Replacement still being created; the write is buffered and the
    /// channel resolves with its terminal outcome.
    Buffered {
        ack: oneshot::Receiver<Result<(), WriteError>>,
    },
}

pub struct WriteRouter {
    detector: Arc<FailureDetector>,
    creator: Arc<TempShardCreator>,
    buffer: Arc<WriteBuffer>,
    repository: Arc<dyn FailureRepository>,
    writer: Arc<dyn ShardWriter>,
    /// Shards with a creation-completion hook already armed.
    hooks: Mutex<HashSet<ShardId>>,
}

impl WriteRouter {
    pub fn new(
        detector: Arc<FailureDetector>,
        creator: Arc<TempShardCreator>,
        buffer: Arc<WriteBuffer>,
        repository: Arc<dyn FailureRepository>,
        writer: Arc<dyn ShardWriter>,
    ) -> Self {
        Self {
            detector,
            creator,
            buffer,
            repository,
            writer,
            hooks: Mutex::new(HashSet::new()),
        }
    }

    /// Route one write. Never blocks on shard creation: a write for a failed
    /// shard whose replacement is pending is buffered, and creation runs in
    /// the background.
    pub async fn route(self: &Arc<Self>, write: WriteRequest) -> Result<RouteDecision, RepositoryError> {
        let shard_id = write.shard_id;
        if !self.detector.is_shard_failed(shard_id).await? {
            return Ok(RouteDecision::Original { shard_id });
        }

        if let Some(shard) = self.creator.ready(shard_id) {
            if self.buffer.pending(shard_id) > 0 {
                // A write parked after the creation hook's final drain pass
                // would otherwise wait out its timeout; deliver it before
                // routing new traffic around it.
                let router = Arc::clone(self);
                tokio::spawn(async move {
                    router
                        .buffer
                        .drain(shard_id, &shard, router.writer.as_ref())
                        .await;
                });
            }
            return Ok(RouteDecision::Temporary { shard });
        }

        let ack = self.buffer.enqueue(write);
        self.arm_creation_hook(shard_id);
        Ok(RouteDecision::Buffered { ack })
    }

    /// Kick off creation for a shard (once) and, on completion, persist the
    /// temp identity and drain the buffer; on failure, fail the buffered
    /// writes fast.
    fn arm_creation_hook(self: &Arc<Self>, shard_id: ShardId) {
        {
            let mut hooks = self
                .hooks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !hooks.insert(shard_id) {
                return;
            }
        }

        let router = Arc::clone(self);
        tokio::spawn(async move {
            let created = router.creator.create_if_absent(shard_id).await;
            match &created {
                Ok(shard) => {
                    if let Err(err) = router.record_temp_identity(shard).await {
                        tracing::warn!(
                            shard_id,
                            temp_shard_id = shard.temp_shard_id,
                            error = ?err,
                            "failed to persist temporary shard identity"
                        );
                    }
                    router
                        .buffer
                        .drain(shard_id, shard, router.writer.as_ref())
                        .await;
                }
                Err(err) => {
                    router.fail_buffered(shard_id, err.clone());
                }
            }
            {
                let mut hooks = router
                    .hooks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                hooks.remove(&shard_id);
            }
            // A route that raced this hook may have enqueued after the final
            // drain pass but before the hook entry was removed; its write
            // would never see another hook, so settle it here.
            if router.buffer.pending(shard_id) > 0 {
                match created {
                    Ok(shard) => {
                        router
                            .buffer
                            .drain(shard_id, &shard, router.writer.as_ref())
                            .await;
                    }
                    Err(err) => router.fail_buffered(shard_id, err),
                }
            }
        });
    }

    async fn record_temp_identity(&self, shard: &TemporaryShard) -> Result<(), RepositoryError> {
        let Some(mut record) = self
            .repository
            .find_by_shard(shard.original_shard_id)
            .await?
        else {
            return Ok(());
        };
        if record.temp_shard_id.is_some() {
            return Ok(());
        }
        record.set_temp_shard(shard);
        self.repository.save(record).await
    }

    fn fail_buffered(&self, shard_id: ShardId, err: CreationError) {
        tracing::warn!(
            shard_id,
            error = %err,
            "temporary shard creation failed, rejecting buffered writes"
        );
        self.buffer
            .fail_pending(shard_id, &WriteError::Rejected(err.to_string()));
    }
}
