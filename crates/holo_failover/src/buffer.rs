//! Per-shard buffering of writes whose temporary shard is still being
//! created.
//!
//! Delivery is at-most-once per request: a request whose timeout fires
//! before drain reaches it is removed from its queue, failed back to the
//! originator, and never replayed afterward. Drains for a shard are
//! serialized, and a drain keeps taking whatever enqueues raced in until the
//! queue is observed empty, so per-shard order is preserved.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::cluster::{ShardWriter, WriteRequest};
use crate::creator::TemporaryShard;
use crate::metrics::FailoverMetrics;
use crate::ShardId;

/// Terminal outcome of a buffered write, reported to its originator.
#[derive(Clone, Debug, thiserror::Error)]
pub enum WriteError {
    /// The write waited longer than the buffer timeout for its temporary
    /// shard. Not retried internally.
    #[error("buffered write timed out after {0:?}")]
    Timeout(Duration),
    /// Temporary-shard creation failed; the write fails fast and the client
    /// may retry.
    #[error("temporary shard unavailable: {0}")]
    Rejected(String),
    /// Replay against the temporary shard failed. Reported per request;
    /// surviving requests in the same drain still get applied.
    #[error("replay to temporary shard {temp_shard_id} failed: {message}")]
    Replay {
        temp_shard_id: ShardId,
        message: String,
    },
}

struct BufferedWrite {
    seq: u64,
    write: WriteRequest,
    deadline: Instant,
    ack: oneshot::Sender<Result<(), WriteError>>,
}

#[derive(Default)]
struct ShardQueue {
    queue: VecDeque<BufferedWrite>,
    /// Serializes drains for this shard.
    drain_lock: Arc<tokio::sync::Mutex<()>>,
}

pub struct WriteBuffer {
    timeout: Duration,
    shards: Mutex<HashMap<ShardId, ShardQueue>>,
    sequence: AtomicU64,
    metrics: Arc<FailoverMetrics>,
}

impl WriteBuffer {
    pub fn new(timeout: Duration, metrics: Arc<FailoverMetrics>) -> Self {
        Self {
            timeout,
            shards: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            metrics,
        }
    }

    /// Append a write to its shard's queue and arm its timeout. The returned
    /// channel resolves once the write is replayed, times out, or is
    /// rejected.
    pub fn enqueue(self: &Arc<Self>, write: WriteRequest) -> oneshot::Receiver<Result<(), WriteError>> {
        let (tx, rx) = oneshot::channel();
        let shard_id = write.shard_id;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.timeout;

        {
            let mut shards = self
                .shards
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            shards.entry(shard_id).or_default().queue.push_back(BufferedWrite {
                seq,
                write,
                deadline,
                ack: tx,
            });
        }
        self.metrics.record_buffered_write();

        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            buffer.expire(shard_id, seq);
        });

        rx
    }

    /// Queued request count for a shard.
    pub fn pending(&self, shard_id: ShardId) -> usize {
        let shards = self
            .shards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        shards.get(&shard_id).map_or(0, |shard| shard.queue.len())
    }

    /// Replay the shard's queued requests, in enqueue order, against the
    /// temporary shard. Replay failures are reported per request so the rest
    /// of the queue still gets applied.
    pub async fn drain(&self, shard_id: ShardId, temp: &TemporaryShard, writer: &dyn ShardWriter) {
        let drain_lock = {
            let mut shards = self
                .shards
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            shards.entry(shard_id).or_default().drain_lock.clone()
        };
        let _guard = drain_lock.lock().await;

        loop {
            let batch: Vec<BufferedWrite> = {
                let mut shards = self
                    .shards
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match shards.get_mut(&shard_id) {
                    Some(shard) => shard.queue.drain(..).collect(),
                    None => Vec::new(),
                }
            };
            if batch.is_empty() {
                break;
            }

            for buffered in batch {
                if Instant::now() >= buffered.deadline {
                    // Expired while waiting for this drain; the timeout owns it.
                    self.metrics.record_buffered_write_timeout();
                    let _ = buffered.ack.send(Err(WriteError::Timeout(self.timeout)));
                    continue;
                }
                match writer.write(temp.temp_shard_id, &buffered.write).await {
                    Ok(()) => {
                        self.metrics.record_drained_write();
                        let _ = buffered.ack.send(Ok(()));
                    }
                    Err(err) => {
                        self.metrics.record_drain_replay_failure();
                        tracing::warn!(
                            shard_id,
                            temp_shard_id = temp.temp_shard_id,
                            error = ?err,
                            "buffered write replay failed"
                        );
                        let _ = buffered.ack.send(Err(WriteError::Replay {
                            temp_shard_id: temp.temp_shard_id,
                            message: format!("{err:#}"),
                        }));
                    }
                }
            }
        }
    }

    /// Fail every queued request for a shard, e.g. after creation failed.
    pub fn fail_pending(&self, shard_id: ShardId, error: &WriteError) {
        let drained: Vec<BufferedWrite> = {
            let mut shards = self
                .shards
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match shards.get_mut(&shard_id) {
                Some(shard) => shard.queue.drain(..).collect(),
                None => Vec::new(),
            }
        };
        for buffered in drained {
            let _ = buffered.ack.send(Err(error.clone()));
        }
    }

    /// Timeout handler for one request. A request already taken by a drain
    /// (or already expired) is gone from the queue, so this is a no-op then;
    /// late success after timeout is explicitly disallowed, never the
    /// reverse.
    fn expire(&self, shard_id: ShardId, seq: u64) {
        let expired = {
            let mut shards = self
                .shards
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            shards.get_mut(&shard_id).and_then(|shard| {
                shard
                    .queue
                    .iter()
                    .position(|buffered| buffered.seq == seq)
                    .and_then(|pos| shard.queue.remove(pos))
            })
        };
        if let Some(buffered) = expired {
            self.metrics.record_buffered_write_timeout();
            tracing::warn!(shard_id, "buffered write timed out before drain");
            let _ = buffered.ack.send(Err(WriteError::Timeout(self.timeout)));
        }
    }
}
