//! Lock-free counters for the failover control loop.
//!
//! Updated on the write/query hot paths, so everything is a relaxed atomic.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters and gauges exposed to the host process.
#[derive(Debug, Default)]
pub struct FailoverMetrics {
    /// Temporary shards provisioned.
    temp_shard_creations: AtomicU64,
    /// Temporary-shard provisioning failures.
    temp_shard_creation_failures: AtomicU64,
    /// Writes parked in the buffer while a temporary shard was pending.
    buffered_writes: AtomicU64,
    /// Buffered writes failed by timeout before drain.
    buffered_write_timeouts: AtomicU64,
    /// Buffered writes successfully replayed into a temporary shard.
    drained_writes: AtomicU64,
    /// Buffered writes whose replay against the temporary shard failed.
    drain_replay_failures: AtomicU64,
    /// Merge-back reconciliations that completed and recovered a shard.
    merges_completed: AtomicU64,
    /// Merge attempts that failed or did not validate.
    merges_failed: AtomicU64,
    /// Temporary shards physically removed.
    cleanups_succeeded: AtomicU64,
    /// Per-shard cleanup attempts that failed and will be retried.
    cleanups_failed: AtomicU64,
    /// Records still owing a cleanup, refreshed each cleanup cycle.
    pending_cleanups: AtomicU64,
    /// Completed detection cycles.
    detector_cycles: AtomicU64,
    /// Queries answered from a pruned, incomplete shard set.
    degraded_queries: AtomicU64,
    /// Queries rejected because every required shard was unavailable.
    rejected_queries: AtomicU64,
}

/// Point-in-time copy of [`FailoverMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FailoverMetricsSnapshot {
    pub temp_shard_creations: u64,
    pub temp_shard_creation_failures: u64,
    pub buffered_writes: u64,
    pub buffered_write_timeouts: u64,
    pub drained_writes: u64,
    pub drain_replay_failures: u64,
    pub merges_completed: u64,
    pub merges_failed: u64,
    pub cleanups_succeeded: u64,
    pub cleanups_failed: u64,
    pub pending_cleanups: u64,
    pub detector_cycles: u64,
    pub degraded_queries: u64,
    pub rejected_queries: u64,
}

impl FailoverMetrics {
    pub fn record_temp_shard_created(&self) {
        self.temp_shard_creations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_temp_shard_creation_failure(&self) {
        self.temp_shard_creation_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffered_write(&self) {
        self.buffered_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffered_write_timeout(&self) {
        self.buffered_write_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drained_write(&self) {
        self.drained_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drain_replay_failure(&self) {
        self.drain_replay_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge_completed(&self) {
        self.merges_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge_failed(&self) {
        self.merges_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cleanup_succeeded(&self) {
        self.cleanups_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cleanup_failed(&self) {
        self.cleanups_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending_cleanups(&self, pending: u64) {
        self.pending_cleanups.store(pending, Ordering::Relaxed);
    }

    pub fn record_detector_cycle(&self) {
        self.detector_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded_query(&self) {
        self.degraded_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_query(&self) {
        self.rejected_queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Captures a point-in-time copy of all counters.
    pub fn snapshot(&self) -> FailoverMetricsSnapshot {
        FailoverMetricsSnapshot {
            temp_shard_creations: self.temp_shard_creations.load(Ordering::Relaxed),
            temp_shard_creation_failures: self
                .temp_shard_creation_failures
                .load(Ordering::Relaxed),
            buffered_writes: self.buffered_writes.load(Ordering::Relaxed),
            buffered_write_timeouts: self.buffered_write_timeouts.load(Ordering::Relaxed),
            drained_writes: self.drained_writes.load(Ordering::Relaxed),
            drain_replay_failures: self.drain_replay_failures.load(Ordering::Relaxed),
            merges_completed: self.merges_completed.load(Ordering::Relaxed),
            merges_failed: self.merges_failed.load(Ordering::Relaxed),
            cleanups_succeeded: self.cleanups_succeeded.load(Ordering::Relaxed),
            cleanups_failed: self.cleanups_failed.load(Ordering::Relaxed),
            pending_cleanups: self.pending_cleanups.load(Ordering::Relaxed),
            detector_cycles: self.detector_cycles.load(Ordering::Relaxed),
            degraded_queries: self.degraded_queries.load(Ordering::Relaxed),
            rejected_queries: self.rejected_queries.load(Ordering::Relaxed),
        }
    }

    /// Renders metrics in a plain-text format suitable for a `/metrics`
    /// endpoint in the host process.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        format!(
            "failover_temp_shard_creations={}\nfailover_temp_shard_creation_failures={}\nfailover_buffered_writes={}\nfailover_buffered_write_timeouts={}\nfailover_drained_writes={}\nfailover_drain_replay_failures={}\nfailover_merges_completed={}\nfailover_merges_failed={}\nfailover_cleanups_succeeded={}\nfailover_cleanups_failed={}\nfailover_pending_cleanups={}\nfailover_detector_cycles={}\nfailover_degraded_queries={}\nfailover_rejected_queries={}\n",
            s.temp_shard_creations,
            s.temp_shard_creation_failures,
            s.buffered_writes,
            s.buffered_write_timeouts,
            s.drained_writes,
            s.drain_replay_failures,
            s.merges_completed,
            s.merges_failed,
            s.cleanups_succeeded,
            s.cleanups_failed,
            s.pending_cleanups,
            s.detector_cycles,
            s.degraded_queries,
            s.rejected_queries,
        )
    }
}
