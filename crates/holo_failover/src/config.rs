//! Runtime configuration for the failover control loop.

use std::time::Duration;

/// Tuning knobs for the failover daemons and the write buffer.
///
/// Each daemon runs on its own cadence; a cycle never overlaps its own next
/// cycle, but cycles of different daemons interleave freely.
#[derive(Clone, Copy, Debug)]
pub struct FailoverConfig {
    /// Liveness polling interval for the failure detector.
    pub detector_interval: Duration,
    /// Scan interval for the merge reconciler.
    pub reconciler_interval: Duration,
    /// Scan interval for temporary-shard cleanup. Coarser than the
    /// reconciler's, cleanup is not urgent.
    pub cleanup_interval: Duration,
    /// Minimum age of a merged temporary shard before physical removal.
    pub temp_shard_retention: Duration,
    /// How long a write may wait in the buffer for its temporary shard
    /// before it is failed back to the originator.
    pub write_buffer_timeout: Duration,
    /// Maximum concurrent per-shard merge tasks.
    pub merge_workers: usize,
    /// Maximum concurrent per-node cleanup batches.
    pub cleanup_workers: usize,
    /// Wall-clock budget for one reconciler cycle. Tasks still running when
    /// the budget expires are abandoned and skipped until they finish.
    pub reconciler_cycle_budget: Duration,
    /// Wall-clock budget for one cleanup cycle.
    pub cleanup_cycle_budget: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            detector_interval: Duration::from_secs(5),
            reconciler_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(300),
            temp_shard_retention: Duration::from_secs(3_600),
            write_buffer_timeout: Duration::from_secs(5),
            merge_workers: 4,
            cleanup_workers: 4,
            reconciler_cycle_budget: Duration::from_secs(60),
            cleanup_cycle_budget: Duration::from_secs(60),
        }
    }
}
