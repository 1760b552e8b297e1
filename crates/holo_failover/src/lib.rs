//! Partial-availability failover control plane for a sharded analytical store.
//!
//! When a storage node holding data shards becomes unreachable, this crate
//! keeps the affected tables writable and readable instead of failing whole
//! statements:
//!
//! - the [`detector::FailureDetector`] polls cluster liveness and tracks a
//!   [`record::FailureRecord`] per affected shard,
//! - the [`router::WriteRouter`] reroutes writes for failed shards to a
//!   temporary replacement shard, created exactly once per shard by the
//!   [`creator::TempShardCreator`] and fronted by the [`buffer::WriteBuffer`]
//!   while creation is in flight,
//! - the [`query::QueryFilter`] prunes failed shards out of scan shard sets,
//!   failing a query only when nothing is left to scan,
//! - once the original node returns, the [`reconciler::MergeReconciler`]
//!   applies the temporary shard's versions back onto the original in version
//!   order, and the [`cleanup::CleanupDaemon`] removes merged temporary
//!   shards after a retention window.
//!
//! The storage engine, query planner, wire protocol, and membership mechanics
//! are all external collaborators behind the traits in [`cluster`]. The
//! [`manager::FailoverManager`] wires the components together with explicit
//! dependency injection and owns the daemon lifecycles, so multiple isolated
//! instances can run inside one process.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod buffer;
pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod creator;
pub mod detector;
pub mod journal;
pub mod manager;
pub mod metrics;
pub mod query;
pub mod reconciler;
pub mod record;
pub mod repository;
pub mod router;

pub use buffer::{WriteBuffer, WriteError};
pub use cleanup::{CleanupDaemon, CleanupError};
pub use cluster::{
    ClusterMembership, DataTransfer, MergeValidator, NodeDesc, ProvisionedShard, RemoveOutcome,
    RowBatch, ShardProvisioner, ShardRpc, ShardWriter, VersionHistory, VersionInfo, WriteRequest,
};
pub use config::FailoverConfig;
pub use creator::{CreationError, TempShardCreator, TemporaryShard};
pub use detector::FailureDetector;
pub use manager::{Collaborators, FailoverManager};
pub use metrics::{FailoverMetrics, FailoverMetricsSnapshot};
pub use query::{PruneOutcome, QueryError, QueryFilter};
pub use reconciler::{MergeError, MergeOutcome, MergePlan, MergeReconciler, MergeStatus};
pub use record::{CleanupStatus, FailureRecord, ShardStatus};
pub use repository::{FailureRepository, InMemoryRepository, RepositoryError};
pub use router::{RouteDecision, WriteRouter};

/// Storage node identifier.
pub type NodeId = u64;
/// Shard (tablet) identifier.
pub type ShardId = u64;
/// Table identifier.
pub type TableId = u64;
/// Partition identifier.
pub type PartitionId = u64;
/// Data version identifier on a shard.
pub type VersionId = u64;

/// Wall-clock time in unix milliseconds, saturating on clock skew.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
