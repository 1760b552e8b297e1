//! Abstract contracts for the external collaborators the control loop
//! consumes: cluster membership, shard provisioning, version history, data
//! movement, merge validation, and the node RPC used for cleanup.
//!
//! Implementations are owned elsewhere (the storage layer, the catalog, the
//! transport); everything here is a trait so tests can run the full control
//! loop against in-process mocks.

use async_trait::async_trait;

use crate::{NodeId, PartitionId, ShardId, TableId, VersionId};

/// One storage node as reported by the liveness source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeDesc {
    pub node_id: NodeId,
    pub alive: bool,
}

/// Opaque batch of rows moved between shards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowBatch {
    pub rows: u64,
    pub payload: Vec<u8>,
}

/// One data version on a shard, as reported by the version history source.
/// Listings are ordered by ascending `version_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub version_id: VersionId,
    pub created_at_ms: u64,
}

/// Result of provisioning a replacement shard on a healthy node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProvisionedShard {
    pub temp_shard_id: ShardId,
    pub host_node_id: NodeId,
    pub temp_partition_id: PartitionId,
}

/// Per-shard outcome of a batched remove request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub temp_shard_id: ShardId,
    /// `None` means the shard was removed.
    pub error: Option<String>,
}

/// One write destined for a shard. The payload is opaque to the control
/// loop; only the routing identity matters here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
    pub shard_id: ShardId,
    pub table_id: TableId,
    pub batch: RowBatch,
}

/// Cluster membership and catalog lookups.
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeDesc>>;
    async fn shards_hosted_on(&self, node_id: NodeId) -> anyhow::Result<Vec<ShardId>>;
    async fn table_of(&self, shard_id: ShardId) -> anyhow::Result<TableId>;
    async fn partition_of(&self, shard_id: ShardId) -> anyhow::Result<PartitionId>;
}

/// Physically creates a replacement shard for a failed original.
///
/// The provisioner resolves the original shard's schema from the catalog
/// itself; callers only name the shard being replaced.
#[async_trait]
pub trait ShardProvisioner: Send + Sync {
    async fn provision_replacement(
        &self,
        original_shard_id: ShardId,
    ) -> anyhow::Result<ProvisionedShard>;
}

/// Ordered version listing for a shard.
#[async_trait]
pub trait VersionHistory: Send + Sync {
    async fn versions_of(&self, shard_id: ShardId) -> anyhow::Result<Vec<VersionInfo>>;
}

/// Reads one version's data from a shard and applies it to another.
#[async_trait]
pub trait DataTransfer: Send + Sync {
    async fn read_version(&self, shard_id: ShardId, version_id: VersionId)
        -> anyhow::Result<RowBatch>;
    async fn apply_version(
        &self,
        shard_id: ShardId,
        batch: RowBatch,
        version_id: VersionId,
    ) -> anyhow::Result<()>;
}

/// Post-merge consistency check between the original and temporary shard,
/// typically row counts or checksums.
#[async_trait]
pub trait MergeValidator: Send + Sync {
    async fn validate(
        &self,
        original_shard_id: ShardId,
        temp_shard_id: ShardId,
    ) -> anyhow::Result<bool>;
}

/// Applies a foreground write to a shard. Used to replay buffered writes
/// into a temporary shard once it exists.
#[async_trait]
pub trait ShardWriter: Send + Sync {
    async fn write(&self, shard_id: ShardId, request: &WriteRequest) -> anyhow::Result<()>;
}

/// Node RPC surface used by the cleanup daemon. A single call removes a
/// batch of temporary shards on one node and reports per-shard outcomes.
#[async_trait]
pub trait ShardRpc: Send + Sync {
    async fn remove_shards(
        &self,
        node_id: NodeId,
        temp_shard_ids: &[ShardId],
    ) -> anyhow::Result<Vec<RemoveOutcome>>;
}
