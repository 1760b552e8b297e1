//! Shared in-process mocks for the failover integration tests.
//!
//! Each mock implements one collaborator trait over plain locked state, so a
//! full control loop can run inside a single tokio test without a cluster.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use holo_failover::{
    ClusterMembership, Collaborators, DataTransfer, MergeValidator, NodeDesc, ProvisionedShard,
    RemoveOutcome, RowBatch, ShardProvisioner, ShardRpc, ShardWriter, VersionHistory, VersionInfo,
    WriteRequest,
};
use holo_failover::{NodeId, PartitionId, ShardId, TableId, VersionId};

pub const TABLE: TableId = 1;
pub const PARTITION: PartitionId = 100;

pub fn write_request(shard_id: ShardId, rows: u64) -> WriteRequest {
    WriteRequest {
        shard_id,
        table_id: TABLE,
        batch: RowBatch {
            rows,
            payload: rows.to_le_bytes().to_vec(),
        },
    }
}

/// Scriptable membership view: per-node liveness and shard placement.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<ClusterState>,
}

#[derive(Default)]
struct ClusterState {
    nodes: Vec<NodeDesc>,
    placement: HashMap<NodeId, Vec<ShardId>>,
    list_nodes_fails: bool,
    catalog_fails_for: Vec<ShardId>,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_node(&self, node_id: NodeId, alive: bool, shards: &[ShardId]) {
        let mut state = self.state.lock().unwrap();
        state.nodes.push(NodeDesc { node_id, alive });
        state.placement.insert(node_id, shards.to_vec());
    }

    pub fn set_alive(&self, node_id: NodeId, alive: bool) {
        let mut state = self.state.lock().unwrap();
        for node in &mut state.nodes {
            if node.node_id == node_id {
                node.alive = alive;
            }
        }
    }

    pub fn set_list_nodes_fails(&self, fails: bool) {
        self.state.lock().unwrap().list_nodes_fails = fails;
    }

    pub fn set_catalog_fails_for(&self, shards: &[ShardId]) {
        self.state.lock().unwrap().catalog_fails_for = shards.to_vec();
    }
}

#[async_trait]
impl ClusterMembership for MockCluster {
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeDesc>> {
        let state = self.state.lock().unwrap();
        if state.list_nodes_fails {
            anyhow::bail!("liveness source unavailable");
        }
        Ok(state.nodes.clone())
    }

    async fn shards_hosted_on(&self, node_id: NodeId) -> anyhow::Result<Vec<ShardId>> {
        let state = self.state.lock().unwrap();
        Ok(state.placement.get(&node_id).cloned().unwrap_or_default())
    }

    async fn table_of(&self, shard_id: ShardId) -> anyhow::Result<TableId> {
        if self.state.lock().unwrap().catalog_fails_for.contains(&shard_id) {
            anyhow::bail!("catalog lookup failed for shard {shard_id}");
        }
        Ok(TABLE)
    }

    async fn partition_of(&self, shard_id: ShardId) -> anyhow::Result<PartitionId> {
        if self.state.lock().unwrap().catalog_fails_for.contains(&shard_id) {
            anyhow::bail!("catalog lookup failed for shard {shard_id}");
        }
        Ok(PARTITION)
    }
}

/// Provisioner that counts physical calls, can fail the first N attempts,
/// and can stall to widen race windows.
pub struct MockProvisioner {
    pub calls: AtomicUsize,
    fail_times: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    next_id: AtomicU64,
    host_node_id: NodeId,
}

impl MockProvisioner {
    pub fn new(host_node_id: NodeId) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_times: AtomicUsize::new(0),
            delay: Mutex::new(None),
            next_id: AtomicU64::new(90_000),
            host_node_id,
        })
    }

    pub fn fail_next(&self, times: usize) {
        self.fail_times.store(times, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShardProvisioner for MockProvisioner {
    async fn provision_replacement(
        &self,
        _original_shard_id: ShardId,
    ) -> anyhow::Result<ProvisionedShard> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("no healthy node with capacity");
        }
        Ok(ProvisionedShard {
            temp_shard_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            host_node_id: self.host_node_id,
            temp_partition_id: PARTITION + 800,
        })
    }
}

#[derive(Default)]
pub struct MockVersionHistory {
    versions: Mutex<HashMap<ShardId, Vec<VersionInfo>>>,
}

impl MockVersionHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_versions(&self, shard_id: ShardId, versions: &[(VersionId, u64)]) {
        let versions = versions
            .iter()
            .map(|&(version_id, created_at_ms)| VersionInfo {
                version_id,
                created_at_ms,
            })
            .collect();
        self.versions.lock().unwrap().insert(shard_id, versions);
    }
}

#[async_trait]
impl VersionHistory for MockVersionHistory {
    async fn versions_of(&self, shard_id: ShardId) -> anyhow::Result<Vec<VersionInfo>> {
        Ok(self
            .versions
            .lock()
            .unwrap()
            .get(&shard_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Records applied `(destination shard, version)` pairs in order.
#[derive(Default)]
pub struct MockTransfer {
    pub applied: Mutex<Vec<(ShardId, VersionId)>>,
    fail_apply_version: Mutex<Option<VersionId>>,
}

impl MockTransfer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_apply_of(&self, version_id: VersionId) {
        *self.fail_apply_version.lock().unwrap() = Some(version_id);
    }

    pub fn applied(&self) -> Vec<(ShardId, VersionId)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataTransfer for MockTransfer {
    async fn read_version(
        &self,
        _shard_id: ShardId,
        version_id: VersionId,
    ) -> anyhow::Result<RowBatch> {
        Ok(RowBatch {
            rows: version_id,
            payload: version_id.to_le_bytes().to_vec(),
        })
    }

    async fn apply_version(
        &self,
        shard_id: ShardId,
        _batch: RowBatch,
        version_id: VersionId,
    ) -> anyhow::Result<()> {
        if *self.fail_apply_version.lock().unwrap() == Some(version_id) {
            anyhow::bail!("apply of version {version_id} rejected");
        }
        self.applied.lock().unwrap().push((shard_id, version_id));
        Ok(())
    }
}

pub struct MockValidator {
    valid: Mutex<bool>,
}

impl MockValidator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            valid: Mutex::new(true),
        })
    }

    pub fn set_valid(&self, valid: bool) {
        *self.valid.lock().unwrap() = valid;
    }
}

#[async_trait]
impl MergeValidator for MockValidator {
    async fn validate(
        &self,
        _original_shard_id: ShardId,
        _temp_shard_id: ShardId,
    ) -> anyhow::Result<bool> {
        Ok(*self.valid.lock().unwrap())
    }
}

/// Records writes per destination shard; individual row counts can be failed
/// to exercise per-request replay errors.
#[derive(Default)]
pub struct MockWriter {
    writes: Mutex<Vec<(ShardId, WriteRequest)>>,
    fail_rows: Mutex<Vec<u64>>,
}

impl MockWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes_with_rows(&self, rows: &[u64]) {
        *self.fail_rows.lock().unwrap() = rows.to_vec();
    }

    pub fn writes(&self) -> Vec<(ShardId, WriteRequest)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShardWriter for MockWriter {
    async fn write(&self, shard_id: ShardId, request: &WriteRequest) -> anyhow::Result<()> {
        if self.fail_rows.lock().unwrap().contains(&request.batch.rows) {
            anyhow::bail!("write rejected by shard {shard_id}");
        }
        self.writes
            .lock()
            .unwrap()
            .push((shard_id, request.clone()));
        Ok(())
    }
}

/// Scriptable remove RPC: per-shard errors and whole-node failures.
#[derive(Default)]
pub struct MockRpc {
    pub calls: Mutex<Vec<(NodeId, Vec<ShardId>)>>,
    shard_errors: Mutex<HashMap<ShardId, String>>,
    failing_nodes: Mutex<Vec<NodeId>>,
}

impl MockRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_shard(&self, temp_shard_id: ShardId, error: &str) {
        self.shard_errors
            .lock()
            .unwrap()
            .insert(temp_shard_id, error.to_string());
    }

    pub fn fail_node(&self, node_id: NodeId) {
        self.failing_nodes.lock().unwrap().push(node_id);
    }

    pub fn calls(&self) -> Vec<(NodeId, Vec<ShardId>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShardRpc for MockRpc {
    async fn remove_shards(
        &self,
        node_id: NodeId,
        temp_shard_ids: &[ShardId],
    ) -> anyhow::Result<Vec<RemoveOutcome>> {
        self.calls
            .lock()
            .unwrap()
            .push((node_id, temp_shard_ids.to_vec()));
        if self.failing_nodes.lock().unwrap().contains(&node_id) {
            anyhow::bail!("rpc transport error to node {node_id}");
        }
        let shard_errors = self.shard_errors.lock().unwrap();
        Ok(temp_shard_ids
            .iter()
            .map(|&temp_shard_id| RemoveOutcome {
                temp_shard_id,
                error: shard_errors.get(&temp_shard_id).cloned(),
            })
            .collect())
    }
}

/// One full set of mocks plus the `Collaborators` bundle built from them.
pub struct TestCluster {
    pub cluster: Arc<MockCluster>,
    pub provisioner: Arc<MockProvisioner>,
    pub versions: Arc<MockVersionHistory>,
    pub transfer: Arc<MockTransfer>,
    pub validator: Arc<MockValidator>,
    pub writer: Arc<MockWriter>,
    pub rpc: Arc<MockRpc>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            cluster: MockCluster::new(),
            provisioner: MockProvisioner::new(3),
            versions: MockVersionHistory::new(),
            transfer: MockTransfer::new(),
            validator: MockValidator::new(),
            writer: MockWriter::new(),
            rpc: MockRpc::new(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            membership: self.cluster.clone(),
            provisioner: self.provisioner.clone(),
            versions: self.versions.clone(),
            transfer: self.transfer.clone(),
            validator: self.validator.clone(),
            writer: self.writer.clone(),
            rpc: self.rpc.clone(),
        }
    }
}
