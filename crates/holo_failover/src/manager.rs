//! Top-level wiring and daemon lifecycle.
//!
//! [`FailoverManager`] owns one instance of every failover component, built
//! from a [`FailoverConfig`], a repository, and the cluster collaborators.
//! Components share one metrics registry and the manager owns the shutdown
//! channel for the three background daemons, so multiple isolated managers
//! can coexist in one process (distinct tests, embedded deployments).

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::buffer::WriteBuffer;
use crate::cleanup::{self, CleanupDaemon};
use crate::cluster::{
    ClusterMembership, DataTransfer, MergeValidator, ShardProvisioner, ShardRpc, ShardWriter,
    VersionHistory,
};
use crate::config::FailoverConfig;
use crate::creator::TempShardCreator;
use crate::detector::{self, FailureDetector};
use crate::metrics::FailoverMetrics;
use crate::query::QueryFilter;
use crate::reconciler::{self, MergeReconciler};
use crate::repository::FailureRepository;
use crate::router::WriteRouter;

/// External cluster services the failover plane runs against.
pub struct Collaborators {
    pub membership: Arc<dyn ClusterMembership>,
    pub provisioner: Arc<dyn ShardProvisioner>,
    pub versions: Arc<dyn VersionHistory>,
    pub transfer: Arc<dyn DataTransfer>,
    pub validator: Arc<dyn MergeValidator>,
    pub writer: Arc<dyn ShardWriter>,
    pub rpc: Arc<dyn ShardRpc>,
}

pub struct FailoverManager {
    config: FailoverConfig,
    metrics: Arc<FailoverMetrics>,
    detector: Arc<FailureDetector>,
    creator: Arc<TempShardCreator>,
    buffer: Arc<WriteBuffer>,
    router: Arc<WriteRouter>,
    query_filter: Arc<QueryFilter>,
    reconciler: Arc<MergeReconciler>,
    cleanup: Arc<CleanupDaemon>,
    shutdown: watch::Sender<bool>,
    daemons: Mutex<Vec<JoinHandle<()>>>,
}

impl FailoverManager {
    pub fn new(
        config: FailoverConfig,
        repository: Arc<dyn FailureRepository>,
        collaborators: Collaborators,
    ) -> Self {
        let metrics = Arc::new(FailoverMetrics::default());

        let detector = Arc::new(FailureDetector::new(
            repository.clone(),
            collaborators.membership.clone(),
            metrics.clone(),
        ));
        let creator = Arc::new(TempShardCreator::new(
            collaborators.provisioner,
            metrics.clone(),
        ));
        let buffer = Arc::new(WriteBuffer::new(config.write_buffer_timeout, metrics.clone()));
        let router = Arc::new(WriteRouter::new(
            detector.clone(),
            creator.clone(),
            buffer.clone(),
            repository.clone(),
            collaborators.writer,
        ));
        let query_filter = Arc::new(QueryFilter::new(detector.clone(), metrics.clone()));
        let reconciler = Arc::new(MergeReconciler::new(
            repository.clone(),
            collaborators.versions,
            collaborators.transfer,
            collaborators.validator,
            metrics.clone(),
            config.merge_workers,
            config.reconciler_cycle_budget,
        ));
        let cleanup = Arc::new(CleanupDaemon::new(
            repository,
            collaborators.membership,
            collaborators.rpc,
            creator.clone(),
            metrics.clone(),
            config.temp_shard_retention,
            config.cleanup_workers,
            config.cleanup_cycle_budget,
        ));

        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            metrics,
            detector,
            creator,
            buffer,
            router,
            query_filter,
            reconciler,
            cleanup,
            shutdown,
            daemons: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the detector, reconciler, and cleanup loops. Call once per
    /// manager; a second call would spawn a duplicate set of loops.
    pub fn start(&self) {
        let handles = vec![
            detector::spawn(
                self.detector.clone(),
                self.config.detector_interval,
                self.shutdown.subscribe(),
            ),
            reconciler::spawn(
                self.reconciler.clone(),
                self.config.reconciler_interval,
                self.shutdown.subscribe(),
            ),
            cleanup::spawn(
                self.cleanup.clone(),
                self.config.cleanup_interval,
                self.shutdown.subscribe(),
            ),
        ];
        let mut daemons = self
            .daemons
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        daemons.extend(handles);
    }

    /// Signal shutdown and wait for the daemon loops to exit. In-flight merge
    /// and cleanup tasks spawned by the last cycle are left to finish on
    /// their own.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut daemons = self
                .daemons
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            daemons.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<FailoverMetrics> {
        &self.metrics
    }

    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }

    pub fn creator(&self) -> &Arc<TempShardCreator> {
        &self.creator
    }

    pub fn buffer(&self) -> &Arc<WriteBuffer> {
        &self.buffer
    }

    pub fn router(&self) -> &Arc<WriteRouter> {
        &self.router
    }

    pub fn query_filter(&self) -> &Arc<QueryFilter> {
        &self.query_filter
    }

    pub fn reconciler(&self) -> &Arc<MergeReconciler> {
        &self.reconciler
    }

    pub fn cleanup(&self) -> &Arc<CleanupDaemon> {
        &self.cleanup
    }
}
