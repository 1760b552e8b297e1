//! Keyed store of failure records.
//!
//! The trait is the capability set any backend must satisfy; the in-memory
//! backend here journals every mutation so restarts rebuild the same state.
//! An external SQL backend would implement the same trait and use
//! [`crate::journal::NullJournal`] since it is self-durable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::journal::{FileJournal, Journal, NullJournal};
use crate::record::{CleanupStatus, FailureRecord, ShardStatus};
use crate::{unix_time_ms, ShardId};

/// Persistence failures. Never silently dropped: daemon cycles abort the
/// affected shard (or the whole cycle for repository-wide outages) and retry
/// on the next scheduled run.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("failure repository unavailable: {0}")]
    Unavailable(String),
    #[error("journal write failed: {0}")]
    Journal(#[source] anyhow::Error),
}

/// Durable keyed store of failure records. All operations are safe under
/// concurrent callers; `save` is last-writer-wins per shard id.
#[async_trait]
pub trait FailureRepository: Send + Sync {
    /// Upsert by `shard_id`.
    async fn save(&self, record: FailureRecord) -> Result<(), RepositoryError>;

    async fn find_by_shard(&self, shard_id: ShardId)
        -> Result<Option<FailureRecord>, RepositoryError>;

    /// List records by status; `None` lists everything.
    async fn list_by_status(
        &self,
        status: Option<ShardStatus>,
    ) -> Result<Vec<FailureRecord>, RepositoryError>;

    /// Recovered records with `recovered_at < cutoff_ms` that still owe a
    /// cleanup attempt (`NotCleaned` or `CleanupFailed`). Already-cleaned
    /// records are excluded so removal requests are not resubmitted forever.
    async fn list_recovered_before(
        &self,
        cutoff_ms: u64,
    ) -> Result<Vec<FailureRecord>, RepositoryError>;

    /// Flag a removal attempt as in progress.
    async fn mark_cleaning(&self, shard_id: ShardId) -> Result<(), RepositoryError>;

    async fn mark_cleaned(&self, shard_id: ShardId) -> Result<(), RepositoryError>;

    async fn mark_cleanup_failed(
        &self,
        shard_id: ShardId,
        error: &str,
    ) -> Result<(), RepositoryError>;

    async fn count_pending_cleanup(&self) -> Result<usize, RepositoryError>;

    /// Administrative removal of a record. The only way a record leaves the
    /// store; daemons never call this.
    async fn delete_by_shard(&self, shard_id: ShardId) -> Result<(), RepositoryError>;
}

/// In-memory backend with journal-backed durability.
pub struct InMemoryRepository {
    records: RwLock<HashMap<ShardId, FailureRecord>>,
    journal: Arc<dyn Journal>,
}

impl InMemoryRepository {
    /// Ephemeral repository with no durability; for tests and embedding.
    pub fn new() -> Self {
        Self::with_journal(Arc::new(NullJournal), Vec::new())
    }

    /// Open a journal file, replay it, and serve the rebuilt state.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let (journal, replayed) = FileJournal::open(path)?;
        Ok(Self::with_journal(Arc::new(journal), replayed))
    }

    /// Build from an explicit journal plus previously replayed mutations,
    /// applied last-writer-wins in order.
    pub fn with_journal(journal: Arc<dyn Journal>, replayed: Vec<FailureRecord>) -> Self {
        let mut records = HashMap::new();
        for mut record in replayed {
            // A record journaled mid-removal would never be rescanned, since
            // the cleanup scan skips `Cleaning`. The restart interrupted that
            // attempt, so surface it as a failed one and retry.
            if record.cleanup_status == CleanupStatus::Cleaning {
                record.cleanup_status = CleanupStatus::CleanupFailed;
                record
                    .cleanup_error
                    .get_or_insert_with(|| "removal interrupted by restart".to_string());
            }
            records.insert(record.shard_id, record);
        }
        Self {
            records: RwLock::new(records),
            journal,
        }
    }

    /// Journal first, then publish. A journal failure leaves the in-memory
    /// state untouched so readers never see an unpersisted mutation.
    fn commit(&self, record: FailureRecord) -> Result<(), RepositoryError> {
        self.journal
            .append(&record)
            .map_err(RepositoryError::Journal)?;
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.insert(record.shard_id, record);
        Ok(())
    }

    fn update_cleanup<F>(&self, shard_id: ShardId, apply: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut FailureRecord),
    {
        let current = {
            let records = self
                .records
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            records.get(&shard_id).cloned()
        };
        let Some(mut record) = current else {
            return Ok(());
        };
        apply(&mut record);
        self.commit(record)
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FailureRepository for InMemoryRepository {
    async fn save(&self, record: FailureRecord) -> Result<(), RepositoryError> {
        self.commit(record)
    }

    async fn find_by_shard(
        &self,
        shard_id: ShardId,
    ) -> Result<Option<FailureRecord>, RepositoryError> {
        let records = self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(records.get(&shard_id).cloned())
    }

    async fn list_by_status(
        &self,
        status: Option<ShardStatus>,
    ) -> Result<Vec<FailureRecord>, RepositoryError> {
        let records = self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(records
            .values()
            .filter(|record| status.is_none_or(|wanted| record.status == wanted))
            .cloned()
            .collect())
    }

    async fn list_recovered_before(
        &self,
        cutoff_ms: u64,
    ) -> Result<Vec<FailureRecord>, RepositoryError> {
        let records = self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(records
            .values()
            .filter(|record| {
                record.cleanup_pending()
                    && record.recovered_at.is_some_and(|at| at < cutoff_ms)
            })
            .cloned()
            .collect())
    }

    async fn mark_cleaning(&self, shard_id: ShardId) -> Result<(), RepositoryError> {
        self.update_cleanup(shard_id, |record| {
            record.cleanup_status = CleanupStatus::Cleaning;
        })
    }

    async fn mark_cleaned(&self, shard_id: ShardId) -> Result<(), RepositoryError> {
        self.update_cleanup(shard_id, |record| {
            record.cleanup_status = CleanupStatus::Cleaned;
            record.cleanup_at = Some(unix_time_ms());
            record.cleanup_error = None;
        })
    }

    async fn mark_cleanup_failed(
        &self,
        shard_id: ShardId,
        error: &str,
    ) -> Result<(), RepositoryError> {
        self.update_cleanup(shard_id, |record| {
            record.cleanup_status = CleanupStatus::CleanupFailed;
            record.cleanup_error = Some(error.to_string());
        })
    }

    async fn count_pending_cleanup(&self) -> Result<usize, RepositoryError> {
        let records = self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(records
            .values()
            .filter(|record| record.cleanup_pending())
            .count())
    }

    async fn delete_by_shard(&self, shard_id: ShardId) -> Result<(), RepositoryError> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.remove(&shard_id);
        Ok(())
    }
}
