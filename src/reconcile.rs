//! Brings the metadata store back in line with what the storage location holds.
//!
//! The storage location is the source of truth: every stored file gets a
//! record, records of files that are gone are dropped, and creation dates are
//! taken from the filesystem. Each file is handled under its name lease so a
//! pass never races an in-flight upload or delete of the same file.

use std::collections::HashSet;
use std::future::Future;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::checksum::{self, Checksum};
use crate::coordination::{
    name_lock_key, LeaseGuard, LockError, LockManager, VersionCounter, RECONCILE_LOCK_KEY,
};
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::storage::models::{FileFilter, FilePatch, FileRecord};
use crate::storage::{DatabaseError, MetadataStore};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("A reconciliation pass is already running")]
    InProgress,
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
    #[error("Storage error: {0}")]
    Storage(#[from] ObjectStoreError),
    #[error("Metadata store error: {0}")]
    Metadata(#[from] DatabaseError),
    #[error("Timed out during {0}")]
    Timeout(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub inserted: u64,
    /// Records whose creation date changed
    pub updated: u64,
    pub deleted: u64,
    /// Files left for the next pass because their lease was busy, their
    /// bytes could not be read, or a call on them timed out
    pub skipped: u64,
    /// Leftovers of interrupted writes removed from the storage location
    pub partial_writes_removed: u64,
}

pub struct Reconciler {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    locks: LockManager,
    versions: VersionCounter,
    pass_lock_ttl: Duration,
}

impl Reconciler {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        locks: LockManager,
        versions: VersionCounter,
        pass_lock_ttl: Duration,
    ) -> Self {
        Self {
            metadata,
            objects,
            locks,
            versions,
            pass_lock_ttl,
        }
    }

    /// Run one full pass. Only one pass runs at a time across all processes
    /// sharing the lock service.
    pub async fn reconcile(&self) -> Result<ReconciliationReport, ReconcileError> {
        let coarse = match self
            .locks
            .acquire(RECONCILE_LOCK_KEY, self.pass_lock_ttl)
            .await
        {
            Ok(guard) => guard,
            Err(LockError::Unavailable { .. }) => return Err(ReconcileError::InProgress),
            Err(e) => return Err(e.into()),
        };

        let result = self.run_pass().await;
        release(coarse).await;
        result
    }

    /// Run a pass and log its outcome instead of returning errors.
    pub async fn reconcile_logged(&self) -> Option<ReconciliationReport> {
        match self.reconcile().await {
            Ok(report) => {
                info!(
                    inserted = report.inserted,
                    updated = report.updated,
                    deleted = report.deleted,
                    skipped = report.skipped,
                    partial_writes_removed = report.partial_writes_removed,
                    "Reconciliation finished"
                );
                Some(report)
            }
            Err(ReconcileError::InProgress) => {
                info!("Reconciliation already running elsewhere, skipping");
                None
            }
            Err(e) => {
                error!(error = %e, "Reconciliation failed, will retry on the next pass");
                None
            }
        }
    }

    /// Reconcile every `every`, starting one interval from now.
    pub fn spawn_periodic(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; the startup pass covers it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.reconcile_logged().await;
            }
        })
    }

    async fn run_pass(&self) -> Result<ReconciliationReport, ReconcileError> {
        let mut report = ReconciliationReport::default();

        // A staged write older than a file lease has no live writer left
        match self
            .bounded(
                "partial write cleanup",
                self.objects.clean_partial_writes(self.locks.settings().ttl),
            )
            .await
        {
            Ok(removed) => report.partial_writes_removed = removed,
            Err(e) => warn!(error = %e, "Could not clean up partial writes"),
        }

        let names = self
            .bounded("storage listing", self.objects.list())
            .await?;
        for name in &names {
            match self.sync_file(name, &mut report).await {
                Ok(()) => {}
                Err(ReconcileError::Lock(LockError::Unavailable { .. })) => {
                    debug!(file_name = %name, "File busy, leaving it for the next pass");
                    report.skipped += 1;
                }
                Err(ReconcileError::Storage(e)) => {
                    warn!(file_name = %name, error = %e, "Could not read stored file");
                    report.skipped += 1;
                }
                Err(ReconcileError::Timeout(what)) => {
                    warn!(file_name = %name, %what, "Timed out on stored file, leaving it for the next pass");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let present: HashSet<&str> = names.iter().map(String::as_str).collect();
        let records = self
            .bounded("metadata scan", self.metadata.find_all())
            .await?;
        for record in records
            .iter()
            .filter(|r| !present.contains(r.file_name.as_str()))
        {
            match self.prune_orphan(record).await {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(ReconcileError::Lock(LockError::Unavailable { .. })) => {
                    debug!(file_id = %record.file_id, "Record busy, leaving it for the next pass");
                    report.skipped += 1;
                }
                Err(ReconcileError::Storage(e)) => {
                    warn!(file_id = %record.file_id, error = %e, "Could not check stored file");
                    report.skipped += 1;
                }
                Err(ReconcileError::Timeout(what)) => {
                    warn!(file_id = %record.file_id, %what, "Timed out on record, leaving it for the next pass");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    async fn sync_file(
        &self,
        file_name: &str,
        report: &mut ReconciliationReport,
    ) -> Result<(), ReconcileError> {
        let guard = self
            .locks
            .acquire(&name_lock_key(file_name), self.locks.settings().ttl)
            .await?;
        let result = self.sync_file_locked(file_name, report).await;
        release(guard).await;
        result
    }

    async fn sync_file_locked(
        &self,
        file_name: &str,
        report: &mut ReconciliationReport,
    ) -> Result<(), ReconcileError> {
        let meta = match self
            .bounded("storage stat", self.objects.stat(file_name))
            .await
        {
            Ok(meta) => meta,
            Err(ReconcileError::Storage(ObjectStoreError::NotFound(_))) => {
                debug!(file_name, "File removed since listing");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let checksum = self.digest_stored(file_name).await?;

        let identity = FileFilter::identity(file_name, checksum.as_str());
        match self
            .bounded("metadata lookup", self.metadata.find_one(&identity))
            .await?
        {
            None => {
                let record = FileRecord::new(file_name, checksum.as_str(), meta.created_at);
                self.bounded("metadata insert", self.metadata.insert(&record))
                    .await?;
                self.versions.bump(&record.file_id).await;
                report.inserted += 1;
                info!(file_id = %record.file_id, file_name, "Recorded untracked file");
            }
            Some(existing) if existing.creation_date != meta.created_at => {
                self.bounded(
                    "metadata update",
                    self.metadata.update(
                        &FileFilter::id(&existing.file_id),
                        &FilePatch::creation_date(meta.created_at),
                    ),
                )
                .await?;
                report.updated += 1;
                debug!(file_id = %existing.file_id, file_name, "Refreshed creation date");
            }
            Some(_) => {}
        }

        // Same name, other content: the bytes were replaced out of band
        let same_name = self
            .bounded("metadata lookup", self.metadata.find_by_name(file_name))
            .await?;
        for stale in same_name
            .iter()
            .filter(|r| r.checksum != checksum.as_str())
        {
            let deleted = self
                .bounded(
                    "metadata delete",
                    self.metadata.delete(&FileFilter::id(&stale.file_id)),
                )
                .await?;
            if deleted {
                self.versions.bump(&stale.file_id).await;
                report.deleted += 1;
                info!(file_id = %stale.file_id, file_name, "Dropped record of replaced content");
            }
        }

        Ok(())
    }

    /// Delete a record whose file is gone. Re-checked under the name lease:
    /// the file may have been uploaded again since the listing.
    async fn prune_orphan(&self, record: &FileRecord) -> Result<bool, ReconcileError> {
        let guard = self
            .locks
            .acquire(&name_lock_key(&record.file_name), self.locks.settings().ttl)
            .await?;
        let result = self.prune_orphan_locked(record).await;
        release(guard).await;
        result
    }

    async fn prune_orphan_locked(&self, record: &FileRecord) -> Result<bool, ReconcileError> {
        if self
            .bounded("storage lookup", self.objects.exists(&record.file_name))
            .await?
        {
            return Ok(false);
        }

        let deleted = self
            .bounded(
                "metadata delete",
                self.metadata.delete(&FileFilter::id(&record.file_id)),
            )
            .await?;
        if deleted {
            self.versions.bump(&record.file_id).await;
            info!(file_id = %record.file_id, file_name = %record.file_name, "Dropped record of missing file");
        }
        Ok(deleted)
    }

    /// Each read is bounded, not the whole digest: large files take as long
    /// as they take while the bytes keep coming.
    async fn digest_stored(&self, file_name: &str) -> Result<Checksum, ReconcileError> {
        let reader = self
            .bounded("storage open", self.objects.open(file_name))
            .await?;
        checksum::digest_with_read_timeout(reader, self.locks.settings().op_timeout)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::TimedOut => ReconcileError::Timeout("checksum".to_string()),
                _ => ObjectStoreError::Io(e).into(),
            })
    }

    async fn bounded<T, E, F>(&self, what: &str, fut: F) -> Result<T, ReconcileError>
    where
        F: Future<Output = Result<T, E>>,
        ReconcileError: From<E>,
    {
        let limit = self.locks.settings().op_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ReconcileError::Timeout(what.to_string())),
        }
    }
}

async fn release(guard: LeaseGuard) {
    let key = guard.lease().key().to_string();
    if guard.lease().is_expired() {
        warn!(%key, "Reconciliation outlived its lease");
    }
    if let Err(e) = guard.release().await {
        warn!(%key, error = %e, "Failed to release reconciliation lease");
    }
}
