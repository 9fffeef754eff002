use std::collections::BTreeSet;
use std::future::Future;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{TaskAction, TaskError, TaskOutcome};
use crate::checksum::{self, Checksum};
use crate::coordination::{
    file_lock_key, name_lock_key, LeaseGuard, LockError, LockManager, VersionCounter,
    RECONCILE_LOCK_KEY,
};
use crate::object_store::{validate_name, ObjectStore, ObjectStoreError};
use crate::storage::models::{FileFilter, FilePatch, FileRecord, FileStatus};
use crate::storage::{MetadataStore, PurgeStats};

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub file_id: String,
    pub file_name: String,
    pub checksum: String,
    pub creation_date: DateTime<Utc>,
    /// `false` when identical bytes were already stored under this name
    pub is_new: bool,
    pub version: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub file_id: String,
    pub file_name: String,
    pub version: Option<u64>,
}

/// The side effects a worker performs, each under the leases of the files it
/// touches.
///
/// Every write to a stored file, and to any record carrying its name, holds
/// `lock:name:<file_name>`. Deletes additionally hold `lock:<file_id>` first.
pub struct FileOps {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    locks: LockManager,
    versions: VersionCounter,
    op_timeout: Duration,
    purge_lock_ttl: Duration,
}

impl FileOps {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        locks: LockManager,
        versions: VersionCounter,
        purge_lock_ttl: Duration,
    ) -> Self {
        let op_timeout = locks.settings().op_timeout;
        Self {
            metadata,
            objects,
            locks,
            versions,
            op_timeout,
            purge_lock_ttl,
        }
    }

    pub async fn execute(&self, action: TaskAction) -> Result<TaskOutcome, TaskError> {
        match action {
            TaskAction::Upload { file_name, data } => {
                self.upload(&file_name, data).await.map(TaskOutcome::Uploaded)
            }
            TaskAction::Delete { file_id } => {
                self.delete(&file_id).await.map(TaskOutcome::Deleted)
            }
        }
    }

    /// Store `data` under `file_name` unless identical bytes are already
    /// recorded under that name.
    pub async fn upload(&self, file_name: &str, data: Bytes) -> Result<UploadOutcome, TaskError> {
        validate_name(file_name).map_err(|_| TaskError::InvalidName(file_name.to_string()))?;

        let checksum = checksum::digest_bytes(&data);
        let guard = self
            .locks
            .acquire(&name_lock_key(file_name), self.lease_ttl())
            .await?;

        let result = self
            .upload_locked(file_name, &checksum, data, guard.fencing_token())
            .await;
        self.finish(guard).await;
        result
    }

    async fn upload_locked(
        &self,
        file_name: &str,
        checksum: &Checksum,
        data: Bytes,
        fencing_token: u64,
    ) -> Result<UploadOutcome, TaskError> {
        let identity = FileFilter::identity(file_name, checksum.as_str());
        if let Some(existing) = self
            .bounded("metadata lookup", self.metadata.find_one(&identity))
            .await?
        {
            debug!(file_id = %existing.file_id, file_name, "Identical file already stored");
            let version = self.versions.current(&existing.file_id).await.ok();
            return Ok(UploadOutcome {
                file_id: existing.file_id,
                file_name: existing.file_name,
                checksum: existing.checksum,
                creation_date: existing.creation_date,
                is_new: false,
                version,
            });
        }

        self.bounded("storage write", self.objects.put(file_name, data))
            .await?;

        let stored = self.digest_stored(file_name).await?;
        if stored != *checksum {
            error!(file_name, expected = %checksum, actual = %stored, "Stored bytes do not match upload");
            if let Err(e) = self.objects.delete(file_name).await {
                warn!(file_name, error = %e, "Failed to remove corrupted file");
            }
            // The write replaced whatever the name held before
            if let Err(e) = self.drop_stale_records(file_name, None).await {
                warn!(file_name, error = %e, "Failed to drop records of overwritten content");
            }
            return Err(TaskError::ChecksumMismatch {
                file_name: file_name.to_string(),
                expected: checksum.to_string(),
                actual: stored.to_string(),
            });
        }

        let meta = self
            .bounded("storage stat", self.objects.stat(file_name))
            .await?;

        self.drop_stale_records(file_name, Some(checksum)).await?;

        let record = FileRecord::new(file_name, checksum.as_str(), meta.created_at);
        self.bounded("metadata insert", self.metadata.insert(&record))
            .await?;
        let version = self.versions.bump(&record.file_id).await;

        info!(
            file_id = %record.file_id,
            file_name,
            checksum = %checksum,
            fencing_token,
            "Stored new file"
        );

        Ok(UploadOutcome {
            file_id: record.file_id,
            file_name: record.file_name,
            checksum: record.checksum,
            creation_date: record.creation_date,
            is_new: true,
            version,
        })
    }

    /// Drop the records carrying `file_name` whose checksum is not the
    /// name's `current` content. `None` drops them all.
    async fn drop_stale_records(
        &self,
        file_name: &str,
        current: Option<&Checksum>,
    ) -> Result<(), TaskError> {
        let records = self
            .bounded("metadata lookup", self.metadata.find_by_name(file_name))
            .await?;
        for old in records
            .iter()
            .filter(|r| current.map_or(true, |c| r.checksum != c.as_str()))
        {
            self.bounded(
                "metadata delete",
                self.metadata.delete(&FileFilter::id(&old.file_id)),
            )
            .await?;
            self.versions.bump(&old.file_id).await;
            info!(file_id = %old.file_id, file_name, "Superseded by new content");
        }
        Ok(())
    }

    /// Remove a file's bytes and its record.
    pub async fn delete(&self, file_id: &str) -> Result<DeleteOutcome, TaskError> {
        let guard = self
            .locks
            .acquire(&file_lock_key(file_id), self.lease_ttl())
            .await?;
        let result = self.delete_with_record_lease(file_id).await;
        self.finish(guard).await;
        result
    }

    async fn delete_with_record_lease(&self, file_id: &str) -> Result<DeleteOutcome, TaskError> {
        let record = self
            .bounded("metadata lookup", self.metadata.find_one(&FileFilter::id(file_id)))
            .await?
            .ok_or_else(|| TaskError::NotFound(file_id.to_string()))?;

        let guard = self
            .locks
            .acquire(&name_lock_key(&record.file_name), self.lease_ttl())
            .await?;
        let result = self.delete_locked(file_id, guard.fencing_token()).await;
        self.finish(guard).await;
        result
    }

    async fn delete_locked(
        &self,
        file_id: &str,
        fencing_token: u64,
    ) -> Result<DeleteOutcome, TaskError> {
        let filter = FileFilter::id(file_id);

        // An upload may have superseded the record while we waited for the name
        let record = self
            .bounded("metadata lookup", self.metadata.find_one(&filter))
            .await?
            .ok_or_else(|| TaskError::NotFound(file_id.to_string()))?;

        self.bounded(
            "metadata update",
            self.metadata
                .update(&filter, &FilePatch::status(FileStatus::DeletePending)),
        )
        .await?;

        if let Err(e) = self.remove_stored(&record.file_name).await {
            let revert = self
                .metadata
                .update(&filter, &FilePatch::status(record.status))
                .await;
            if let Err(revert_err) = revert {
                warn!(file_id, error = %revert_err, "Failed to restore status after failed delete");
            }
            return Err(e);
        }

        self.bounded("metadata delete", self.metadata.delete(&filter))
            .await?;
        let version = self.versions.bump(file_id).await;

        info!(file_id, file_name = %record.file_name, fencing_token, "Deleted file");
        Ok(DeleteOutcome {
            file_id: record.file_id,
            file_name: record.file_name,
            version,
        })
    }

    async fn remove_stored(&self, file_name: &str) -> Result<(), TaskError> {
        if !self
            .bounded("storage lookup", self.objects.exists(file_name))
            .await?
        {
            warn!(file_name, "Stored file already missing, removing record only");
            return Ok(());
        }
        self.bounded("storage delete", self.objects.delete(file_name))
            .await
    }

    /// Remove every stored file and every record, one name lease at a time.
    pub async fn purge(&self) -> Result<PurgeStats, TaskError> {
        let coarse = self
            .locks
            .acquire(RECONCILE_LOCK_KEY, self.purge_lock_ttl)
            .await?;
        let result = self.purge_locked().await;
        self.finish(coarse).await;
        result
    }

    async fn purge_locked(&self) -> Result<PurgeStats, TaskError> {
        let mut names: BTreeSet<String> = self
            .bounded("storage listing", self.objects.list())
            .await?
            .into_iter()
            .collect();
        let records = self
            .bounded("metadata scan", self.metadata.find_all())
            .await?;
        names.extend(records.into_iter().map(|r| r.file_name));

        let mut stats = PurgeStats::default();
        for name in names {
            let guard = self
                .locks
                .acquire(&name_lock_key(&name), self.lease_ttl())
                .await?;
            let result = self.purge_name(&name).await;
            self.finish(guard).await;
            stats.files += result?;
        }
        Ok(stats)
    }

    async fn purge_name(&self, file_name: &str) -> Result<u64, TaskError> {
        self.bounded("storage delete", self.objects.delete(file_name))
            .await?;

        let records = self
            .bounded("metadata lookup", self.metadata.find_by_name(file_name))
            .await?;
        let mut removed = 0;
        for record in records {
            let deleted = self
                .bounded(
                    "metadata delete",
                    self.metadata.delete(&FileFilter::id(&record.file_id)),
                )
                .await?;
            if deleted {
                self.versions.bump(&record.file_id).await;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn digest_stored(&self, file_name: &str) -> Result<Checksum, TaskError> {
        let reader = self
            .bounded("storage open", self.objects.open(file_name))
            .await?;
        checksum::digest_with_read_timeout(reader, self.op_timeout)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::TimedOut => TaskError::Timeout("stored checksum".to_string()),
                _ => ObjectStoreError::Io(e).into(),
            })
    }

    fn lease_ttl(&self) -> Duration {
        self.locks.settings().ttl
    }

    /// Bound a single call to a collaborator by the configured timeout.
    async fn bounded<T, E, F>(&self, what: &str, fut: F) -> Result<T, TaskError>
    where
        F: Future<Output = Result<T, E>>,
        TaskError: From<E>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TaskError::Timeout(what.to_string())),
        }
    }

    async fn finish(&self, guard: LeaseGuard) {
        let key = guard.lease().key().to_string();
        if guard.lease().is_expired() {
            warn!(%key, "Operation outlived its lease");
        }
        match guard.release().await {
            Ok(()) => {}
            Err(LockError::Lost { .. }) => {
                error!(%key, "Lease was taken over before release, work may have overlapped");
            }
            Err(e) => warn!(%key, error = %e, "Failed to release lease, it will expire"),
        }
    }
}
