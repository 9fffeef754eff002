use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::{validate_name, ObjectMeta, ObjectReader, ObjectStore, ObjectStoreError};

/// Staging area for in-flight writes, skipped by `list`.
const STAGING_DIR: &str = ".staging";

/// Local filesystem object store: one regular file per name in `base_path`.
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(base_path.join(STAGING_DIR))?;
        Ok(Self { base_path })
    }

    fn object_path(&self, name: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_name(name)?;
        if name == STAGING_DIR {
            return Err(ObjectStoreError::InvalidName(name.to_string()));
        }
        Ok(self.base_path.join(name))
    }

    fn staging_path(&self) -> PathBuf {
        self.base_path
            .join(STAGING_DIR)
            .join(uuid::Uuid::new_v4().to_string())
    }
}

fn not_found(name: &str, e: std::io::Error) -> ObjectStoreError {
    if e.kind() == ErrorKind::NotFound {
        ObjectStoreError::NotFound(name.to_string())
    } else {
        ObjectStoreError::Io(e)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, name: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        let path = self.object_path(name)?;
        let staging = self.staging_path();

        if let Err(e) = tokio::fs::write(&staging, &data).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn open(&self, name: &str) -> Result<ObjectReader, ObjectStoreError> {
        let path = self.object_path(name)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| not_found(name, e))?;
        Ok(Box::new(file))
    }

    async fn get(&self, name: &str) -> Result<Bytes, ObjectStoreError> {
        let path = self.object_path(name)?;
        let data = tokio::fs::read(&path).await.map_err(|e| not_found(name, e))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, name: &str) -> Result<(), ObjectStoreError> {
        let path = self.object_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool, ObjectStoreError> {
        let path = self.object_path(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, ObjectStoreError> {
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => {
                    tracing::warn!(name = ?raw, "Skipping stored file with a non UTF-8 name");
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn stat(&self, name: &str) -> Result<ObjectMeta, ObjectStoreError> {
        let path = self.object_path(name)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| not_found(name, e))?;
        if !meta.is_file() {
            return Err(ObjectStoreError::NotFound(name.to_string()));
        }

        // Birth time is not available on every filesystem
        let created = meta.created().or_else(|_| meta.modified())?;
        Ok(ObjectMeta {
            name: name.to_string(),
            size: meta.len(),
            created_at: DateTime::<Utc>::from(created),
        })
    }

    async fn clean_partial_writes(&self, older_than: Duration) -> Result<u64, ObjectStoreError> {
        let mut entries = tokio::fs::read_dir(self.base_path.join(STAGING_DIR)).await?;
        let now = SystemTime::now();
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            // Clock skew reads as a fresh write
            let age = now
                .duration_since(meta.modified()?)
                .unwrap_or(Duration::ZERO);
            if age < older_than {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                // Renamed into place or swept by someone else meanwhile
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Removed abandoned partial writes");
        }
        Ok(removed)
    }
}
