mod local;

pub use local::LocalStore;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid object name: {0:?}")]
    InvalidName(String),
}

/// Streaming handle on a stored object's bytes.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// What the storage location reports about one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// The storage location holding file bytes.
/// Objects are addressed by file name, one object per name.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Replace the object atomically: readers see the old bytes or the new
    /// ones, never a partial write.
    async fn put(&self, name: &str, data: Bytes) -> Result<(), ObjectStoreError>;
    async fn open(&self, name: &str) -> Result<ObjectReader, ObjectStoreError>;
    async fn get(&self, name: &str) -> Result<Bytes, ObjectStoreError>;
    /// Deleting a missing object succeeds.
    async fn delete(&self, name: &str) -> Result<(), ObjectStoreError>;
    async fn exists(&self, name: &str) -> Result<bool, ObjectStoreError>;
    async fn list(&self) -> Result<Vec<String>, ObjectStoreError>;
    async fn stat(&self, name: &str) -> Result<ObjectMeta, ObjectStoreError>;
    /// Remove leftovers of writes that were interrupted at least
    /// `older_than` ago. Returns how many were removed.
    async fn clean_partial_writes(&self, older_than: Duration) -> Result<u64, ObjectStoreError>;
}

/// Reject names that would escape the storage location or collide with its
/// internals.
pub fn validate_name(name: &str) -> Result<(), ObjectStoreError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(ObjectStoreError::InvalidName(name.to_string()));
    }
    Ok(())
}
