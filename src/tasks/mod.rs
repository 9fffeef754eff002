//! Upload and delete tasks, executed by a fixed pool of workers under leases.

mod ops;
mod pool;

pub use ops::{DeleteOutcome, FileOps, UploadOutcome};
pub use pool::{PoolStats, TaskAction, TaskOutcome, WorkerPool};

use thiserror::Error;

use crate::coordination::LockError;
use crate::object_store::ObjectStoreError;
use crate::storage::DatabaseError;

#[derive(Debug, Error)]
pub enum TaskError {
    /// Another operation holds the file's lease. Retry later, not immediately.
    #[error("File is locked by another operation ({key}), retry later")]
    ResourceLocked { key: String },
    #[error("Lock service unavailable: {0}")]
    LockServiceUnavailable(String),
    #[error("Storage error: {0}")]
    StorageIo(#[from] ObjectStoreError),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Invalid file name: {0:?}")]
    InvalidName(String),
    #[error("Checksum mismatch for {file_name}: expected {expected}, stored {actual}")]
    ChecksumMismatch {
        file_name: String,
        expected: String,
        actual: String,
    },
    #[error("Timed out during {0}")]
    Timeout(String),
    #[error("Metadata store error: {0}")]
    Metadata(#[from] DatabaseError),
    #[error("Worker pool is shut down")]
    PoolClosed,
    #[error("Task failed: {0}")]
    Internal(String),
}

impl From<LockError> for TaskError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Unavailable { key } => TaskError::ResourceLocked { key },
            LockError::Service(inner) => TaskError::LockServiceUnavailable(inner.to_string()),
            LockError::Timeout { key } => TaskError::Timeout(format!("lock service call on {key}")),
            LockError::Lost { key } => TaskError::Internal(format!("lease on {key} was lost")),
        }
    }
}
