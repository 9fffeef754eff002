//! Leases and counters shared by every writer of the storage location.
//!
//! Two backends implement the store traits: the service's own redb database
//! (single authority, one process) and Redis (many processes).

mod lock;
mod redis_store;
mod version;

pub use lock::{Lease, LeaseGuard, LockError, LockManager, LockSettings};
pub use redis_store::RedisCoordinator;
pub use version::VersionCounter;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::storage::DatabaseError;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Coordination backend error: {0}")]
    Backend(String),
    #[error("Coordination backend timed out")]
    Timeout,
}

impl From<DatabaseError> for CoordinationError {
    fn from(e: DatabaseError) -> Self {
        CoordinationError::Backend(e.to_string())
    }
}

impl From<redis::RedisError> for CoordinationError {
    fn from(e: redis::RedisError) -> Self {
        CoordinationError::Backend(e.to_string())
    }
}

/// Outcome of a delete-if-owner call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// The caller's live lease was removed.
    Released,
    /// No live lease of the caller's existed (expired or already released).
    NotHeld,
    /// Another owner holds the key now.
    HeldByOther,
}

/// Key-value lease store with atomic set-if-absent-with-expiry and
/// delete-if-owner semantics.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Returns the new lease's fencing token, or `None` while the key is held.
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, CoordinationError>;

    async fn release(&self, key: &str, owner: &str) -> Result<ReleaseStatus, CoordinationError>;
}

/// Atomic increment-and-return on integer keys.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment(&self, key: &str) -> Result<u64, CoordinationError>;
    /// Missing keys read as zero.
    async fn get(&self, key: &str) -> Result<u64, CoordinationError>;
}

/// Lease key guarding one record.
pub fn file_lock_key(file_id: &str) -> String {
    format!("lock:{file_id}")
}

/// Lease key guarding a stored file and every record carrying its name.
pub fn name_lock_key(file_name: &str) -> String {
    format!("lock:name:{file_name}")
}

/// Coarse lease held for a whole reconciliation or purge pass.
pub const RECONCILE_LOCK_KEY: &str = "lock:reconcile";
