use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use super::{CoordinationError, CounterStore};

/// Per-file monotonic counter bumped after every successful mutation.
#[derive(Clone)]
pub struct VersionCounter {
    store: Arc<dyn CounterStore>,
    op_timeout: Duration,
    failed_increments: Arc<AtomicU64>,
}

impl VersionCounter {
    pub fn new(store: Arc<dyn CounterStore>, op_timeout: Duration) -> Self {
        Self {
            store,
            op_timeout,
            failed_increments: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn key(file_id: &str) -> String {
        format!("version:{file_id}")
    }

    pub async fn increment(&self, file_id: &str) -> Result<u64, CoordinationError> {
        tokio::time::timeout(self.op_timeout, self.store.increment(&Self::key(file_id)))
            .await
            .map_err(|_| CoordinationError::Timeout)?
    }

    /// Best-effort increment. A failure is logged and counted, never returned:
    /// the mutation it follows has already happened.
    pub async fn bump(&self, file_id: &str) -> Option<u64> {
        match self.increment(file_id).await {
            Ok(version) => Some(version),
            Err(e) => {
                self.failed_increments.fetch_add(1, Ordering::Relaxed);
                error!(file_id, error = %e, "Failed to increment version counter");
                None
            }
        }
    }

    pub async fn current(&self, file_id: &str) -> Result<u64, CoordinationError> {
        tokio::time::timeout(self.op_timeout, self.store.get(&Self::key(file_id)))
            .await
            .map_err(|_| CoordinationError::Timeout)?
    }

    /// Number of increments lost since startup (counter drift).
    pub fn failed_increments(&self) -> u64 {
        self.failed_increments.load(Ordering::Relaxed)
    }
}
