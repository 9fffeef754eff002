use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::LeaseRecord;
use super::tables::*;
use crate::coordination::{CoordinationError, CounterStore, LeaseStore, ReleaseStatus};

impl Database {
    // ========================================================================
    // Lease operations
    // ========================================================================

    /// Set-if-absent-with-expiry. An expired lease counts as absent.
    ///
    /// Returns the fencing token of the new lease, or `None` while another
    /// owner holds a live lease on `key`.
    pub fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, DatabaseError> {
        let now_ms = Utc::now().timestamp_millis();
        let write_txn = self.begin_write()?;

        let fencing_token = {
            let mut leases = write_txn.open_table(LEASES)?;
            let current: Option<LeaseRecord> = match leases.get(key)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            if current.is_some_and(|lease| !lease.is_expired(now_ms)) {
                return Ok(None);
            }

            let fence_key = fence_key(key);
            let mut counters = write_txn.open_table(COUNTERS)?;
            let token = counters
                .get(fence_key.as_str())?
                .map(|v| v.value())
                .unwrap_or(0)
                + 1;
            counters.insert(fence_key.as_str(), token)?;

            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            let lease = LeaseRecord {
                owner: owner.to_string(),
                expires_at_ms: now_ms.saturating_add(ttl_ms),
                fencing_token: token,
            };
            let data = rmp_serde::to_vec_named(&lease)?;
            leases.insert(key, data.as_slice())?;
            token
        };

        write_txn.commit()?;
        Ok(Some(fencing_token))
    }

    /// Delete-if-owner.
    pub fn release_lease(&self, key: &str, owner: &str) -> Result<ReleaseStatus, DatabaseError> {
        let now_ms = Utc::now().timestamp_millis();
        let write_txn = self.begin_write()?;

        let status = {
            let mut leases = write_txn.open_table(LEASES)?;
            let current: Option<LeaseRecord> = match leases.get(key)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            match current {
                None => ReleaseStatus::NotHeld,
                Some(lease) if lease.owner == owner => {
                    leases.remove(key)?;
                    if lease.is_expired(now_ms) {
                        ReleaseStatus::NotHeld
                    } else {
                        ReleaseStatus::Released
                    }
                }
                Some(_) => ReleaseStatus::HeldByOther,
            }
        };

        write_txn.commit()?;
        Ok(status)
    }

    // ========================================================================
    // Counters
    // ========================================================================

    /// Atomically increment a counter and return the new value.
    pub fn increment_counter(&self, key: &str) -> Result<u64, DatabaseError> {
        let write_txn = self.begin_write()?;
        let value = {
            let mut counters = write_txn.open_table(COUNTERS)?;
            let next = counters.get(key)?.map(|v| v.value()).unwrap_or(0) + 1;
            counters.insert(key, next)?;
            next
        };
        write_txn.commit()?;
        Ok(value)
    }

    pub fn get_counter(&self, key: &str) -> Result<u64, DatabaseError> {
        let read_txn = self.begin_read()?;
        let counters = read_txn.open_table(COUNTERS)?;
        Ok(counters.get(key)?.map(|v| v.value()).unwrap_or(0))
    }
}

fn fence_key(key: &str) -> String {
    format!("fence:{key}")
}

#[async_trait]
impl LeaseStore for Database {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, CoordinationError> {
        let (key, owner) = (key.to_string(), owner.to_string());
        Ok(self
            .blocking(move |db| db.try_acquire_lease(&key, &owner, ttl))
            .await?)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<ReleaseStatus, CoordinationError> {
        let (key, owner) = (key.to_string(), owner.to_string());
        Ok(self
            .blocking(move |db| db.release_lease(&key, &owner))
            .await?)
    }
}

#[async_trait]
impl CounterStore for Database {
    async fn increment(&self, key: &str) -> Result<u64, CoordinationError> {
        let key = key.to_string();
        Ok(self.blocking(move |db| db.increment_counter(&key)).await?)
    }

    async fn get(&self, key: &str) -> Result<u64, CoordinationError> {
        let key = key.to_string();
        Ok(self.blocking(move |db| db.get_counter(&key)).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::coordination::LeaseStore;
    use crate::storage::Database;

    #[tokio::test]
    async fn test_lease_call_stuck_behind_a_writer_can_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        // redb admits one writer at a time; this one holds the others back
        let writer = db.begin_write().unwrap();

        let stuck = tokio::time::timeout(
            Duration::from_millis(100),
            db.try_acquire("lock:slow", "owner", Duration::from_secs(1)),
        )
        .await;
        assert!(stuck.is_err());

        // The abandoned call still completes once the writer is gone
        drop(writer);
        let acquired = tokio::time::timeout(
            Duration::from_secs(5),
            db.try_acquire("lock:after", "owner", Duration::from_secs(1)),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(acquired.is_some());
    }
}
