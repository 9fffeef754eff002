use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use super::{CoordinationError, LeaseStore, ReleaseStatus};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock {key} is held by another operation")]
    Unavailable { key: String },
    #[error("Lock service unavailable: {0}")]
    Service(#[from] CoordinationError),
    #[error("Lock service timed out on {key}")]
    Timeout { key: String },
    #[error("Lease on {key} was lost before release")]
    Lost { key: String },
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    /// Lease lifetime; must bound the guarded operation's worst case
    pub ttl: Duration,
    /// Extra attempts after the first one
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Upper bound of the random delay added to each retry
    pub retry_jitter: Duration,
    /// Bound on a single call to the lease store
    pub op_timeout: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            retry_count: 10,
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(200),
            op_timeout: Duration::from_secs(5),
        }
    }
}

/// A time-bounded exclusive claim on a key.
#[derive(Debug, Clone)]
pub struct Lease {
    key: String,
    owner: String,
    fencing_token: u64,
    ttl: Duration,
    /// Taken before the acquire call so local expiry is never later than
    /// the store's.
    acquired_at: Instant,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fencing_token(&self) -> u64 {
        self.fencing_token
    }

    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }
}

/// Grants and releases leases over a [`LeaseStore`].
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    settings: LockSettings,
}

impl LockManager {
    pub fn new(store: Arc<dyn LeaseStore>, settings: LockSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Acquire `key` for `ttl`, retrying with jittered backoff while it is held.
    ///
    /// Fails with [`LockError::Unavailable`] once the retries are spent. Store
    /// failures are returned immediately as [`LockError::Service`] or
    /// [`LockError::Timeout`].
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LeaseGuard, LockError> {
        let owner = uuid::Uuid::new_v4().to_string();
        let mut attempt = 0;

        loop {
            let started = Instant::now();
            let granted = tokio::time::timeout(
                self.settings.op_timeout,
                self.store.try_acquire(key, &owner, ttl),
            )
            .await
            .map_err(|_| LockError::Timeout {
                key: key.to_string(),
            })??;

            if let Some(fencing_token) = granted {
                debug!(key, fencing_token, attempt, "Lease acquired");
                let lease = Lease {
                    key: key.to_string(),
                    owner,
                    fencing_token,
                    ttl,
                    acquired_at: started,
                };
                return Ok(LeaseGuard::new(self.clone(), lease));
            }

            if attempt >= self.settings.retry_count {
                debug!(key, attempt, "Lease still held, giving up");
                return Err(LockError::Unavailable {
                    key: key.to_string(),
                });
            }
            attempt += 1;
            tokio::time::sleep(self.backoff()).await;
        }
    }

    /// Release a lease. Releasing an expired or already released lease is a no-op.
    ///
    /// Returns [`LockError::Lost`] when the key has since been granted to
    /// someone else, meaning the guarded work may have overlapped theirs.
    pub async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let status = tokio::time::timeout(
            self.settings.op_timeout,
            self.store.release(&lease.key, &lease.owner),
        )
        .await
        .map_err(|_| LockError::Timeout {
            key: lease.key.clone(),
        })??;

        match status {
            ReleaseStatus::Released => {
                debug!(key = %lease.key, fencing_token = lease.fencing_token, "Lease released");
                Ok(())
            }
            ReleaseStatus::NotHeld => {
                debug!(key = %lease.key, "Lease already expired or released");
                Ok(())
            }
            ReleaseStatus::HeldByOther => Err(LockError::Lost {
                key: lease.key.clone(),
            }),
        }
    }

    fn backoff(&self) -> Duration {
        let jitter_ms = u64::try_from(self.settings.retry_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.settings.retry_delay + Duration::from_millis(jitter)
    }
}

/// Scoped ownership of a lease.
///
/// Prefer [`LeaseGuard::release`]; a guard dropped without it schedules the
/// release on the current runtime instead.
pub struct LeaseGuard {
    manager: LockManager,
    lease: Lease,
    released: bool,
}

impl LeaseGuard {
    fn new(manager: LockManager, lease: Lease) -> Self {
        Self {
            manager,
            lease,
            released: false,
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn fencing_token(&self) -> u64 {
        self.lease.fencing_token
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.manager.release(&self.lease).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let manager = self.manager.clone();
        let lease = self.lease.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = manager.release(&lease).await {
                        warn!(key = %lease.key, error = %e, "Deferred lease release failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %self.lease.key, "No runtime to release lease, leaving it to expire");
            }
        }
    }
}
