use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::coordination::LockSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub coordination: CoordinationConfig,
    pub node: NodeConfig,
    pub reconcile: ReconcileConfig,
    pub storage: StorageConfig,
    pub workers: WorkerConfig,
    /// Enables dangerous operations like purge. Must never be true in production.
    pub test_mode: bool,
    /// Maximum upload size in bytes
    pub max_upload_size: u64,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockBackend {
    /// Leases and counters in the node's own redb database
    Local,
    Redis,
}

#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    pub backend: LockBackend,
    /// Required when backend is redis
    pub redis_url: Option<String>,
    pub lock_ttl_ms: u64,
    pub lock_retry_count: u32,
    pub lock_retry_delay_ms: u64,
    pub lock_retry_jitter_ms: u64,
    /// Bound on every call to the lock service, metadata store, or storage
    pub op_timeout_ms: u64,
    /// Lease lifetime for a whole reconciliation or purge pass
    pub reconcile_lock_ttl_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Periodic reconciliation interval. `None` runs only at startup and on demand.
    pub interval_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding uploaded files
    pub local_storage_path: String,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Local,
            redis_url: None,
            lock_ttl_ms: 10_000,
            lock_retry_count: 10,
            lock_retry_delay_ms: 200,
            lock_retry_jitter_ms: 200,
            op_timeout_ms: 5_000,
            reconcile_lock_ttl_ms: 300_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_storage_path: "./uploads".to_string(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { worker_count: 4 }
    }
}

impl CoordinationConfig {
    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            ttl: Duration::from_millis(self.lock_ttl_ms),
            retry_count: self.lock_retry_count,
            retry_delay: Duration::from_millis(self.lock_retry_delay_ms),
            retry_jitter: Duration::from_millis(self.lock_retry_jitter_ms),
            op_timeout: Duration::from_millis(self.op_timeout_ms),
        }
    }

    pub fn reconcile_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.reconcile_lock_ttl_ms)
    }
}

/// Read and parse an environment variable, falling back on absence or parse failure.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let node_id = std::env::var("NODE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());

        let test_mode = std::env::var("TEST_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let max_upload_size = env_or("MAX_UPLOAD_SIZE", 50 * 1024 * 1024); // 50MB

        let local_storage_path =
            std::env::var("LOCAL_STORAGE_PATH").unwrap_or_else(|_| "./uploads".to_string());

        let backend = match std::env::var("LOCK_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "redis" => LockBackend::Redis,
            _ => LockBackend::Local,
        };

        let defaults = CoordinationConfig::default();
        let coordination = CoordinationConfig {
            backend,
            redis_url: std::env::var("REDIS_URL").ok(),
            lock_ttl_ms: env_or("LOCK_TTL_MS", defaults.lock_ttl_ms),
            lock_retry_count: env_or("LOCK_RETRY_COUNT", defaults.lock_retry_count),
            lock_retry_delay_ms: env_or("LOCK_RETRY_DELAY_MS", defaults.lock_retry_delay_ms),
            lock_retry_jitter_ms: env_or("LOCK_RETRY_JITTER_MS", defaults.lock_retry_jitter_ms),
            op_timeout_ms: env_or("OP_TIMEOUT_MS", defaults.op_timeout_ms),
            reconcile_lock_ttl_ms: env_or("RECONCILE_LOCK_TTL_MS", defaults.reconcile_lock_ttl_ms),
        };

        let interval_seconds = std::env::var("RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|secs: &u64| *secs > 0);

        let config = Config {
            node: NodeConfig {
                id: node_id,
                bind_address,
                data_dir,
            },
            coordination,
            reconcile: ReconcileConfig { interval_seconds },
            storage: StorageConfig { local_storage_path },
            workers: WorkerConfig {
                worker_count: env_or("WORKER_COUNT", WorkerConfig::default().worker_count),
            },
            test_mode,
            max_upload_size,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.is_empty() {
            return Err(ConfigError::ValidationError(
                "NODE_ID cannot be empty".to_string(),
            ));
        }

        if self.workers.worker_count == 0 {
            return Err(ConfigError::ValidationError(
                "WORKER_COUNT must be at least 1".to_string(),
            ));
        }

        if self.coordination.backend == LockBackend::Redis && self.coordination.redis_url.is_none()
        {
            return Err(ConfigError::ValidationError(
                "REDIS_URL is required when LOCK_BACKEND=redis".to_string(),
            ));
        }

        if self.coordination.lock_ttl_ms <= self.coordination.op_timeout_ms {
            return Err(ConfigError::ValidationError(
                "LOCK_TTL_MS must be greater than OP_TIMEOUT_MS".to_string(),
            ));
        }

        if self.coordination.reconcile_lock_ttl_ms < self.coordination.lock_ttl_ms {
            tracing::warn!(
                "RECONCILE_LOCK_TTL_MS ({}) is shorter than LOCK_TTL_MS ({}). \
                 A long reconciliation pass may outlive its lease.",
                self.coordination.reconcile_lock_ttl_ms,
                self.coordination.lock_ttl_ms
            );
        }

        Ok(())
    }

    /// Check if the lock service is this node's own database.
    pub fn is_single_node(&self) -> bool {
        self.coordination.backend == LockBackend::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_config;

    #[test]
    fn test_defaults_are_valid() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.coordination = CoordinationConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_single_node());

        let settings = config.coordination.lock_settings();
        assert_eq!(settings.ttl, Duration::from_secs(10));
        assert_eq!(settings.retry_count, 10);
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.coordination.backend = LockBackend::Redis;
        assert!(config.validate().is_err());

        config.coordination.redis_url = Some("redis://127.0.0.1/".to_string());
        assert!(config.validate().is_ok());
        assert!(!config.is_single_node());
    }

    #[test]
    fn test_lease_must_outlast_operation_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.coordination.lock_ttl_ms = 1_000;
        config.coordination.op_timeout_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.workers.worker_count = 0;
        assert!(config.validate().is_err());
    }
}
