//! Shared helpers for in-crate tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{
    Config, CoordinationConfig, NodeConfig, ReconcileConfig, StorageConfig, WorkerConfig,
};
use crate::coordination::{CoordinationError, CounterStore};
use crate::object_store::{LocalStore, ObjectMeta, ObjectReader, ObjectStore, ObjectStoreError};
use crate::storage::Database;
use crate::{AppState, Services};

/// Lock timings short enough to keep contended tests fast.
pub fn test_coordination() -> CoordinationConfig {
    CoordinationConfig {
        lock_ttl_ms: 2_000,
        lock_retry_count: 3,
        lock_retry_delay_ms: 20,
        lock_retry_jitter_ms: 20,
        op_timeout_ms: 1_000,
        reconcile_lock_ttl_ms: 5_000,
        ..CoordinationConfig::default()
    }
}

/// Build a config rooted in `temp_dir`.
pub fn test_config(temp_dir: &tempfile::TempDir) -> Config {
    let data_dir = temp_dir.path().join("data");
    let files_dir = temp_dir.path().join("files");

    Config {
        coordination: test_coordination(),
        node: NodeConfig {
            id: uuid::Uuid::new_v4().to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
        },
        reconcile: ReconcileConfig {
            interval_seconds: None,
        },
        storage: StorageConfig {
            local_storage_path: files_dir.to_string_lossy().to_string(),
        },
        workers: WorkerConfig { worker_count: 4 },
        test_mode: true,
        max_upload_size: 10 * 1024 * 1024, // 10MB for tests
    }
}

/// Services backed by redb and a local directory, for tests that swap one
/// collaborator for a fake before building the state.
pub fn test_services(config: &Config) -> (Services, Database) {
    let db = Database::open(&config.node.data_dir).expect("Failed to open test database");
    let objects = LocalStore::new(&config.storage.local_storage_path)
        .expect("Failed to create test object store");

    let services = Services {
        metadata: Arc::new(db.clone()),
        objects: Arc::new(objects),
        leases: Arc::new(db.clone()),
        counters: Arc::new(db.clone()),
    };
    (services, db)
}

/// Create a test AppState from `config`, backed by redb and a local directory.
/// The database handle is returned too, for holding leases and inspecting
/// counters from the outside.
pub fn test_state_with(config: Config) -> (Arc<AppState>, Database) {
    let (services, db) = test_services(&config);
    (Arc::new(AppState::new(config, services)), db)
}

/// Create a test AppState with a temporary database and local object store.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    test_state_with(test_config(temp_dir)).0
}

/// Path of a stored file, for changing the storage location behind the
/// service's back.
pub fn stored_path(state: &AppState, file_name: &str) -> std::path::PathBuf {
    std::path::Path::new(&state.config.storage.local_storage_path).join(file_name)
}

/// Local store with injectable slowness and corruption.
pub struct FaultyStore {
    inner: LocalStore,
    slow_open: Option<(String, Duration)>,
    slow_put: Option<Duration>,
    corrupt_writes: AtomicBool,
}

impl FaultyStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            inner: LocalStore::new(base_path).expect("Failed to create test object store"),
            slow_open: None,
            slow_put: None,
            corrupt_writes: AtomicBool::new(false),
        }
    }

    /// Delay every `open` of `name`.
    pub fn slow_open(mut self, name: &str, delay: Duration) -> Self {
        self.slow_open = Some((name.to_string(), delay));
        self
    }

    /// Delay every `put` before it writes anything.
    pub fn slow_put(mut self, delay: Duration) -> Self {
        self.slow_put = Some(delay);
        self
    }

    /// Flip the last byte of every payload written from now on.
    pub fn corrupt_writes(&self, on: bool) {
        self.corrupt_writes.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put(&self, name: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        if let Some(delay) = self.slow_put {
            tokio::time::sleep(delay).await;
        }
        let data = if self.corrupt_writes.load(Ordering::SeqCst) && !data.is_empty() {
            let mut bytes = data.to_vec();
            let last = bytes.len() - 1;
            bytes[last] ^= 0xff;
            Bytes::from(bytes)
        } else {
            data
        };
        self.inner.put(name, data).await
    }

    async fn open(&self, name: &str) -> Result<ObjectReader, ObjectStoreError> {
        if let Some((slow, delay)) = &self.slow_open {
            if slow == name {
                tokio::time::sleep(*delay).await;
            }
        }
        self.inner.open(name).await
    }

    async fn get(&self, name: &str) -> Result<Bytes, ObjectStoreError> {
        self.inner.get(name).await
    }

    async fn delete(&self, name: &str) -> Result<(), ObjectStoreError> {
        self.inner.delete(name).await
    }

    async fn exists(&self, name: &str) -> Result<bool, ObjectStoreError> {
        self.inner.exists(name).await
    }

    async fn list(&self) -> Result<Vec<String>, ObjectStoreError> {
        self.inner.list().await
    }

    async fn stat(&self, name: &str) -> Result<ObjectMeta, ObjectStoreError> {
        self.inner.stat(name).await
    }

    async fn clean_partial_writes(&self, older_than: Duration) -> Result<u64, ObjectStoreError> {
        self.inner.clean_partial_writes(older_than).await
    }
}

/// Counter store whose increments always fail. Reads see zero.
pub struct FailingCounters;

#[async_trait]
impl CounterStore for FailingCounters {
    async fn increment(&self, _key: &str) -> Result<u64, CoordinationError> {
        Err(CoordinationError::Backend("counter store unreachable".to_string()))
    }

    async fn get(&self, _key: &str) -> Result<u64, CoordinationError> {
        Ok(0)
    }
}
