//! filekeeper - file uploads with lease-guarded workers and disk/metadata reconciliation
//!
//! This crate keeps a directory of uploaded files and a metadata index in step:
//! - Upload and delete tasks run on a fixed worker pool, one lease per file
//! - Duplicate uploads (same name, same SHA-256) resolve to the existing record
//! - Per-file version counters bump on every mutation
//! - A reconciliation pass repairs drift after crashes or manual edits
//! - redb embedded database for metadata, leases, and counters; Redis optional
//!   as a shared lock service

pub mod api;
pub mod checksum;
pub mod config;
pub mod coordination;
pub mod object_store;
pub mod reconcile;
pub mod storage;
pub mod tasks;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use config::Config;
use coordination::{CounterStore, LeaseStore, LockManager, VersionCounter};
use object_store::ObjectStore;
use reconcile::Reconciler;
use storage::MetadataStore;
use tasks::{FileOps, WorkerPool};

/// External collaborators, injected at construction.
pub struct Services {
    pub metadata: Arc<dyn MetadataStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub counters: Arc<dyn CounterStore>,
}

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub metadata: Arc<dyn MetadataStore>,
    pub object_store: Arc<dyn ObjectStore>,
    pub ops: Arc<FileOps>,
    pub pool: WorkerPool,
    pub reconciler: Arc<Reconciler>,
    pub versions: VersionCounter,
}

impl AppState {
    /// Wire the core together and start the worker pool. Must be called from
    /// within a tokio runtime.
    pub fn new(config: Config, services: Services) -> Self {
        let settings = config.coordination.lock_settings();
        let locks = LockManager::new(services.leases, settings.clone());
        let versions = VersionCounter::new(services.counters, settings.op_timeout);

        let ops = Arc::new(FileOps::new(
            Arc::clone(&services.metadata),
            Arc::clone(&services.objects),
            locks.clone(),
            versions.clone(),
            config.coordination.reconcile_lock_ttl(),
        ));
        let pool = WorkerPool::new(
            Arc::clone(&ops),
            versions.clone(),
            config.workers.worker_count,
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&services.metadata),
            Arc::clone(&services.objects),
            locks,
            versions.clone(),
            config.coordination.reconcile_lock_ttl(),
        ));

        Self {
            config,
            metadata: services.metadata,
            object_store: services.objects,
            ops,
            pool,
            reconciler,
            versions,
        }
    }
}
