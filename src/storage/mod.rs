pub mod db;
mod files;
mod leases;
pub mod models;
mod tables;

pub use db::{Database, DatabaseError, PurgeStats};
pub use tables::*;

use async_trait::async_trait;

use models::{FileFilter, FilePatch, FileRecord};

/// Durable mapping from file id to metadata record.
///
/// Implementations must refuse to hold two records with the same
/// `(file_name, checksum)` pair.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn find_one(&self, filter: &FileFilter) -> Result<Option<FileRecord>, DatabaseError>;
    async fn find_by_name(&self, file_name: &str) -> Result<Vec<FileRecord>, DatabaseError>;
    async fn insert(&self, record: &FileRecord) -> Result<(), DatabaseError>;
    /// Returns `false` when nothing matched the filter.
    async fn update(&self, filter: &FileFilter, patch: &FilePatch) -> Result<bool, DatabaseError>;
    /// Returns `false` when nothing matched the filter.
    async fn delete(&self, filter: &FileFilter) -> Result<bool, DatabaseError>;
    async fn find_all(&self) -> Result<Vec<FileRecord>, DatabaseError>;
}
