use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle marker carried on a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Uploaded,
    DeletePending,
}

/// A file record stored in redb
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub file_name: String,
    /// Hex SHA-256 of the stored bytes
    pub checksum: String,
    pub creation_date: DateTime<Utc>,
    pub status: FileStatus,
}

impl FileRecord {
    /// A freshly observed file with a newly minted id.
    pub fn new(
        file_name: impl Into<String>,
        checksum: impl Into<String>,
        creation_date: DateTime<Utc>,
    ) -> Self {
        Self {
            file_id: uuid::Uuid::new_v4().to_string(),
            file_name: file_name.into(),
            checksum: checksum.into(),
            creation_date,
            status: FileStatus::Uploaded,
        }
    }

    /// Key of the identity index for this record.
    pub fn identity_key(&self) -> String {
        identity_key(&self.file_name, &self.checksum)
    }
}

/// Build the identity index key for a `(file_name, checksum)` pair.
///
/// NUL cannot appear in a file name on any supported filesystem, so the pair
/// is unambiguous.
pub fn identity_key(file_name: &str, checksum: &str) -> String {
    format!("{file_name}\0{checksum}")
}

/// Selects a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileFilter {
    Id(String),
    /// The dedup key: `(file_name, checksum)`
    Identity { file_name: String, checksum: String },
}

impl FileFilter {
    pub fn id(file_id: impl Into<String>) -> Self {
        FileFilter::Id(file_id.into())
    }

    pub fn identity(file_name: impl Into<String>, checksum: impl Into<String>) -> Self {
        FileFilter::Identity {
            file_name: file_name.into(),
            checksum: checksum.into(),
        }
    }
}

/// Partial update of the mutable record fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilePatch {
    pub creation_date: Option<DateTime<Utc>>,
    pub status: Option<FileStatus>,
}

impl FilePatch {
    pub fn creation_date(date: DateTime<Utc>) -> Self {
        Self {
            creation_date: Some(date),
            ..Default::default()
        }
    }

    pub fn status(status: FileStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// A lease as persisted by the local lock store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: String,
    /// Unix epoch milliseconds after which the lease is void
    pub expires_at_ms: i64,
    pub fencing_token: u64,
}

impl LeaseRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}
