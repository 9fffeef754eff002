use async_trait::async_trait;
use redb::{ReadableTable, WriteTransaction};

use super::db::{Database, DatabaseError};
use super::models::{identity_key, FileFilter, FilePatch, FileRecord};
use super::tables::*;
use super::MetadataStore;

impl Database {
    // ========================================================================
    // File operations
    // ========================================================================

    /// Insert a new file record and its identity and name index entries.
    ///
    /// Fails with `Conflict` if the id is taken or another record already
    /// carries the same `(file_name, checksum)` pair.
    pub fn insert_file(&self, file: &FileRecord) -> Result<(), DatabaseError> {
        debug_assert!(!file.file_id.is_empty(), "file id must not be empty");

        let identity = file.identity_key();
        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(FILES)?;
            if table.get(file.file_id.as_str())?.is_some() {
                return Err(DatabaseError::Conflict(format!(
                    "file id {} already exists",
                    file.file_id
                )));
            }

            let mut identity_table = write_txn.open_table(FILE_IDENTITIES)?;
            if let Some(existing) = identity_table.get(identity.as_str())? {
                return Err(DatabaseError::Conflict(format!(
                    "'{}' with checksum {} is already recorded as {}",
                    file.file_name,
                    file.checksum,
                    existing.value()
                )));
            }

            let data = rmp_serde::to_vec_named(file)?;
            table.insert(file.file_id.as_str(), data.as_slice())?;
            identity_table.insert(identity.as_str(), file.file_id.as_str())?;
        }
        add_to_name_index(&write_txn, &file.file_name, &file.file_id)?;
        write_txn.commit()?;
        Ok(())
    }

    /// Get a file by its id
    pub fn get_file(&self, file_id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        match table.get(file_id)? {
            Some(data) => {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Get a file by its dedup identity (resolves identity -> id -> file)
    pub fn get_file_by_identity(
        &self,
        file_name: &str,
        checksum: &str,
    ) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let identity_table = read_txn.open_table(FILE_IDENTITIES)?;

        let file_id = match identity_table.get(identity_key(file_name, checksum).as_str())? {
            Some(data) => data.value().to_string(),
            None => return Ok(None),
        };

        let files_table = read_txn.open_table(FILES)?;
        match files_table.get(file_id.as_str())? {
            Some(data) => {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Get all records carrying a file name, whatever their checksum
    pub fn get_files_by_name(&self, file_name: &str) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let name_table = read_txn.open_table(FILE_NAMES)?;
        let files_table = read_txn.open_table(FILES)?;

        let file_ids: Vec<String> = match name_table.get(file_name)? {
            Some(data) => rmp_serde::from_slice(data.value())?,
            None => return Ok(Vec::new()),
        };

        let mut files = Vec::new();
        for file_id in file_ids {
            if let Some(data) = files_table.get(file_id.as_str())? {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                files.push(file);
            }
        }

        Ok(files)
    }

    /// Delete a file by id and clean up the identity and name indexes
    pub fn delete_file(&self, file_id: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;

        let existing: Option<FileRecord> = {
            let table = write_txn.open_table(FILES)?;
            let result = match table.get(file_id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            result
        };

        let deleted = match existing {
            Some(file) => {
                {
                    let mut table = write_txn.open_table(FILES)?;
                    table.remove(file_id)?;
                }
                {
                    let mut identity_table = write_txn.open_table(FILE_IDENTITIES)?;
                    identity_table.remove(file.identity_key().as_str())?;
                }
                remove_from_name_index(&write_txn, &file.file_name, file_id)?;
                true
            }
            None => false,
        };

        write_txn.commit()?;
        Ok(deleted)
    }

    /// Apply a partial update to a file's mutable fields
    pub fn update_file(&self, file_id: &str, patch: &FilePatch) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;

        let existing: Option<FileRecord> = {
            let table = write_txn.open_table(FILES)?;
            let result = match table.get(file_id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            result
        };

        let updated = match existing {
            Some(mut file) => {
                if let Some(date) = patch.creation_date {
                    file.creation_date = date;
                }
                if let Some(status) = patch.status {
                    file.status = status;
                }

                let serialized = rmp_serde::to_vec_named(&file)?;
                let mut table = write_txn.open_table(FILES)?;
                table.insert(file_id, serialized.as_slice())?;
                true
            }
            None => false,
        };

        write_txn.commit()?;
        Ok(updated)
    }

    /// Get all files
    pub fn get_all_files(&self) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        let mut files = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            let file: FileRecord = rmp_serde::from_slice(value.value())?;
            files.push(file);
        }

        Ok(files)
    }

    fn resolve_filter(&self, filter: &FileFilter) -> Result<Option<FileRecord>, DatabaseError> {
        match filter {
            FileFilter::Id(file_id) => self.get_file(file_id),
            FileFilter::Identity {
                file_name,
                checksum,
            } => self.get_file_by_identity(file_name, checksum),
        }
    }
}

fn add_to_name_index(
    write_txn: &WriteTransaction,
    file_name: &str,
    file_id: &str,
) -> Result<(), DatabaseError> {
    let mut name_table = write_txn.open_table(FILE_NAMES)?;
    let mut file_ids: Vec<String> = match name_table.get(file_name)? {
        Some(data) => rmp_serde::from_slice(data.value())?,
        None => Vec::new(),
    };

    if !file_ids.iter().any(|id| id == file_id) {
        file_ids.push(file_id.to_string());
        let data = rmp_serde::to_vec_named(&file_ids)?;
        name_table.insert(file_name, data.as_slice())?;
    }
    Ok(())
}

fn remove_from_name_index(
    write_txn: &WriteTransaction,
    file_name: &str,
    file_id: &str,
) -> Result<(), DatabaseError> {
    let mut name_table = write_txn.open_table(FILE_NAMES)?;
    let file_ids: Option<Vec<String>> = match name_table.get(file_name)? {
        Some(data) => Some(rmp_serde::from_slice(data.value())?),
        None => None,
    };

    if let Some(mut ids) = file_ids {
        ids.retain(|id| id != file_id);
        if ids.is_empty() {
            name_table.remove(file_name)?;
        } else {
            let data = rmp_serde::to_vec_named(&ids)?;
            name_table.insert(file_name, data.as_slice())?;
        }
    }
    Ok(())
}

#[async_trait]
impl MetadataStore for Database {
    async fn find_one(&self, filter: &FileFilter) -> Result<Option<FileRecord>, DatabaseError> {
        let filter = filter.clone();
        self.blocking(move |db| db.resolve_filter(&filter)).await
    }

    async fn find_by_name(&self, file_name: &str) -> Result<Vec<FileRecord>, DatabaseError> {
        let file_name = file_name.to_string();
        self.blocking(move |db| db.get_files_by_name(&file_name))
            .await
    }

    async fn insert(&self, record: &FileRecord) -> Result<(), DatabaseError> {
        let record = record.clone();
        self.blocking(move |db| db.insert_file(&record)).await
    }

    async fn update(&self, filter: &FileFilter, patch: &FilePatch) -> Result<bool, DatabaseError> {
        let (filter, patch) = (filter.clone(), patch.clone());
        self.blocking(move |db| match db.resolve_filter(&filter)? {
            Some(file) => db.update_file(&file.file_id, &patch),
            None => Ok(false),
        })
        .await
    }

    async fn delete(&self, filter: &FileFilter) -> Result<bool, DatabaseError> {
        let filter = filter.clone();
        self.blocking(move |db| match db.resolve_filter(&filter)? {
            Some(file) => db.delete_file(&file.file_id),
            None => Ok(false),
        })
        .await
    }

    async fn find_all(&self) -> Result<Vec<FileRecord>, DatabaseError> {
        self.blocking(|db| db.get_all_files()).await
    }
}
