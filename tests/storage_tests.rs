use chrono::{Duration, Utc};
use filekeeper::storage::models::{FileFilter, FilePatch, FileRecord, FileStatus};
use filekeeper::storage::{Database, DatabaseError, MetadataStore};

fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    (dir, db)
}

fn sample_file(id: &str, name: &str, checksum: &str) -> FileRecord {
    let mut file = FileRecord::new(name, checksum, Utc::now());
    file.file_id = id.to_string();
    file
}

#[test]
fn test_insert_and_get_file() {
    let (_dir, db) = test_db();
    let file = sample_file("file-1", "report.txt", "abc");

    db.insert_file(&file).unwrap();

    let retrieved = db.get_file("file-1").unwrap().expect("file should exist");
    assert_eq!(retrieved, file);
    assert_eq!(retrieved.status, FileStatus::Uploaded);
}

#[test]
fn test_get_file_by_identity() {
    let (_dir, db) = test_db();
    db.insert_file(&sample_file("file-2", "readme.txt", "c1"))
        .unwrap();

    let retrieved = db
        .get_file_by_identity("readme.txt", "c1")
        .unwrap()
        .expect("file should exist");
    assert_eq!(retrieved.file_id, "file-2");

    assert!(db.get_file_by_identity("readme.txt", "c2").unwrap().is_none());
    assert!(db.get_file_by_identity("other.txt", "c1").unwrap().is_none());
}

#[test]
fn test_get_file_not_found() {
    let (_dir, db) = test_db();
    assert!(db.get_file("nonexistent").unwrap().is_none());
}

#[test]
fn test_insert_duplicate_identity_conflicts() {
    let (_dir, db) = test_db();
    db.insert_file(&sample_file("first", "same.txt", "sum"))
        .unwrap();

    let result = db.insert_file(&sample_file("second", "same.txt", "sum"));
    assert!(matches!(result, Err(DatabaseError::Conflict(_))));
    assert!(db.get_file("second").unwrap().is_none());
}

#[test]
fn test_insert_duplicate_id_conflicts() {
    let (_dir, db) = test_db();
    db.insert_file(&sample_file("dup", "one.txt", "a")).unwrap();

    let result = db.insert_file(&sample_file("dup", "two.txt", "b"));
    assert!(matches!(result, Err(DatabaseError::Conflict(_))));
    assert!(db.get_files_by_name("two.txt").unwrap().is_empty());
}

#[test]
fn test_same_name_different_checksum_coexist() {
    let (_dir, db) = test_db();
    db.insert_file(&sample_file("v1", "doc.txt", "aaa")).unwrap();
    db.insert_file(&sample_file("v2", "doc.txt", "bbb")).unwrap();

    let mut ids: Vec<String> = db
        .get_files_by_name("doc.txt")
        .unwrap()
        .into_iter()
        .map(|f| f.file_id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["v1".to_string(), "v2".to_string()]);
}

#[test]
fn test_delete_file_cleans_indexes() {
    let (_dir, db) = test_db();
    db.insert_file(&sample_file("gone", "x.txt", "s1")).unwrap();
    db.insert_file(&sample_file("kept", "x.txt", "s2")).unwrap();

    assert!(db.delete_file("gone").unwrap());
    assert!(db.get_file("gone").unwrap().is_none());
    assert!(db.get_file_by_identity("x.txt", "s1").unwrap().is_none());

    let remaining = db.get_files_by_name("x.txt").unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].file_id, "kept");

    // The identity is free again
    db.insert_file(&sample_file("again", "x.txt", "s1")).unwrap();
}

#[test]
fn test_delete_file_not_found() {
    let (_dir, db) = test_db();
    assert!(!db.delete_file("nonexistent").unwrap());
}

#[test]
fn test_update_file_patch() {
    let (_dir, db) = test_db();
    let file = sample_file("file-4", "original.png", "c");
    db.insert_file(&file).unwrap();

    let earlier = file.creation_date - Duration::days(3);
    assert!(db
        .update_file("file-4", &FilePatch::creation_date(earlier))
        .unwrap());

    let updated = db.get_file("file-4").unwrap().unwrap();
    assert_eq!(updated.creation_date, earlier);
    assert_eq!(updated.status, FileStatus::Uploaded);

    assert!(db
        .update_file("file-4", &FilePatch::status(FileStatus::DeletePending))
        .unwrap());
    let updated = db.get_file("file-4").unwrap().unwrap();
    assert_eq!(updated.creation_date, earlier);
    assert_eq!(updated.status, FileStatus::DeletePending);
}

#[test]
fn test_update_file_not_found() {
    let (_dir, db) = test_db();
    assert!(!db
        .update_file("nonexistent", &FilePatch::status(FileStatus::DeletePending))
        .unwrap());
}

#[test]
fn test_get_all_files() {
    let (_dir, db) = test_db();
    db.insert_file(&sample_file("a", "a.png", "1")).unwrap();
    db.insert_file(&sample_file("b", "b.png", "2")).unwrap();

    let files = db.get_all_files().unwrap();
    assert_eq!(files.len(), 2);
}

#[test]
fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data");
    {
        let db = Database::open(&path).unwrap();
        db.insert_file(&sample_file("durable", "keep.txt", "k"))
            .unwrap();
    }

    let db = Database::open(&path).unwrap();
    assert!(db.get_file("durable").unwrap().is_some());
    assert!(db.get_file_by_identity("keep.txt", "k").unwrap().is_some());
}

// ============================================================================
// MetadataStore adapter
// ============================================================================

#[tokio::test]
async fn test_metadata_store_filters() {
    let (_dir, db) = test_db();
    let store: &dyn MetadataStore = &db;
    let file = sample_file("m1", "notes.md", "fff");
    store.insert(&file).await.unwrap();

    let by_id = store.find_one(&FileFilter::id("m1")).await.unwrap();
    assert_eq!(by_id.as_ref(), Some(&file));

    let by_identity = store
        .find_one(&FileFilter::identity("notes.md", "fff"))
        .await
        .unwrap();
    assert_eq!(by_identity, Some(file));

    assert!(store
        .find_one(&FileFilter::id("missing"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_metadata_store_update_and_delete_by_identity() {
    let (_dir, db) = test_db();
    let store: &dyn MetadataStore = &db;
    store
        .insert(&sample_file("m2", "plan.txt", "aa"))
        .await
        .unwrap();

    let identity = FileFilter::identity("plan.txt", "aa");
    assert!(store
        .update(&identity, &FilePatch::status(FileStatus::DeletePending))
        .await
        .unwrap());
    assert!(store.delete(&identity).await.unwrap());

    // Nothing left to match
    assert!(!store.delete(&identity).await.unwrap());
    assert!(!store
        .update(&identity, &FilePatch::status(FileStatus::Uploaded))
        .await
        .unwrap());
    assert!(store.find_all().await.unwrap().is_empty());
    assert!(store.find_by_name("plan.txt").await.unwrap().is_empty());
}

// ============================================================================
// Counters
// ============================================================================

#[test]
fn test_counter_increments_from_zero() {
    let (_dir, db) = test_db();
    assert_eq!(db.get_counter("version:x").unwrap(), 0);
    assert_eq!(db.increment_counter("version:x").unwrap(), 1);
    assert_eq!(db.increment_counter("version:x").unwrap(), 2);
    assert_eq!(db.get_counter("version:x").unwrap(), 2);
    assert_eq!(db.get_counter("version:y").unwrap(), 0);
}
