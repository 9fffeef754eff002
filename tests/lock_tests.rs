use std::sync::Arc;
use std::time::Duration;

use filekeeper::coordination::{
    CounterStore, LeaseStore, LockError, LockManager, LockSettings, RedisCoordinator,
    ReleaseStatus, VersionCounter,
};
use filekeeper::storage::Database;

fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    (dir, db)
}

fn fast_settings() -> LockSettings {
    LockSettings {
        ttl: Duration::from_secs(2),
        retry_count: 2,
        retry_delay: Duration::from_millis(10),
        retry_jitter: Duration::from_millis(10),
        op_timeout: Duration::from_secs(1),
    }
}

fn manager(db: &Database) -> LockManager {
    LockManager::new(Arc::new(db.clone()), fast_settings())
}

#[tokio::test]
async fn test_lease_is_exclusive() {
    let (_dir, db) = test_db();
    let locks = manager(&db);

    let held = locks
        .acquire("lock:a", Duration::from_secs(2))
        .await
        .unwrap();

    let second = locks.acquire("lock:a", Duration::from_secs(2)).await;
    assert!(matches!(second, Err(LockError::Unavailable { .. })));

    // Other keys are independent
    let other = locks
        .acquire("lock:b", Duration::from_secs(2))
        .await
        .unwrap();

    held.release().await.unwrap();
    other.release().await.unwrap();

    let again = locks
        .acquire("lock:a", Duration::from_secs(2))
        .await
        .unwrap();
    again.release().await.unwrap();
}

#[tokio::test]
async fn test_expired_lease_can_be_taken() {
    let (_dir, db) = test_db();
    let locks = manager(&db);

    let stale = locks
        .acquire("lock:ttl", Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(stale.lease().is_expired());

    let fresh = locks
        .acquire("lock:ttl", Duration::from_secs(2))
        .await
        .unwrap();
    assert!(fresh.fencing_token() > stale.fencing_token());

    // The old holder finds someone else in its place
    let result = stale.release().await;
    assert!(matches!(result, Err(LockError::Lost { .. })));

    fresh.release().await.unwrap();
}

#[tokio::test]
async fn test_waiter_gets_lease_after_release() {
    let (_dir, db) = test_db();
    let locks = LockManager::new(
        Arc::new(db.clone()),
        LockSettings {
            retry_count: 50,
            ..fast_settings()
        },
    );

    let held = locks
        .acquire("lock:wait", Duration::from_secs(2))
        .await
        .unwrap();

    let waiter = {
        let locks = locks.clone();
        tokio::spawn(async move { locks.acquire("lock:wait", Duration::from_secs(2)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    held.release().await.unwrap();

    let acquired = waiter.await.unwrap().unwrap();
    acquired.release().await.unwrap();
}

#[tokio::test]
async fn test_release_is_idempotent_at_store_level() {
    let (_dir, db) = test_db();

    assert!(db
        .try_acquire("lock:r", "owner-1", Duration::from_secs(2))
        .await
        .unwrap()
        .is_some());
    assert!(db
        .try_acquire("lock:r", "owner-2", Duration::from_secs(2))
        .await
        .unwrap()
        .is_none());

    assert_eq!(
        LeaseStore::release(&db, "lock:r", "owner-2").await.unwrap(),
        ReleaseStatus::HeldByOther
    );
    assert_eq!(
        LeaseStore::release(&db, "lock:r", "owner-1").await.unwrap(),
        ReleaseStatus::Released
    );
    assert_eq!(
        LeaseStore::release(&db, "lock:r", "owner-1").await.unwrap(),
        ReleaseStatus::NotHeld
    );
}

#[tokio::test]
async fn test_fencing_tokens_increase() {
    let (_dir, db) = test_db();
    let locks = manager(&db);

    let mut last = 0;
    for _ in 0..5 {
        let guard = locks
            .acquire("lock:fence", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(guard.fencing_token() > last);
        last = guard.fencing_token();
        guard.release().await.unwrap();
    }
}

#[tokio::test]
async fn test_dropped_guard_releases_lease() {
    let (_dir, db) = test_db();
    let locks = LockManager::new(
        Arc::new(db.clone()),
        LockSettings {
            retry_count: 20,
            ..fast_settings()
        },
    );

    {
        let _guard = locks
            .acquire("lock:drop", Duration::from_secs(5))
            .await
            .unwrap();
    }

    // Released by the spawned cleanup, well before the TTL runs out
    let guard = locks
        .acquire("lock:drop", Duration::from_secs(5))
        .await
        .unwrap();
    guard.release().await.unwrap();
}

// ============================================================================
// Version counters
// ============================================================================

#[tokio::test]
async fn test_version_counter_is_monotonic() {
    let (_dir, db) = test_db();
    let versions = VersionCounter::new(Arc::new(db.clone()), Duration::from_secs(1));

    assert_eq!(versions.current("f1").await.unwrap(), 0);
    assert_eq!(versions.bump("f1").await, Some(1));
    assert_eq!(versions.bump("f1").await, Some(2));
    assert_eq!(versions.increment("f1").await.unwrap(), 3);
    assert_eq!(versions.current("f1").await.unwrap(), 3);

    // Stored under the documented key
    assert_eq!(CounterStore::get(&db, "version:f1").await.unwrap(), 3);
    assert_eq!(versions.failed_increments(), 0);
}

// ============================================================================
// Redis backend (runs only when REDIS_URL points at a server)
// ============================================================================

#[tokio::test]
async fn test_redis_acquire_sets_lease_and_token_together() {
    let Ok(url) = std::env::var("REDIS_URL") else {
        return;
    };
    let redis = RedisCoordinator::connect(&url).await.unwrap();
    let key = format!("lock:test:{}", uuid::Uuid::new_v4());

    let first = redis
        .try_acquire(&key, "owner-1", Duration::from_secs(5))
        .await
        .unwrap()
        .expect("key should be free");
    assert!(redis
        .try_acquire(&key, "owner-2", Duration::from_secs(5))
        .await
        .unwrap()
        .is_none());

    // A refused attempt does not consume a token
    assert_eq!(
        CounterStore::get(&redis, &format!("fence:{key}")).await.unwrap(),
        first
    );

    assert_eq!(
        LeaseStore::release(&redis, &key, "owner-1").await.unwrap(),
        ReleaseStatus::Released
    );
    let second = redis
        .try_acquire(&key, "owner-2", Duration::from_secs(5))
        .await
        .unwrap()
        .expect("key should be free again");
    assert_eq!(second, first + 1);
    LeaseStore::release(&redis, &key, "owner-2").await.unwrap();
}
