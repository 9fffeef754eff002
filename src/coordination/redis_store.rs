use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{CoordinationError, CounterStore, LeaseStore, ReleaseStatus};

/// Set-if-absent-with-expiry and the fencing token bump in one step.
/// Returns the new token, or 0 while the key is held.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
    return redis.call('INCR', KEYS[2])
end
return 0
"#;

/// Compare-and-delete: 1 released, 0 absent, -1 owned by someone else.
const RELEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return -1
"#;

/// Lease and counter store shared by every process pointed at the same Redis.
pub struct RedisCoordinator {
    conn: ConnectionManager,
    acquire_script: redis::Script,
    release_script: redis::Script,
}

impl RedisCoordinator {
    pub async fn connect(url: &str) -> Result<Self, CoordinationError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            acquire_script: redis::Script::new(ACQUIRE_SCRIPT),
            release_script: redis::Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl LeaseStore for RedisCoordinator {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, CoordinationError> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let token: u64 = self
            .acquire_script
            .key(key)
            .key(fence_key(key))
            .arg(owner)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok((token > 0).then_some(token))
    }

    async fn release(&self, key: &str, owner: &str) -> Result<ReleaseStatus, CoordinationError> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .release_script
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;

        Ok(match outcome {
            1 => ReleaseStatus::Released,
            0 => ReleaseStatus::NotHeld,
            _ => ReleaseStatus::HeldByOther,
        })
    }
}

#[async_trait]
impl CounterStore for RedisCoordinator {
    async fn increment(&self, key: &str) -> Result<u64, CoordinationError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1u64).await?)
    }

    async fn get(&self, key: &str) -> Result<u64, CoordinationError> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }
}

fn fence_key(key: &str) -> String {
    format!("fence:{key}")
}
