//! Redis driver: cache via `SET NX PX`, locking via a token-guarded key.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use super::{DistributedCache, DistributedLock, LockFactory, LOCK_PREFIX};

// Compare-and-delete, so only the current lease holder can release the lock.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Builds the cache adapter and the lock factory over one Redis client.
///
/// The connection is managed and multiplexed; both halves share it. Locks
/// take half of the TTL budget as their lease, matching the remote cache
/// entry outliving the lock that guarded its creation.
pub async fn new_redis_driver(
    client: redis::Client,
) -> anyhow::Result<(Arc<dyn DistributedCache>, LockFactory)> {
    let manager = ConnectionManager::new(client)
        .await
        .context("failed to connect to redis")?;

    let cache = Arc::new(RedisCache {
        manager: manager.clone(),
    });

    let factory: LockFactory = Arc::new(move |key, lease| {
        Arc::new(RedisLock {
            manager: manager.clone(),
            key: format!("{LOCK_PREFIX}{key}"),
            token: Uuid::new_v4().to_string(),
            lease: lease / 2,
        })
    });

    Ok((cache, factory))
}

struct RedisCache {
    manager: ConnectionManager,
}

#[async_trait]
impl DistributedCache for RedisCache {
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        value.ok_or_else(|| anyhow::anyhow!("key {key:?} is not cached"))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        // NX: a value published by a faster peer wins; that is not an error.
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

struct RedisLock {
    manager: ConnectionManager,
    key: String,
    token: String,
    lease: Duration,
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_lock(&self) -> anyhow::Result<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.token)
            .arg("NX")
            .arg("PX")
            .arg(self.lease.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self) -> anyhow::Result<()> {
        let mut conn = self.manager.clone();
        redis::Script::new(UNLOCK_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }
}
