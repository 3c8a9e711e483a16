//! Memcached driver: `add` gives write-if-absent for both cache and lock.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use memcache::{CommandError, MemcacheError};
use uuid::Uuid;

use super::{DistributedCache, DistributedLock, LockFactory, LOCK_PREFIX};

/// Builds the cache adapter and the lock factory over one memcached client.
///
/// The client is synchronous; every call is moved off the async runtime via
/// `spawn_blocking`. Locks take half of the TTL budget as their lease.
pub fn new_memcached_driver(
    client: memcache::Client,
) -> (Arc<dyn DistributedCache>, LockFactory) {
    let client = Arc::new(client);

    let cache = Arc::new(MemcachedCache {
        client: Arc::clone(&client),
    });

    let factory: LockFactory = Arc::new(move |key, lease| {
        Arc::new(MemcachedLock {
            client: Arc::clone(&client),
            key: format!("{LOCK_PREFIX}{key}"),
            token: Uuid::new_v4().to_string(),
            lease: lease / 2,
        })
    });

    (cache, factory)
}

// Memcached expirations are whole seconds; round up so a sub-second budget
// does not become "never expires".
fn whole_seconds(ttl: Duration) -> u32 {
    ttl.as_secs().max(1) as u32
}

struct MemcachedCache {
    client: Arc<memcache::Client>,
}

#[async_trait]
impl DistributedCache for MemcachedCache {
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let client = Arc::clone(&self.client);
        let key = key.to_owned();

        let value: Option<Vec<u8>> =
            tokio::task::spawn_blocking(move || client.get(&key))
                .await
                .context("memcached worker stopped")??;
        value.ok_or_else(|| anyhow::anyhow!("key is not cached"))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> anyhow::Result<()> {
        let client = Arc::clone(&self.client);
        let key = key.to_owned();
        let value = value.to_vec();
        let expiry = whole_seconds(ttl);

        tokio::task::spawn_blocking(move || client.add(&key, value.as_slice(), expiry))
            .await
            .context("memcached worker stopped")??;
        Ok(())
    }
}

struct MemcachedLock {
    client: Arc<memcache::Client>,
    key: String,
    token: String,
    lease: Duration,
}

#[async_trait]
impl DistributedLock for MemcachedLock {
    async fn try_lock(&self) -> anyhow::Result<bool> {
        let client = Arc::clone(&self.client);
        let key = self.key.clone();
        let token = self.token.clone();
        let expiry = whole_seconds(self.lease);

        let acquired = tokio::task::spawn_blocking(move || {
            match client.add(&key, token.as_bytes(), expiry) {
                Ok(()) => Ok(true),
                // The key exists: a peer holds the lease.
                Err(MemcacheError::CommandError(CommandError::KeyExists)) => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await
        .context("memcached worker stopped")??;
        Ok(acquired)
    }

    async fn unlock(&self) -> anyhow::Result<()> {
        let client = Arc::clone(&self.client);
        let key = self.key.clone();
        let token = self.token.clone();

        tokio::task::spawn_blocking(move || -> Result<(), MemcacheError> {
            // Only the holder of the current lease may release it; a lease
            // that expired and was re-acquired by a peer stays untouched.
            let current: Option<Vec<u8>> = client.get(&key)?;
            if current.as_deref() == Some(token.as_bytes()) {
                client.delete(&key)?;
            }
            Ok(())
        })
        .await
        .context("memcached worker stopped")??;
        Ok(())
    }
}
