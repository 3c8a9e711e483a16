use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::adapters::{DistributedCache, LockFactory};
use crate::cache::LocalCache;
use crate::serializer::Serializer;

/// An invalid combination of configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `local.ttl` is zero.
    #[error("local TTL must be a positive duration")]
    ZeroLocalTtl,

    /// `distributed.ttl` is zero.
    #[error("distributed TTL must be a positive duration")]
    ZeroDistributedTtl,

    /// `distributed.retry` is zero.
    #[error("poll interval must be a positive duration")]
    ZeroRetry,

    /// `distributed.retry` does not fit into `distributed.ttl`, so a
    /// follower could never complete a single poll.
    #[error("poll interval must be shorter than the distributed TTL")]
    RetryExceedsTtl,
}

/// The in-process tier: a short-lived cache in front of the fleet.
pub struct Local<V> {
    /// Lifetime of a local cache entry. Keep it small, sub-second to
    /// seconds; the distributed TTL refreshes it.
    pub ttl: Duration,

    /// The bounded TTL cache holding this process' recent results.
    pub cache: Arc<dyn LocalCache<V>>,
}

impl<V> Clone for Local<V> {
    fn clone(&self) -> Self {
        Local {
            ttl: self.ttl,
            cache: Arc::clone(&self.cache),
        }
    }
}

/// The fleet tier: remote cache, per-key lock and value codec.
pub struct Distributed<V> {
    /// Remote cache TTL; also the budget from which the lock lease is
    /// derived and the deadline for followers polling the leader's result.
    /// Typically 1–10× the local TTL.
    pub ttl: Duration,

    /// Poll interval while awaiting the leader's result. Must be much
    /// smaller than `ttl`.
    pub retry: Duration,

    /// The shared remote cache.
    pub cache: Arc<dyn DistributedCache>,

    /// Produces per-key distributed locks.
    pub locker: LockFactory,

    /// Value codec used for remote cache entries.
    pub serializer: Arc<dyn Serializer<V>>,
}

impl<V> Clone for Distributed<V> {
    fn clone(&self) -> Self {
        Distributed {
            ttl: self.ttl,
            retry: self.retry,
            cache: Arc::clone(&self.cache),
            locker: Arc::clone(&self.locker),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

/// Everything a [`Debouncer`](crate::Debouncer) needs.
pub struct Config<V> {
    /// The in-process tier.
    pub local: Local<V>,
    /// The fleet tier.
    pub distributed: Distributed<V>,
}

impl<V> Config<V> {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.local.ttl.is_zero() {
            return Err(ConfigError::ZeroLocalTtl);
        }
        if self.distributed.ttl.is_zero() {
            return Err(ConfigError::ZeroDistributedTtl);
        }
        if self.distributed.retry.is_zero() {
            return Err(ConfigError::ZeroRetry);
        }
        if self.distributed.retry >= self.distributed.ttl {
            return Err(ConfigError::RetryExceedsTtl);
        }
        Ok(())
    }
}

impl<V> Clone for Config<V> {
    fn clone(&self) -> Self {
        Config {
            local: self.local.clone(),
            distributed: self.distributed.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::adapters::DistributedLock;
    use crate::serializer::JsonSerializer;
    use crate::TtlCache;

    struct NoopCache;

    #[async_trait]
    impl DistributedCache for NoopCache {
        async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("key {key:?} is not cached")
        }

        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoopLock;

    #[async_trait]
    impl DistributedLock for NoopLock {
        async fn try_lock(&self) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn unlock(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn config(local_ttl: Duration, ttl: Duration, retry: Duration) -> Config<u32> {
        Config {
            local: Local {
                ttl: local_ttl,
                cache: Arc::new(TtlCache::new(8)),
            },
            distributed: Distributed {
                ttl,
                retry,
                cache: Arc::new(NoopCache),
                locker: Arc::new(|_key, _lease| Arc::new(NoopLock)),
                serializer: Arc::new(JsonSerializer::new()),
            },
        }
    }

    #[test]
    fn accepts_sane_values() {
        let config = config(
            Duration::from_secs(1),
            Duration::from_secs(3),
            Duration::from_millis(20),
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_durations() {
        assert!(matches!(
            config(
                Duration::ZERO,
                Duration::from_secs(3),
                Duration::from_millis(20)
            )
            .validate(),
            Err(ConfigError::ZeroLocalTtl)
        ));
        assert!(matches!(
            config(
                Duration::from_secs(1),
                Duration::ZERO,
                Duration::from_millis(20)
            )
            .validate(),
            Err(ConfigError::ZeroDistributedTtl)
        ));
        assert!(matches!(
            config(Duration::from_secs(1), Duration::from_secs(3), Duration::ZERO).validate(),
            Err(ConfigError::ZeroRetry)
        ));
    }

    #[test]
    fn rejects_a_retry_longer_than_the_ttl() {
        assert!(matches!(
            config(
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(3)
            )
            .validate(),
            Err(ConfigError::RetryExceedsTtl)
        ));
    }
}
