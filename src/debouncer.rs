use std::future::Future;
use std::sync::Arc;

use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::adapters::DistributedLock;
use crate::config::{Config, ConfigError, Distributed, Local};
use crate::singleflight::Singleflight;
use crate::Error;

/// Two-tier request coalescer for expensive, idempotent computations.
///
/// [`compute_memoized`](Debouncer::compute_memoized) funnels concurrent
/// same-key callers of one process into a single computation, and uses a
/// remote cache plus a per-key distributed lock so that, fleet-wide, the
/// computation runs once and every other process reads the published value.
///
/// A typical embedding constructs one `Debouncer` per logical workload and
/// shares it by reference.
pub struct Debouncer<V> {
    local: Local<V>,
    distributed: Distributed<V>,
    inflight: Singleflight<V>,
}

impl<V> Debouncer<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Validates the configuration and builds a debouncer.
    pub fn new(config: Config<V>) -> Result<Self, ConfigError> {
        config.validate()?;
        let Config { local, distributed } = config;
        Ok(Debouncer {
            local,
            distributed,
            inflight: Singleflight::new(),
        })
    }

    /// Returns the value for `key`, invoking `closure` only when no tier can
    /// answer.
    ///
    /// The lookup order is: local cache, in-flight local computation, remote
    /// cache, and finally the closure, guarded by the distributed lock so
    /// that near-simultaneous requests from several processes still cost one
    /// invocation. Processes that lose the lock poll the remote cache until
    /// the winner publishes its value or the distributed TTL expires.
    ///
    /// Dropping the returned future abandons the wait only for this caller;
    /// an in-flight computation always runs to completion.
    pub async fn compute_memoized<F, Fut>(&self, key: &str, closure: F) -> Result<V, Error>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        if let Some(value) = self.local.cache.get(key) {
            metric!(counter("debouncer.local.hit") += 1);
            return Ok(value);
        }

        let local = self.local.clone();
        let distributed = self.distributed.clone();
        let owned_key = key.to_owned();

        self.inflight
            .run(key, move || async move {
                let value = distributed.compute(&owned_key, closure).await?;
                // Populate the local tier before the in-flight record goes
                // away, so trailing callers coalesce through the cache.
                local.cache.set(&owned_key, value.clone(), local.ttl);
                Ok(value)
            })
            .await
    }
}

impl<V> Distributed<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// The distributed tier for one key: probe the remote cache, then either
    /// lead the computation or poll for the leader's result.
    async fn compute<F, Fut>(&self, key: &str, closure: F) -> Result<V, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        if let Some(value) = self.probe(key).await {
            return Ok(value);
        }

        let lock = (self.locker)(key, self.ttl);
        match lock.try_lock().await {
            Ok(true) => self.lead(key, closure, lock).await,
            Ok(false) => self.poll(key).await,
            Err(err) => {
                // Transport trouble while acquiring is indistinguishable
                // from losing the race; fall back to polling.
                tracing::debug!(key, error = %err, "lock acquisition failed, polling instead");
                self.poll(key).await
            }
        }
    }

    /// One remote cache probe. Read and decode trouble both count as a miss.
    ///
    /// Emits the remote hit and miss counters, so probes are accounted the
    /// same way whether they come from the initial lookup or from polling.
    async fn probe(&self, key: &str) -> Option<V> {
        let bytes = match self.cache.get(key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                metric!(counter("debouncer.remote.miss") += 1);
                tracing::trace!(key, error = %err, "remote cache miss");
                return None;
            }
        };

        match self.serializer.deserialize(&bytes) {
            Ok(value) => {
                metric!(counter("debouncer.remote.hit") += 1);
                Some(value)
            }
            Err(err) => {
                metric!(counter("debouncer.remote.miss") += 1);
                tracing::debug!(key, error = %err, "discarding undecodable remote entry");
                None
            }
        }
    }

    /// The leader path: run the computation, publish, release the lock.
    ///
    /// The lock is released strictly after the remote write so that polling
    /// followers find the value as soon as the lock is free.
    async fn lead<F, Fut>(
        &self,
        key: &str,
        closure: F,
        lock: Arc<dyn DistributedLock>,
    ) -> Result<V, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        metric!(counter("debouncer.leader") += 1);
        let start = crate::time::Instant::now();

        let result = closure().await.map_err(Error::computation);
        metric!(timer("debouncer.compute") = start.elapsed());

        if let Ok(value) = &result {
            self.publish(key, value).await;
        }

        if let Err(err) = lock.unlock().await {
            tracing::debug!(key, error = %err, "failed to release the distributed lock");
        }

        result
    }

    /// Best-effort publish. The computation already succeeded, so encode and
    /// write failures only cost the peers a cache hit; they are logged and
    /// swallowed.
    async fn publish(&self, key: &str, value: &V) {
        let bytes = match self.serializer.serialize(value) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(key, error = %err, "failed to encode value for the remote cache");
                return;
            }
        };

        if let Err(err) = self.cache.set(key, &bytes, self.ttl).await {
            tracing::warn!(key, error = %err, "failed to publish value to the remote cache");
        }
    }

    /// The follower path: watch the remote cache until the leader publishes
    /// or the distributed TTL expires.
    async fn poll(&self, key: &str) -> Result<V, Error> {
        let tries = (self.ttl.as_nanos() / self.retry.as_nanos().max(1)) as u64;

        let wait = async {
            let mut ticker = interval(self.retry);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick is immediate, and the cache was probed just
            // before the lock attempt; skip it.
            ticker.tick().await;

            for _ in 0..tries {
                ticker.tick().await;
                if let Some(value) = self.probe(key).await {
                    return Ok(value);
                }
            }
            Err(Error::PollTimeout)
        };

        let result = match timeout(self.ttl, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::PollTimeout),
        };

        if matches!(result, Err(Error::PollTimeout)) {
            metric!(counter("debouncer.poll.timeout") += 1);
            tracing::debug!(key, "gave up waiting for the leader's result");
        }
        result
    }
}
