//! Contracts the distributed tier is built on, and the shipped backends.
//!
//! The [`Debouncer`](crate::Debouncer) never talks to a concrete store; it
//! only sees the [`DistributedCache`] and [`DistributedLock`] capabilities
//! defined here. A backend driver is a thin constructor producing both
//! halves from one client, see [`new_redis_driver`] and
//! [`new_memcached_driver`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

#[cfg(feature = "memcached")]
mod memcached;
#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "memcached")]
pub use self::memcached::new_memcached_driver;
#[cfg(feature = "redis")]
pub use self::redis::new_redis_driver;

/// Lock keys live in a separate namespace of the same backing store.
pub(crate) const LOCK_PREFIX: &str = "lock_";

/// A remote key-value store shared by the fleet.
///
/// Entries are owned entirely by the store; the debouncer only ever reads
/// and writes, it never deletes.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Returns the bytes stored under `key`.
    ///
    /// Any error, a plain miss as well as a transport failure, sends the
    /// caller down the compute path, so implementations must not return an
    /// empty success for an absent key.
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;

    /// Stores `value` under `key` with the given expiry, unless an entry
    /// already exists.
    ///
    /// The write-if-absent requirement keeps a slow leader from clobbering a
    /// fresher entry published by a peer.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> anyhow::Result<()>;
}

/// A per-key mutual-exclusion handle with a bounded lease.
///
/// The lease expires on its own, so a crashed holder cannot wedge the fleet.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// A single, non-blocking acquisition attempt.
    ///
    /// Returns `Ok(false)` when a peer holds the lock. Must not block the
    /// caller for longer than one backend round-trip.
    async fn try_lock(&self) -> anyhow::Result<bool>;

    /// Best-effort release.
    ///
    /// Releasing a lease that has already expired is not an error.
    async fn unlock(&self) -> anyhow::Result<()>;
}

/// Produces the lock handle for a request key, given the lease budget.
///
/// Factories map the request key into the backend's own lock namespace
/// (prefixing `"lock_"`) and derive the actual lease from the budget.
pub type LockFactory = Arc<dyn Fn(&str, Duration) -> Arc<dyn DistributedLock> + Send + Sync>;
