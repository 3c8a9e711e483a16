use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;

use crate::time::Instant;

/// The in-process cache consulted before any remote work happens.
///
/// Implementations are bounded and must never return an expired entry; the
/// eviction policy beyond that is their own business.
pub trait LocalCache<V>: Send + Sync {
    /// Returns the unexpired value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<V>;

    /// Inserts or replaces the entry under `key`, expiring `ttl` from now.
    fn set(&self, key: &str, value: V, ttl: Duration);
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A bounded TTL cache with least-recently-used eviction.
///
/// Expiry is checked on read; an expired entry is dropped on the spot rather
/// than handed out. There is no background sweeper, so an untouched entry
/// occupies its slot until it is read, replaced or evicted.
pub struct TtlCache<V> {
    entries: Mutex<LruCache<String, Entry<V>>>,
}

impl<V> TtlCache<V> {
    /// Creates a cache holding at most `capacity` entries.
    ///
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        TtlCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl<V> LocalCache<V> for TtlCache<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().put(key.to_owned(), entry);
    }
}
