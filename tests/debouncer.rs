//! Fleet-level behavior over an in-memory backend: several debouncer
//! instances sharing one remote store stand in for cooperating processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use debouncer::adapters::{DistributedCache, DistributedLock, LockFactory};
use debouncer::{Config, Debouncer, Distributed, Error, JsonSerializer, Local, TtlCache};

/// Setup the test environment.
///
///  - Initializes logs so that trace output from the crate is captured by
///    the test runner.
fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debouncer=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// One remote store shared by every "process" in a test: keys carry bytes
/// and an expiry, writes are write-if-absent, locks are entries under the
/// `lock_` prefix.
#[derive(Default)]
struct MemoryStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

struct MemoryCache {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl DistributedCache for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let mut entries = self.store.entries.lock();
        match entries.get(key) {
            Some((bytes, expires_at)) if *expires_at > Instant::now() => Ok(bytes.clone()),
            Some(_) => {
                entries.remove(key);
                anyhow::bail!("key {key:?} expired")
            }
            None => anyhow::bail!("key {key:?} is not cached"),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> anyhow::Result<()> {
        let mut entries = self.store.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            // Write-if-absent: an unexpired entry wins over the writer.
            Some((_, expires_at)) if *expires_at > now => Ok(()),
            _ => {
                entries.insert(key.to_owned(), (value.to_vec(), now + ttl));
                Ok(())
            }
        }
    }
}

struct MemoryLock {
    store: Arc<MemoryStore>,
    key: String,
    lease: Duration,
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_lock(&self) -> anyhow::Result<bool> {
        let mut entries = self.store.entries.lock();
        let now = Instant::now();
        match entries.get(&self.key) {
            Some((_, expires_at)) if *expires_at > now => Ok(false),
            _ => {
                entries.insert(self.key.clone(), (vec![1], now + self.lease));
                Ok(true)
            }
        }
    }

    async fn unlock(&self) -> anyhow::Result<()> {
        self.store.entries.lock().remove(&self.key);
        Ok(())
    }
}

fn memory_driver(store: &Arc<MemoryStore>) -> (Arc<dyn DistributedCache>, LockFactory) {
    let cache = Arc::new(MemoryCache {
        store: Arc::clone(store),
    });

    let lock_store = Arc::clone(store);
    let factory: LockFactory = Arc::new(move |key, lease| {
        Arc::new(MemoryLock {
            store: Arc::clone(&lock_store),
            key: format!("lock_{key}"),
            lease: lease / 2,
        })
    });

    (cache, factory)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Data {
    int_value: i64,
    string_value: String,
}

type Payload = HashMap<String, Data>;

fn payload() -> Payload {
    HashMap::from([
        (
            "key1".to_owned(),
            Data {
                int_value: 10,
                string_value: "test".to_owned(),
            },
        ),
        (
            "key2".to_owned(),
            Data {
                int_value: 15,
                string_value: "test".to_owned(),
            },
        ),
    ])
}

fn instance(
    store: &Arc<MemoryStore>,
    local_ttl: Duration,
    distributed_ttl: Duration,
    retry: Duration,
) -> Debouncer<Payload> {
    let (cache, locker) = memory_driver(store);

    Debouncer::new(Config {
        local: Local {
            ttl: local_ttl,
            cache: Arc::new(TtlCache::new(100)),
        },
        distributed: Distributed {
            ttl: distributed_ttl,
            retry,
            cache,
            locker,
            serializer: Arc::new(JsonSerializer::new()),
        },
    })
    .expect("create debouncer failed")
}

/// The closure used throughout: sleeps a bit, counts its invocations and
/// returns the canonical payload.
fn service(
    calls: &Arc<AtomicUsize>,
    runtime: Duration,
) -> impl FnOnce() -> futures::future::BoxFuture<'static, anyhow::Result<Payload>> + Send + 'static
{
    let calls = Arc::clone(calls);
    move || {
        Box::pin(async move {
            sleep(runtime).await;
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(payload())
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fleet_invokes_the_closure_once() {
    setup();

    let store = Arc::new(MemoryStore::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let instances: Vec<_> = (0..3)
        .map(|_| {
            Arc::new(instance(
                &store,
                Duration::from_millis(300),
                Duration::from_secs(3),
                Duration::from_millis(20),
            ))
        })
        .collect();

    // First wave: 3 instances x 10 concurrent requests, one invocation.
    let mut requests = Vec::new();
    for debouncer in &instances {
        for _ in 0..10 {
            let debouncer = Arc::clone(debouncer);
            let calls = Arc::clone(&calls);
            requests.push(tokio::spawn(async move {
                debouncer
                    .compute_memoized("testKey", service(&calls, Duration::from_millis(300)))
                    .await
            }));
        }
    }
    for request in requests {
        assert_eq!(request.await.unwrap().unwrap(), payload());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "call's more than once");

    // Second wave shortly after: served from the local caches.
    sleep(Duration::from_millis(100)).await;
    for debouncer in &instances {
        let result = debouncer
            .compute_memoized("testKey", service(&calls, Duration::from_millis(300)))
            .await;
        assert_eq!(result.unwrap(), payload());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Third wave after the local TTL: served from the remote cache.
    sleep(Duration::from_millis(400)).await;
    for debouncer in &instances {
        let result = debouncer
            .compute_memoized("testKey", service(&calls, Duration::from_millis(300)))
            .await;
        assert_eq!(result.unwrap(), payload());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_tiers_recompute_once() {
    setup();

    let store = Arc::new(MemoryStore::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let debouncer = instance(
        &store,
        Duration::from_millis(100),
        Duration::from_millis(500),
        Duration::from_millis(20),
    );

    let first = debouncer
        .compute_memoized("ttl", service(&calls, Duration::from_millis(10)))
        .await;
    assert_eq!(first.unwrap(), payload());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Both TTLs lapse; the next call recomputes, exactly once.
    sleep(Duration::from_millis(600)).await;
    let second = debouncer
        .compute_memoized("ttl", service(&calls, Duration::from_millis(10)))
        .await;
    assert_eq!(second.unwrap(), payload());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn lock_loser_converges_on_the_winners_value() {
    setup();

    let store = Arc::new(MemoryStore::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let winner = Arc::new(instance(
        &store,
        Duration::from_millis(300),
        Duration::from_secs(3),
        Duration::from_millis(20),
    ));
    let loser = instance(
        &store,
        Duration::from_millis(300),
        Duration::from_secs(3),
        Duration::from_millis(20),
    );

    let leading = {
        let winner = Arc::clone(&winner);
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            winner
                .compute_memoized("race", service(&calls, Duration::from_millis(300)))
                .await
        })
    };

    // Give the winner time to take the lock, then race from another process.
    sleep(Duration::from_millis(50)).await;
    let start = Instant::now();
    let followed = loser
        .compute_memoized("race", service(&calls, Duration::from_millis(300)))
        .await;

    assert_eq!(followed.unwrap(), payload());
    assert_eq!(leading.await.unwrap().unwrap(), payload());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Convergence within roughly the closure runtime plus one poll interval.
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn errors_are_not_cached() {
    setup();

    let store = Arc::new(MemoryStore::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let debouncer = instance(
        &store,
        Duration::from_millis(300),
        Duration::from_secs(3),
        Duration::from_millis(20),
    );

    let flaky = |calls: &Arc<AtomicUsize>| {
        let calls = Arc::clone(calls);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    anyhow::bail!("upstream unavailable")
                }
                Ok(payload())
            }
        }
    };

    // Two failures in a row: each call re-invokes the closure.
    for _ in 0..2 {
        let result = debouncer.compute_memoized("flaky", flaky(&calls)).await;
        match result {
            Err(Error::Computation(err)) => {
                assert_eq!(err.to_string(), "upstream unavailable")
            }
            other => panic!("expected a computation error, got {other:?}"),
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Third call succeeds, fourth is served from cache.
    let third = debouncer.compute_memoized("flaky", flaky(&calls)).await;
    assert_eq!(third.unwrap(), payload());
    let fourth = debouncer.compute_memoized("flaky", flaky(&calls)).await;
    assert_eq!(fourth.unwrap(), payload());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn poll_deadline_surfaces_when_no_leader_publishes() {
    setup();

    let store = Arc::new(MemoryStore::default());

    // A stuck peer: the lock is taken and nothing ever gets published.
    store.entries.lock().insert(
        "lock_stuck".to_owned(),
        (vec![1], Instant::now() + Duration::from_secs(60)),
    );

    let debouncer = instance(
        &store,
        Duration::from_millis(100),
        Duration::from_millis(200),
        Duration::from_millis(20),
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let result = debouncer
        .compute_memoized("stuck", service(&calls, Duration::from_millis(10)))
        .await;

    assert!(matches!(result, Err(Error::PollTimeout)));
    // The closure never ran; the poll phase was capped by the TTL.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(start.elapsed() >= Duration::from_millis(150));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn local_callers_share_one_remote_round_trip() {
    setup();

    let store = Arc::new(MemoryStore::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let debouncer = Arc::new(instance(
        &store,
        Duration::from_millis(300),
        Duration::from_secs(3),
        Duration::from_millis(20),
    ));

    let requests: Vec<_> = (0..10)
        .map(|_| {
            let debouncer = Arc::clone(&debouncer);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                debouncer
                    .compute_memoized("shared", service(&calls, Duration::from_millis(100)))
                    .await
            })
        })
        .collect();

    for request in requests {
        assert_eq!(request.await.unwrap().unwrap(), payload());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
