//! Two-tier request coalescing for expensive, idempotent computations.
//!
//! Given a keyed computation (a database query, a downstream call, a heavy
//! aggregation), the [`Debouncer`] guarantees that:
//!
//! - within one process, concurrent callers using the same key share a single
//!   in-flight computation and observe the same result;
//! - across a fleet of cooperating processes, only one process executes the
//!   computation while its peers briefly poll a shared remote cache for the
//!   published value;
//! - both tiers expire by TTL, so stale data is eventually refreshed.
//!
//! The local tier is a bounded [`TtlCache`] combined with in-process
//! single-flight suppression. The distributed tier is built on two
//! capability traits, [`adapters::DistributedCache`] and
//! [`adapters::DistributedLock`], with Redis and Memcached drivers shipped
//! behind the `redis` and `memcached` features.
//!
//! A simpler, non-keyed [`Debounce`] primitive is also provided for callers
//! that only need to suppress repeated invocations of a single closure
//! within a cool-down window.

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

pub mod adapters;
mod cache;
mod config;
mod debouncer;
mod error;
mod serializer;
mod singleflight;
mod spinlock;
mod utils;

pub use crate::cache::{LocalCache, TtlCache};
pub use crate::config::{Config, ConfigError, Distributed, Local};
pub use crate::debouncer::Debouncer;
pub use crate::error::Error;
pub use crate::serializer::{BincodeSerializer, JsonSerializer, Serializer};
pub use crate::spinlock::{Debounce, DebounceLock};

// In tests the virtual clock drives cache expiry, so that timing-sensitive
// tests are deterministic and fast.
#[cfg(test)]
pub(crate) use tokio::time;

#[cfg(not(test))]
pub(crate) use std::time;
