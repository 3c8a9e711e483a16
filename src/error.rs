use std::sync::Arc;

use thiserror::Error;

/// The error returned from [`Debouncer::compute_memoized`](crate::Debouncer::compute_memoized)
/// and [`Debounce::debounce`](crate::Debounce::debounce).
///
/// The type is cheap to clone: a single computation failure fans out to every
/// caller coalesced onto that computation, all sharing one underlying error.
///
/// Transport failures against the remote cache and lost lock acquisitions are
/// expected at scale and never surface here; they only downgrade the
/// fleet-wide "call once" property to "call few".
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The wrapped computation itself failed.
    ///
    /// Nothing was cached, locally or remotely; the next call with the same
    /// key re-invokes the computation.
    #[error("computation failed: {0}")]
    Computation(Arc<anyhow::Error>),

    /// A peer held the distributed lock, but no value appeared in the remote
    /// cache before the distributed TTL expired.
    ///
    /// The call may simply be retried.
    #[error("no value appeared within the distributed TTL")]
    PollTimeout,

    /// The in-flight computation went away without producing a result.
    ///
    /// Waiters observe this when the computation panicked or its runtime shut
    /// down; the panic itself is re-raised on the initiating caller.
    #[error("computation was canceled")]
    Canceled,
}

impl Error {
    pub(crate) fn computation(err: anyhow::Error) -> Self {
        Error::Computation(Arc::new(err))
    }
}
