use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::utils::CallOnDrop;
use crate::Error;

// Inner `Result` is the computation's outcome, shared by value with every
// waiter; the channel itself erroring means the computation went away.
type ComputationChannel<V> = Shared<oneshot::Receiver<Result<V, Error>>>;

type ComputationMap<V> = Arc<Mutex<HashMap<String, ComputationChannel<V>>>>;

/// In-process single-flight suppression.
///
/// Maps an in-progress key to a shared rendezvous. The first caller for a key
/// becomes the leader and runs the computation on its own task; everyone
/// arriving before completion joins the leader's channel instead of computing.
pub(crate) struct Singleflight<V> {
    current_computations: ComputationMap<V>,
}

enum Role<V> {
    Leader(oneshot::Sender<Result<V, Error>>),
    Waiter(ComputationChannel<V>),
}

impl<V> Singleflight<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Singleflight {
            current_computations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `compute` for `key`, unless a computation for that key is already
    /// in flight, in which case its result is awaited and shared.
    ///
    /// The computation runs on a spawned task: no caller dropping its future,
    /// the leader included, cancels the computation for the others. If the
    /// computation panics, the in-flight record is still removed, the panic
    /// resumes on the leader's caller, and waiters observe
    /// [`Error::Canceled`].
    pub async fn run<F, Fut>(&self, key: &str, compute: F) -> Result<V, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, Error>> + Send + 'static,
    {
        let role = {
            let mut current = self.current_computations.lock();
            match current.get(key) {
                Some(channel) => Role::Waiter(channel.clone()),
                None => {
                    let (sender, receiver) = oneshot::channel();
                    current.insert(key.to_owned(), receiver.shared());
                    Role::Leader(sender)
                }
            }
        };

        match role {
            Role::Waiter(channel) => {
                metric!(counter("debouncer.channel.hit") += 1);
                match channel.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Canceled),
                }
            }
            Role::Leader(sender) => {
                metric!(counter("debouncer.channel.miss") += 1);

                let future = compute();
                let current_computations = Arc::clone(&self.current_computations);
                let forget_key = key.to_owned();

                let task = tokio::spawn(async move {
                    // Dropped on every exit path, panics included, so the next
                    // caller can always start a fresh computation.
                    let _forget = CallOnDrop::new(move || {
                        current_computations.lock().remove(&forget_key);
                    });

                    let result = future.await;
                    let _ = sender.send(result.clone());
                    result
                });

                match task.await {
                    Ok(result) => result,
                    Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                    Err(_) => Err(Error::Canceled),
                }
            }
        }
    }
}
