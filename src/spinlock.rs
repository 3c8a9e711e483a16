use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::Error;

const UNLOCKED: i32 = 0;
const LOCKED: i32 = -1;

// Spin briefly before handing the slot back to the scheduler.
const SPIN_THRESHOLD: u32 = 2;
const SPIN_TIMEOUT: Duration = Duration::from_nanos(50);

/// A spinlock with a post-release cool-down window.
///
/// [`try_lock`](DebounceLock::try_lock) refuses both while the lock is held
/// and for `duration` after the last [`unlock`](DebounceLock::unlock). The
/// cool-down is what turns the lock into a debouncing primitive: the winner
/// of a burst runs, everyone else in the burst is refused and reads the
/// winner's result instead.
pub struct DebounceLock {
    state: AtomicI32,
    cooldown: Mutex<Option<Instant>>,
    duration: Duration,
}

impl DebounceLock {
    /// Creates an unlocked lock with the given cool-down window.
    pub fn new(duration: Duration) -> Self {
        DebounceLock {
            state: AtomicI32::new(UNLOCKED),
            cooldown: Mutex::new(None),
            duration,
        }
    }

    /// A non-blocking attempt to take the lock.
    ///
    /// Returns `false` while the lock is held and during the cool-down
    /// window following a release.
    pub fn try_lock(&self) -> bool {
        if let Some(until) = *self.cooldown.lock() {
            if Instant::now() < until {
                return false;
            }
        }
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Waits until the lock can be taken, then takes it.
    pub fn lock(&self) {
        wait(|| self.try_lock());
    }

    /// Releases the lock and starts the cool-down window.
    ///
    /// # Panics
    ///
    /// Panics when the lock is not currently held; unlocking an unlocked
    /// lock is a programming error.
    pub fn unlock(&self) {
        *self.cooldown.lock() = Some(Instant::now() + self.duration);

        if self
            .state
            .compare_exchange(LOCKED, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            panic!("unlock of an unlocked DebounceLock");
        }
    }

    /// Returns `true` while no caller holds the lock.
    pub fn is_unlocked(&self) -> bool {
        self.state.load(Ordering::Acquire) == UNLOCKED
    }

    /// Blocks until the current holder releases the lock.
    ///
    /// Returns immediately when the lock is not held, cool-down or not.
    pub fn wait_unlocked(&self) {
        wait(|| self.is_unlocked());
    }
}

fn wait(mut ready: impl FnMut() -> bool) {
    let mut spins = 0;
    while !ready() {
        if spins < SPIN_THRESHOLD {
            thread::sleep(SPIN_TIMEOUT);
            spins += 1;
            continue;
        }
        thread::yield_now();
    }
}

/// A single-closure debouncer.
///
/// Unlike the keyed [`Debouncer`](crate::Debouncer) this guards exactly one
/// computation: whoever wins [`DebounceLock::try_lock`] runs the closure and
/// stores its outcome; callers arriving while it runs, or within the
/// cool-down window after it finishes, receive the stored outcome instead of
/// running the closure again.
pub struct Debounce<V> {
    lock: DebounceLock,
    last: Mutex<Option<Result<V, Error>>>,
}

impl<V> Debounce<V>
where
    V: Clone,
{
    /// Creates a debouncer with the given cool-down window.
    pub fn new(duration: Duration) -> Self {
        Debounce {
            lock: DebounceLock::new(duration),
            last: Mutex::new(None),
        }
    }

    /// Runs `closure`, or returns the previous outcome when inside the
    /// cool-down window or while another caller is already running it.
    ///
    /// Blocks for at most the runtime of the closure.
    pub fn debounce<F>(&self, closure: F) -> Result<V, Error>
    where
        F: FnOnce() -> anyhow::Result<V>,
    {
        if self.lock.try_lock() {
            let result = closure().map_err(Error::computation);
            *self.last.lock() = Some(result.clone());
            self.lock.unlock();
            return result;
        }

        self.lock.wait_unlocked();
        self.last.lock().clone().unwrap_or(Err(Error::Canceled))
    }
}
