//! A 4-byte condition variable.
//!
//! See the [`Condvar`] type's documentation for details.
use crate::{
    blocking::{MutexGuard, RawMutex, RawSharedLock, RwLockReadGuard, RwLockUpdateGuard},
    loom::sync::atomic::{AtomicU32, Ordering::*},
    park,
    util::fmt,
};

/// A condition variable in a single `u32`, usable with every hold mode
/// of this crate's locks.
///
/// The word counts `wait` calls begun since the last signal, so that
/// [`signal`] and [`broadcast`] can tell — with one atomic swap —
/// whether any wake syscall is needed at all. Signaling with no waiters
/// is a single uncontended atomic operation.
///
/// Unusually, a waiter may hold its lock in *any* mode: [`wait`] pairs
/// with a [`Mutex`](crate::blocking::Mutex) or exclusive lock, while
/// [`wait_shared`] and [`wait_update`] let a thread wait while holding
/// the shared or update mode of a
/// [`RwLock`](crate::blocking::RwLock) — something the standard
/// library's condition variable cannot express at all.
///
/// # Spurious wakeups and coalescing
///
/// As with every condition variable, a waiter can wake spuriously, and
/// concurrent signals coalesce: the signal path consumes the *entire*
/// pending-wait count, not one unit of it. Waiters must therefore
/// always re-check their predicate in a loop; the guard-based `wait_*`
/// methods make the relock for that re-check automatic. A consequence
/// of coalescing is that [`signal`] promises to wake at least one of
/// the waiters *present at the swap*; handing one wakeup to each of
/// several already-parked waiters requires [`broadcast`].
///
/// The zero value is a valid condition variable with no waiters.
///
/// # Examples
///
/// ```
/// use enoki_sync::{Condvar, Mutex};
/// use std::sync::Arc;
///
/// let pending = Arc::new(Mutex::new(0_usize));
/// let cv = Arc::new(Condvar::new());
///
/// let worker = {
///     let (pending, cv) = (pending.clone(), cv.clone());
///     std::thread::spawn(move || {
///         let mut guard = pending.lock();
///         while *guard == 0 {
///             guard = cv.wait(guard);
///         }
///         *guard -= 1;
///     })
/// };
///
/// *pending.lock() += 1;
/// cv.broadcast();
/// worker.join().unwrap();
/// assert_eq!(*pending.lock(), 0);
/// ```
///
/// [`signal`]: Self::signal
/// [`broadcast`]: Self::broadcast
/// [`wait`]: Self::wait
/// [`wait_shared`]: Self::wait_shared
/// [`wait_update`]: Self::wait_update
pub struct Condvar {
    /// Counts `wait` calls begun since the last signal or broadcast.
    waiters: AtomicU32,
}

// === impl Condvar ===

impl Condvar {
    loom_const_fn! {
        /// Returns a new `Condvar` with no waiters.
        #[must_use]
        pub fn new() -> Self {
            Self { waiters: AtomicU32::new(0) }
        }
    }

    /// Releases `guard`'s mutex, waits to be signaled, and reacquires
    /// the mutex before returning a new guard.
    ///
    /// The wakeup may be spurious, so the caller must re-check its
    /// predicate and call `wait` again in a loop if the predicate does
    /// not hold.
    pub fn wait<'a, T, L: RawMutex>(&self, guard: MutexGuard<'a, T, L>) -> MutexGuard<'a, T, L> {
        let (ptr, lock) = guard.into_raw_parts();
        unsafe {
            // Safety: the dissolved guard proved that the lock is held
            // by this thread.
            self.wait_raw(lock);
        }
        MutexGuard::from_raw_parts(ptr, lock)
    }

    /// Releases `guard`'s *shared* lock, waits to be signaled, and
    /// reacquires the shared lock before returning a new guard.
    ///
    /// As with [`wait`](Self::wait), wakeups may be spurious.
    pub fn wait_shared<'a, T, L: RawSharedLock>(
        &self,
        guard: RwLockReadGuard<'a, T, L>,
    ) -> RwLockReadGuard<'a, T, L> {
        let (ptr, lock) = guard.into_raw_parts();
        unsafe {
            // Safety: the dissolved guard proved that a shared lock is
            // held by this thread.
            self.wait_shared_raw(lock);
        }
        RwLockReadGuard::from_raw_parts(ptr, lock)
    }

    /// Releases `guard`'s *update* lock, waits to be signaled, and
    /// reacquires the update lock before returning a new guard.
    ///
    /// As with [`wait`](Self::wait), wakeups may be spurious.
    pub fn wait_update<'a, T, L: RawSharedLock>(
        &self,
        guard: RwLockUpdateGuard<'a, T, L>,
    ) -> RwLockUpdateGuard<'a, T, L> {
        let rwlock = guard.into_rwlock();
        unsafe {
            // Safety: the dissolved guard proved that the update lock
            // is held by this thread.
            self.wait_update_raw(rwlock.raw());
        }
        RwLockUpdateGuard::from_rwlock(rwlock)
    }

    /// Releases `mutex`, waits to be signaled, and reacquires it.
    ///
    /// This is the raw form of [`wait`](Self::wait), for use with bare
    /// lock types.
    ///
    /// # Safety
    ///
    /// The calling thread must hold `mutex`.
    pub unsafe fn wait_raw<L: RawMutex>(&self, mutex: &L) {
        let expected = self.begin_wait();
        trace!(condvar = ?fmt::ptr(self), expected, "Condvar: parking");
        mutex.unlock();
        park::park(&self.waiters, expected);
        mutex.lock();
    }

    /// Releases a shared lock on `lock`, waits to be signaled, and
    /// reacquires a shared lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold a shared lock on `lock`.
    pub unsafe fn wait_shared_raw<L: RawSharedLock>(&self, lock: &L) {
        let expected = self.begin_wait();
        lock.unlock_shared();
        park::park(&self.waiters, expected);
        lock.lock_shared();
    }

    /// Releases the update lock on `lock`, waits to be signaled, and
    /// reacquires the update lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the update lock on `lock`.
    pub unsafe fn wait_update_raw<L: RawSharedLock>(&self, lock: &L) {
        let expected = self.begin_wait();
        lock.unlock_update();
        park::park(&self.waiters, expected);
        lock.lock_update();
    }

    /// Registers a wait that is about to begin, returning the word
    /// value to park against.
    ///
    /// The registration must happen *before* the lock is released: a
    /// signaler that observes our update to the predicate is then
    /// guaranteed to also observe a nonzero waiter count, so its wake
    /// cannot be skipped.
    fn begin_wait(&self) -> u32 {
        test_dbg!(self.waiters.fetch_add(1, Acquire)) + 1
    }

    /// Wakes one waiter, if any thread is waiting.
    ///
    /// All waits registered up to this point are consumed: a subsequent
    /// `signal` is a no-op until some thread waits again. To wake every
    /// currently-parked waiter, use [`broadcast`](Self::broadcast).
    pub fn signal(&self) {
        if test_dbg!(self.waiters.swap(0, Release)) != 0 {
            park::unpark_one(&self.waiters);
        }
    }

    /// Wakes all current waiters.
    pub fn broadcast(&self) {
        if test_dbg!(self.waiters.swap(0, Release)) != 0 {
            park::unpark_all(&self.waiters);
        }
    }

    /// Returns `true` if any thread is waiting (or beginning to wait)
    /// on this condition variable.
    ///
    /// This is a snapshot for diagnostics and wake-avoidance
    /// heuristics; it is not synchronized with concurrent waits.
    #[inline]
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.waiters.load(Acquire) != 0
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiters.load(Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test::assert_send_sync;

    #[test]
    fn condvar_is_send_sync() {
        assert_send_sync::<Condvar>();
    }

    // loom's simulated atomics are much larger than the real ones.
    #[test]
    #[cfg(not(loom))]
    fn is_one_word() {
        assert_eq!(core::mem::size_of::<Condvar>(), 4);
    }

    #[test]
    fn signal_without_waiters_is_a_noop() {
        crate::loom::model(|| {
            let cv = Condvar::new();
            assert!(!cv.is_waiting());
            cv.signal();
            cv.broadcast();
            assert!(!cv.is_waiting());
        });
    }

    // a wait that begins before the signal's swap is either woken or
    // re-observes the predicate; a wait that begins after it sees the
    // predicate already set. either way, the waiter terminates.
    #[test]
    fn signal_vs_wait() {
        use crate::{loom::thread, mutex::FutexMutex};
        use std::sync::{
            atomic::{AtomicUsize, Ordering::Relaxed},
            Arc,
        };

        crate::loom::model(|| {
            let mutex = Arc::new(FutexMutex::new());
            let cv = Arc::new(Condvar::new());
            let flag = Arc::new(AtomicUsize::new(0));

            let signaler = {
                let (mutex, cv, flag) = (mutex.clone(), cv.clone(), flag.clone());
                thread::spawn(move || {
                    mutex.lock();
                    flag.store(1, Relaxed);
                    unsafe { mutex.unlock() };
                    cv.signal();
                })
            };

            mutex.lock();
            while flag.load(Relaxed) == 0 {
                unsafe {
                    // Safety: the mutex is held here, and reacquired by
                    // the time the wait returns.
                    cv.wait_raw(&*mutex);
                }
            }
            unsafe { mutex.unlock() };

            signaler.join().unwrap();
        });
    }

    #[cfg(not(loom))]
    mod stress {
        use super::*;
        use crate::blocking::{Mutex, RwLock};
        use std::sync::Arc;

        const THREADS: usize = 30;

        #[test]
        fn signal_wakes_single_waiter() {
            let _trace = crate::util::test::trace_init();
            let pending = Arc::new(Mutex::new(0_usize));
            let cv = Arc::new(Condvar::new());

            let waiter = {
                let (pending, cv) = (pending.clone(), cv.clone());
                std::thread::spawn(move || {
                    let mut guard = pending.lock();
                    while *guard == 0 {
                        guard = cv.wait(guard);
                    }
                    *guard -= 1;
                })
            };

            *pending.lock() += 1;
            cv.signal();
            waiter.join().unwrap();

            assert_eq!(*pending.lock(), 0);
            assert!(!cv.is_waiting());
        }

        /// A producer hands one unit of work at a time to a crowd of
        /// consumers. Waits registered concurrently with a wakeup
        /// coalesce, so the producer broadcasts: every parked consumer
        /// rechecks, one consumes, and the rest re-register.
        #[test]
        fn producer_consumers() {
            let _trace = crate::util::test::trace_init();
            let pending = Arc::new(Mutex::new(0_usize));
            let cv = Arc::new(Condvar::new());

            let consumers = (0..THREADS)
                .map(|_| {
                    let (pending, cv) = (pending.clone(), cv.clone());
                    std::thread::spawn(move || {
                        let mut guard = pending.lock();
                        while *guard == 0 {
                            guard = cv.wait(guard);
                        }
                        *guard -= 1;
                    })
                })
                .collect::<Vec<_>>();

            for _ in 0..THREADS {
                *pending.lock() += 1;
                cv.broadcast();
            }

            for consumer in consumers {
                consumer.join().unwrap();
            }

            assert_eq!(*pending.lock(), 0);
            assert!(!cv.is_waiting());
        }

        #[test]
        fn broadcast_under_shared_wait() {
            let _trace = crate::util::test::trace_init();
            let lock = Arc::new(RwLock::new(false));
            let cv = Arc::new(Condvar::new());

            let waiters = (0..THREADS)
                .map(|_| {
                    let (lock, cv) = (lock.clone(), cv.clone());
                    std::thread::spawn(move || {
                        let mut guard = lock.read();
                        while !*guard {
                            guard = cv.wait_shared(guard);
                        }
                    })
                })
                .collect::<Vec<_>>();

            {
                let mut guard = lock.write();
                *guard = true;
            }
            cv.broadcast();

            for waiter in waiters {
                waiter.join().unwrap();
            }
            assert!(!cv.is_waiting());
        }

        #[test]
        fn wait_under_update_lock() {
            let _trace = crate::util::test::trace_init();
            let lock = Arc::new(RwLock::new(false));
            let cv = Arc::new(Condvar::new());

            let waiter = {
                let (lock, cv) = (lock.clone(), cv.clone());
                std::thread::spawn(move || {
                    let mut guard = lock.update();
                    while !*guard {
                        guard = cv.wait_update(guard);
                    }
                    // the update guard is still good for an upgrade.
                    let mut write = guard.upgrade();
                    *write = false;
                })
            };

            // readers coexist with the waiter's update lock, and the
            // wait window leaves the update mode free for us to take
            // and release.
            {
                let mut guard = lock.write();
                *guard = true;
            }
            cv.broadcast();

            waiter.join().unwrap();
            assert!(!*lock.read());
            assert!(!cv.is_waiting());
        }
    }
}
