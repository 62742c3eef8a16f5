//! A 4-byte mutual exclusion lock.
//!
//! See the [`FutexMutex`] type's documentation for details.
use crate::{
    blocking::RawMutex,
    loom::{
        hint,
        sync::atomic::{fence, AtomicU32, Ordering::*},
    },
    park,
    util::fmt,
};

/// A mutual exclusion lock the size of a single `u32`.
///
/// The entire lock state lives in one 32-bit word: bit 31 records
/// whether the lock is held, and the low 31 bits count acquisition
/// requests, *including* the holder. A thread that fails the fast-path
/// compare-exchange registers itself in the count before it ever
/// sleeps, so [`unlock`] can decide whether a wake syscall is needed
/// with a single atomic subtraction — an uncontended unlock never
/// enters the kernel.
///
/// This is a *raw* lock: it protects no data of its own and has no
/// guard. [`unlock`] is `unsafe`, because the caller must be the thread
/// that acquired the lock. For an RAII interface that owns the data it
/// protects, wrap this type in a [`blocking::Mutex`].
///
/// The lock is not re-entrant: a thread that calls [`lock`] twice
/// without unlocking deadlocks. There is no poisoning and no fairness
/// guarantee; the zero value is a valid, unlocked mutex.
///
/// [`lock`]: Self::lock
/// [`unlock`]: Self::unlock
/// [`blocking::Mutex`]: crate::blocking::Mutex
pub struct FutexMutex {
    word: AtomicU32,
}

/// Set when the lock is held; the low 31 bits count acquisition
/// requests (holder included).
const HOLDER: u32 = 1 << 31;

// === impl FutexMutex ===

impl FutexMutex {
    loom_const_fn! {
        /// Returns a new `FutexMutex`, in the unlocked state.
        #[must_use]
        pub fn new() -> Self {
            Self { word: AtomicU32::new(0) }
        }
    }

    /// Attempts to acquire the lock without blocking or spinning.
    ///
    /// Returns `true` if the lock was acquired. This only succeeds when
    /// the lock is unheld *and* uncontended; a `false` return says
    /// nothing about how long the lock will remain busy.
    #[inline]
    #[cfg_attr(test, track_caller)]
    pub fn try_lock(&self) -> bool {
        test_dbg!(self
            .word
            .compare_exchange(0, HOLDER | 1, Acquire, Relaxed)
            .is_ok())
    }

    /// Acquires the lock, blocking the current thread until it is able
    /// to do so.
    #[inline]
    #[cfg_attr(test, track_caller)]
    pub fn lock(&self) {
        if !self.try_lock() {
            self.lock_contended();
        }
    }

    /// Acquires the lock like [`lock`](Self::lock), but polls the lock
    /// word up to `rounds` times, with a CPU pause hint between polls,
    /// before parking the thread.
    ///
    /// Spinning pays off when critical sections are short enough that
    /// the holder is likely to release within the spin budget, saving
    /// both the park and the matching wake syscall.
    #[inline]
    pub fn spin_lock(&self, rounds: u32) {
        if !self.try_lock() {
            self.spin_lock_contended(rounds);
        }
    }

    /// Registers this thread as a waiter, then sleeps until the holder
    /// bit can be taken.
    #[cold]
    fn lock_contended(&self) {
        let lk = self.word.fetch_add(1, Relaxed) + 1;
        self.park_until_acquired(lk);
    }

    /// As [`lock_contended`](Self::lock_contended), but burns the spin
    /// budget before any park.
    #[cold]
    fn spin_lock_contended(&self, rounds: u32) {
        let mut lk = self.word.fetch_add(1, Relaxed) + 1;

        // With luck, the conflict resolves within the spin budget and
        // both the park and the holder's wake syscall are skipped.
        for _ in 0..rounds {
            if lk & HOLDER != 0 {
                lk = self.word.load(Relaxed);
            } else {
                lk = self.word.fetch_or(HOLDER, Relaxed);
                if lk & HOLDER == 0 {
                    fence(Acquire);
                    return;
                }
                hint::spin_loop();
            }
        }

        self.park_until_acquired(lk);
    }

    /// The park loop. The calling thread must already be counted in the
    /// lock word; `lk` is its most recent observation of the word.
    fn park_until_acquired(&self, mut lk: u32) {
        loop {
            if lk & HOLDER != 0 {
                trace!(lock = ?fmt::ptr(self), lk, "FutexMutex: parking");
                park::park(&self.word, lk);
                lk = self.word.load(Relaxed);
            } else {
                lk = self.word.fetch_or(HOLDER, Relaxed);
                if lk & HOLDER == 0 {
                    // `lk` must still count this thread's registration.
                    debug_assert!(lk != 0);
                    fence(Acquire);
                    return;
                }
                // Another waiter won the race; `lk` has the holder bit
                // set, so the next iteration parks.
            }
        }
    }

    /// Releases the lock, waking one parked waiter if any thread is
    /// waiting.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock, i.e. this call must be
    /// paired with exactly one successful [`lock`], [`spin_lock`], or
    /// [`try_lock`].
    ///
    /// [`lock`]: Self::lock
    /// [`spin_lock`]: Self::spin_lock
    /// [`try_lock`]: Self::try_lock
    #[inline]
    #[cfg_attr(test, track_caller)]
    pub unsafe fn unlock(&self) {
        let prev = test_dbg!(self.word.fetch_sub(HOLDER | 1, Release));
        debug_assert!(prev & HOLDER != 0, "unlocked a FutexMutex that was not held");
        debug_assert!(prev & !HOLDER != 0, "lock word lost the holder's request count");
        if prev != (HOLDER | 1) {
            park::unpark_one(&self.word);
        }
    }

    /// Returns `true` if the lock is currently held by some thread.
    ///
    /// The answer may be stale as soon as it is produced; this is a
    /// heuristic for diagnostics and [lock elision](crate::elision),
    /// never a synchronization mechanism.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.load(Acquire) & HOLDER != 0
    }

    /// Returns `true` if the lock is held *or* any thread is waiting to
    /// acquire it.
    ///
    /// Like [`is_locked`](Self::is_locked), this is advisory only.
    #[inline]
    #[must_use]
    pub fn is_contended(&self) -> bool {
        self.word.load(Acquire) != 0
    }
}

impl Default for FutexMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FutexMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Snapshot the word once so the two fields can't disagree.
        let word = self.word.load(Relaxed);
        f.debug_struct("FutexMutex")
            .field("held", &(word & HOLDER != 0))
            .field("waiting", &(word & !HOLDER))
            .finish()
    }
}

unsafe impl RawMutex for FutexMutex {
    type GuardMarker = ();

    #[inline]
    #[cfg_attr(test, track_caller)]
    fn lock(&self) {
        FutexMutex::lock(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    fn try_lock(&self) -> bool {
        FutexMutex::try_lock(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    unsafe fn unlock(&self) {
        FutexMutex::unlock(self)
    }

    #[inline]
    fn is_locked(&self) -> bool {
        FutexMutex::is_locked(self)
    }

    #[inline]
    fn is_contended(&self) -> bool {
        FutexMutex::is_contended(self)
    }
}

feature! {
    #![all(feature = "lock_api", not(loom))]

    unsafe impl lock_api::RawMutex for FutexMutex {
        // As usual, clippy is totally wrong about this --- the whole point of
        // this constant is to create a *new* mutex every time.
        #[allow(clippy::declare_interior_mutable_const)]
        const INIT: Self = Self::new();

        type GuardMarker = lock_api::GuardSend;

        #[inline]
        fn lock(&self) {
            FutexMutex::lock(self)
        }

        #[inline]
        fn try_lock(&self) -> bool {
            FutexMutex::try_lock(self)
        }

        #[inline]
        unsafe fn unlock(&self) {
            FutexMutex::unlock(self)
        }

        #[inline]
        fn is_locked(&self) -> bool {
            FutexMutex::is_locked(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, thread};
    use std::sync::Arc;

    // loom's simulated atomics are much larger than the real ones.
    #[test]
    #[cfg(not(loom))]
    fn is_one_word() {
        assert_eq!(core::mem::size_of::<FutexMutex>(), 4);
    }

    #[test]
    fn try_lock() {
        loom::model(|| {
            let mutex = FutexMutex::new();

            assert!(mutex.try_lock());
            // a second acquisition must fail while the lock is held.
            assert!(!mutex.try_lock());
            assert!(mutex.is_locked());

            unsafe { mutex.unlock() };
            assert!(!mutex.is_contended());
            assert!(mutex.try_lock());
            unsafe { mutex.unlock() };
        });
    }

    #[test]
    fn multithreaded() {
        loom::model(|| {
            let mutex = Arc::new(crate::blocking::Mutex::<usize>::new(0));
            let threads = (0..2)
                .map(|_| {
                    let mutex = mutex.clone();
                    thread::spawn(move || {
                        *mutex.lock() += 1;
                    })
                })
                .collect::<Vec<_>>();

            for thread in threads {
                thread.join().unwrap();
            }

            assert_eq!(*mutex.lock(), 2);
        });
    }

    #[cfg(not(loom))]
    mod stress {
        use super::*;

        const THREADS: usize = 30;
        const ITERS: usize = 10_000;

        #[test]
        fn mutual_exclusion() {
            let _trace = crate::util::test::trace_init();
            let mutex = FutexMutex::new();
            let critical = core::cell::UnsafeCell::new(false);
            // the mutex serializes all access to `critical`.
            struct Critical<'a>(&'a core::cell::UnsafeCell<bool>);
            unsafe impl Sync for Critical<'_> {}
            let critical = Critical(&critical);

            std::thread::scope(|scope| {
                for _ in 0..THREADS {
                    let mutex = &mutex;
                    let critical = &critical;
                    scope.spawn(move || {
                        for _ in 0..ITERS {
                            mutex.lock();
                            unsafe {
                                assert!(!*critical.0.get(), "two threads in the critical section");
                                *critical.0.get() = true;
                                *critical.0.get() = false;
                            }
                            unsafe { mutex.unlock() };
                        }
                    });
                }
            });

            assert!(!mutex.is_contended());
            assert!(!unsafe { *critical.0.get() });
        }

        #[test]
        fn spin_lock_mutual_exclusion() {
            let _trace = crate::util::test::trace_init();
            let mutex = Arc::new(FutexMutex::new());
            let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

            let threads = (0..THREADS)
                .map(|_| {
                    let mutex = mutex.clone();
                    let counter = counter.clone();
                    std::thread::spawn(move || {
                        for _ in 0..1000 {
                            mutex.spin_lock(50);
                            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            unsafe { mutex.unlock() };
                        }
                    })
                })
                .collect::<Vec<_>>();
            for thread in threads {
                thread.join().unwrap();
            }

            assert_eq!(
                counter.load(std::sync::atomic::Ordering::Relaxed),
                THREADS * 1000
            );
            assert!(!mutex.is_contended());
        }

        #[test]
        fn unlock_wakes_parked_waiter() {
            let _trace = crate::util::test::trace_init();
            let mutex = Arc::new(FutexMutex::new());

            mutex.lock();
            let waiter = {
                let mutex = mutex.clone();
                std::thread::spawn(move || {
                    // parks until the main thread unlocks.
                    mutex.lock();
                    unsafe { mutex.unlock() };
                })
            };
            // give the waiter a chance to actually park, so that the
            // wake path is (usually) exercised rather than the fast
            // path. the test remains correct either way.
            while mutex.word.load(Relaxed) & !HOLDER < 2 {
                std::thread::yield_now();
            }
            std::thread::yield_now();
            unsafe { mutex.unlock() };

            waiter.join().unwrap();
            assert!(!mutex.is_contended());
        }
    }
}
