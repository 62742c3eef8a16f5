use super::*;
use crate::util::test::assert_send_sync;

#[test]
fn lock_is_send_sync() {
    assert_send_sync::<RecursiveSharedLock>();
}

#[test]
fn owner_ids_are_stable_and_unique() {
    let a = OwnerId::current();
    let b = OwnerId::current();
    assert_eq!(a, b);

    let other = std::thread::spawn(OwnerId::current).join().unwrap();
    assert_ne!(a, other);
}

// loom's simulated atomics are much larger than the real ones.
#[test]
#[cfg(not(loom))]
fn fits_three_words() {
    // the embedded lock, the recursion counter, and the owner word.
    assert_eq!(core::mem::size_of::<RecursiveSharedLock>(), 24);
}

#[test]
fn exclusive_reentry() {
    crate::loom::model(|| {
        let lock = RecursiveSharedLock::new();
        assert!(lock.is_vacant());

        lock.lock_exclusive();
        assert!(lock.owns_exclusive());
        for _ in 0..100 {
            lock.lock_exclusive();
        }
        for _ in 0..100 {
            unsafe { lock.unlock_exclusive() };
        }
        // still held: the outermost hold remains.
        assert!(lock.owns_exclusive());
        unsafe { lock.unlock_exclusive() };

        assert!(lock.is_vacant());
        assert!(!lock.owns_write());
    });
}

#[test]
fn update_reentry_and_upgrade() {
    crate::loom::model(|| {
        let lock = RecursiveSharedLock::new();

        lock.lock_update();
        lock.lock_update();
        assert!(lock.owns_update());
        assert!(!lock.owns_exclusive());

        // the upgrade converts *both* update holds into exclusive
        // holds...
        unsafe { lock.upgrade() };
        assert!(lock.owns_exclusive());

        // ...so one of them can be released as an exclusive hold...
        unsafe { lock.unlock_exclusive() };
        assert!(lock.owns_exclusive());

        // ...and the last one can be downgraded back to update.
        unsafe { lock.downgrade() };
        assert!(lock.owns_update());
        unsafe { lock.unlock_update() };

        assert!(lock.is_vacant());
    });
}

#[test]
fn lock_exclusive_or_upgrade() {
    crate::loom::model(|| {
        let lock = RecursiveSharedLock::new();

        // from unheld: a plain exclusive acquisition.
        assert!(!lock.lock_exclusive_or_upgrade());
        // from exclusive: plain re-entry.
        assert!(!lock.lock_exclusive_or_upgrade());
        unsafe {
            lock.unlock_exclusive();
            lock.unlock_exclusive();
        }

        // from update: converts the nest and reports the upgrade.
        lock.lock_update();
        assert!(lock.lock_exclusive_or_upgrade());
        assert!(lock.owns_exclusive());
        unsafe { lock.unlock_exclusive() };

        assert!(lock.is_vacant());
    });
}

#[test]
fn try_lock_modes() {
    crate::loom::model(|| {
        let lock = RecursiveSharedLock::new();

        assert!(lock.try_lock_update());
        // re-entry always succeeds for the owner.
        assert!(lock.try_lock_update());
        unsafe {
            lock.unlock_update();
            lock.unlock_update();
        }

        assert!(lock.try_lock_exclusive());
        assert!(lock.try_lock_exclusive());
        unsafe {
            lock.unlock_exclusive();
            lock.unlock_exclusive();
        }

        // shared holds pass straight through and block the write modes'
        // try paths.
        assert!(lock.try_lock_shared());
        assert!(!lock.try_lock_exclusive());
        assert!(lock.try_lock_update());
        unsafe {
            lock.unlock_update();
            lock.unlock_shared();
        }

        assert!(lock.is_vacant());
    });
}

#[cfg(not(loom))]
mod stress {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc,
    };

    /// The shape of the original mixed-mode reentrancy stress: each
    /// thread nests exclusive holds, takes shared locks, and runs
    /// doubly-nested update/upgrade cycles, all while checking a
    /// critical flag that only exclusive sections may set.
    #[test]
    fn reentrant_all_modes() {
        const THREADS: usize = 30;
        const ROUNDS: usize = 20;
        const DEPTH: usize = 50;

        let _trace = crate::util::test::trace_init();
        let lock = RecursiveSharedLock::new();
        let critical = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..ROUNDS {
                        lock.lock_exclusive();
                        assert!(!critical.load(Relaxed));
                        critical.store(true, Relaxed);
                        for _ in 0..DEPTH {
                            lock.lock_exclusive();
                        }
                        for _ in 0..DEPTH {
                            unsafe { lock.unlock_exclusive() };
                        }
                        assert!(critical.load(Relaxed));
                        critical.store(false, Relaxed);
                        unsafe { lock.unlock_exclusive() };

                        for _ in 0..DEPTH {
                            lock.lock_shared();
                            assert!(!critical.load(Relaxed));
                            unsafe { lock.unlock_shared() };
                        }

                        for _ in 0..DEPTH / 2 {
                            lock.lock_update();
                            assert!(!critical.load(Relaxed));
                            lock.lock_update();
                            unsafe { lock.upgrade() };
                            assert!(!critical.load(Relaxed));
                            critical.store(true, Relaxed);
                            unsafe { lock.unlock_exclusive() };
                            assert!(critical.load(Relaxed));
                            critical.store(false, Relaxed);
                            unsafe { lock.downgrade() };
                            unsafe { lock.unlock_update() };
                        }
                    }
                });
            }
        });

        assert!(lock.is_vacant());
    }

    /// A lock acquired disowned on one thread may be claimed and
    /// released on another, while the lock is held the whole time.
    #[test]
    fn ownership_transfer() {
        let _trace = crate::util::test::trace_init();
        let lock = Arc::new(RecursiveSharedLock::new());

        lock.lock_exclusive_disowned();
        assert!(!lock.owns_write(), "a disowned hold has no owner");

        let other = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                unsafe { lock.claim() };
                assert!(lock.owns_exclusive());
                // the claimant can re-enter like any owner.
                lock.lock_exclusive();
                unsafe {
                    lock.unlock_exclusive();
                    lock.unlock_exclusive();
                }
            })
        };
        other.join().unwrap();

        assert!(lock.is_vacant());
    }

    /// A single disowned hold may be released without ever being
    /// claimed, from any thread.
    #[test]
    fn disowned_release() {
        let _trace = crate::util::test::trace_init();
        let lock = Arc::new(RecursiveSharedLock::new());

        lock.lock_update_disowned();

        let other = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                assert!(!lock.owns_write());
                unsafe { lock.unlock_update() };
            })
        };
        other.join().unwrap();

        assert!(lock.is_vacant());

        // the same works in the exclusive mode, via the try path.
        assert!(lock.try_lock_exclusive_disowned());
        unsafe { lock.unlock_exclusive() };
        assert!(lock.is_vacant());
    }

    /// An owner may disown mid-hold and appoint a specific successor.
    #[test]
    fn set_owner_hands_off() {
        let _trace = crate::util::test::trace_init();
        let lock = Arc::new(RecursiveSharedLock::new());
        let main_id = OwnerId::current();

        lock.lock_update();
        assert!(lock.owns_update());
        unsafe { lock.disown() };
        assert!(!lock.owns_write());

        let other = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                unsafe { lock.set_owner(OwnerId::current()) };
                assert!(lock.owns_update());
                // hand it straight back.
                unsafe { lock.set_owner(main_id) };
            })
        };
        other.join().unwrap();

        assert!(lock.owns_update());
        unsafe { lock.unlock_update() };
        assert!(lock.is_vacant());
    }

    /// Disowned holds still exclude other writers.
    #[test]
    fn disowned_still_excludes() {
        let _trace = crate::util::test::trace_init();
        let lock = RecursiveSharedLock::new();

        lock.lock_update_disowned();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                assert!(!lock.try_lock_update());
                assert!(!lock.try_lock_exclusive());
                // but shared access is still allowed under an update
                // hold.
                assert!(lock.try_lock_shared());
                unsafe { lock.unlock_shared() };
            });
        });
        unsafe { lock.unlock_update() };

        assert!(lock.is_vacant());
    }
}
