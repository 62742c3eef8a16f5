//! An 8-byte lock with shared, update, and exclusive access modes.
//!
//! See the [`SharedLock`] type's documentation for details.
use crate::{
    blocking::RawSharedLock,
    loom::sync::atomic::{AtomicU32, Ordering::*},
    mutex::FutexMutex,
    park,
    util::fmt,
};

/// A reader-writer lock with a third, *update*, mode, in two 32-bit
/// words.
///
/// # Modes
///
/// - **Shared**: any number of shared holders may coexist, as with the
///   read mode of an ordinary rw-lock.
/// - **Update**: at most one update holder at a time, but shared
///   holders may coexist with it. An update holder may [`upgrade`] in
///   place to exclusive without releasing, which an ordinary rw-lock
///   cannot express without a race.
/// - **Exclusive**: excludes everything, as with the write mode of an
///   ordinary rw-lock. An exclusive holder may [`downgrade`] to update
///   mode.
///
/// Once a thread has *requested* exclusive access, new shared
/// acquisitions block until the exclusive lock has been granted and
/// released, so a steady stream of readers cannot starve a writer
/// indefinitely. No other fairness is guaranteed.
///
/// # How it works
///
/// The lock is a composition of two words. The embedded [`FutexMutex`]
/// gate serializes update and exclusive acquisition and is held for the
/// whole tenure of an update or exclusive lock. The `state` word packs
/// an exclusive-intent bit with a count of shared holders (the update
/// holder, which coexists with them, is counted as one of the shared
/// holders). An exclusive requester first takes the gate, then sets the
/// intent bit and sleeps on `state` until the shared holders have
/// drained; the last shared holder to leave during such a drain issues
/// the single wake. Shared waiters never sleep on `state` at all: they
/// queue on the gate instead, which guarantees the blocking exclusive
/// holder has made progress before they retry.
///
/// This is a *raw* lock: it protects no data and its release and
/// conversion operations are `unsafe`, with the obvious contract that
/// the calling thread actually holds the mode in question. The
/// [`blocking::RwLock`](crate::blocking::RwLock) wrapper provides the
/// safe RAII interface. The zero value is a valid, unlocked instance.
///
/// [`upgrade`]: Self::upgrade
/// [`downgrade`]: Self::downgrade
pub struct SharedLock {
    /// Exclusive-intent bit plus the count of shared/update holders.
    state: AtomicU32,
    /// Serializes update/exclusive acquisition; held continuously by
    /// the update or exclusive holder.
    gate: FutexMutex,
}

/// The exclusive-intent bit. The exclusive lock is held exactly when
/// `state == X`; `state & X != 0` with a nonzero low half means shared
/// holders are still draining.
const X: u32 = 1 << 31;

// === impl SharedLock ===

impl SharedLock {
    loom_const_fn! {
        /// Returns a new `SharedLock`, unlocked in every mode.
        #[must_use]
        pub fn new() -> Self {
            Self {
                state: AtomicU32::new(0),
                gate: FutexMutex::new(),
            }
        }
    }

    /// Attempts to acquire a shared lock without blocking.
    ///
    /// Fails if an exclusive lock is held *or requested*; shared and
    /// update holders do not block this.
    #[cfg_attr(test, track_caller)]
    pub fn try_lock_shared(&self) -> bool {
        let mut lk = 0;
        loop {
            match self
                .state
                .compare_exchange_weak(lk, lk + 1, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(actual) if actual & X != 0 => return false,
                Err(actual) => lk = actual,
            }
        }
    }

    /// Acquires a shared lock, blocking while an exclusive lock is held
    /// or requested.
    #[cfg_attr(test, track_caller)]
    pub fn lock_shared(&self) {
        if !self.try_lock_shared() {
            self.lock_shared_contended();
        }
    }

    /// A blocked shared acquisition queues on the gate rather than
    /// sleeping on `state`: once the gate is granted, the exclusive
    /// holder that blocked us is guaranteed to have released.
    #[cold]
    fn lock_shared_contended(&self) {
        trace!(lock = ?fmt::ptr(self), "SharedLock: shared acquisition blocked");
        loop {
            self.gate.lock();
            let acquired = self.try_lock_shared();
            unsafe { self.gate.unlock() };
            if acquired {
                return;
            }
        }
    }

    /// Releases a shared lock.
    ///
    /// If this was the last shared holder blocking a pending exclusive
    /// acquisition, the exclusive requester is woken.
    ///
    /// # Safety
    ///
    /// The calling thread must hold a shared lock.
    #[cfg_attr(test, track_caller)]
    pub unsafe fn unlock_shared(&self) {
        let prev = test_dbg!(self.state.fetch_sub(1, Release));
        debug_assert!(prev & !X != 0, "unlocked a SharedLock with no shared holders");
        if prev == X + 1 {
            // the drain is complete; this is the only path that wakes
            // an exclusive requester sleeping on `state`.
            park::unpark_one(&self.state);
        }
    }

    /// Attempts to acquire the update lock without blocking.
    ///
    /// Fails if another thread holds the update or exclusive lock (or
    /// is waiting to); shared holders do not block this.
    #[cfg_attr(test, track_caller)]
    pub fn try_lock_update(&self) -> bool {
        if !self.gate.try_lock() {
            return false;
        }
        let prev = self.state.fetch_add(1, Acquire);
        debug_assert!(prev < X - 1);
        true
    }

    /// Acquires the update lock, blocking while another thread holds
    /// the update or exclusive lock.
    #[cfg_attr(test, track_caller)]
    pub fn lock_update(&self) {
        self.gate.lock();
        let prev = self.state.fetch_add(1, Acquire);
        debug_assert!(prev < X - 1);
    }

    /// As [`lock_update`](Self::lock_update), but spins on the gate for
    /// up to `rounds` polls before sleeping.
    pub fn lock_update_spin(&self, rounds: u32) {
        self.gate.spin_lock(rounds);
        let prev = self.state.fetch_add(1, Acquire);
        debug_assert!(prev < X - 1);
    }

    /// Releases the update lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the update lock.
    #[cfg_attr(test, track_caller)]
    pub unsafe fn unlock_update(&self) {
        let prev = test_dbg!(self.state.fetch_sub(1, Release));
        debug_assert!(prev != 0, "unlocked a SharedLock that held no update lock");
        debug_assert!(prev & X == 0, "update unlock while the lock was exclusive");
        self.gate.unlock();
    }

    /// Attempts to acquire the exclusive lock without blocking.
    ///
    /// Fails if any lock is held in any mode.
    #[cfg_attr(test, track_caller)]
    pub fn try_lock_exclusive(&self) -> bool {
        if !self.gate.try_lock() {
            return false;
        }
        if self
            .state
            .compare_exchange(0, X, Acquire, Relaxed)
            .is_ok()
        {
            return true;
        }
        // shared holders exist; give the gate back rather than wait.
        unsafe { self.gate.unlock() };
        false
    }

    /// Acquires the exclusive lock, blocking until every other holder,
    /// in every mode, has released.
    #[cfg_attr(test, track_caller)]
    pub fn lock_exclusive(&self) {
        self.gate.lock();
        self.grant_exclusive();
    }

    /// As [`lock_exclusive`](Self::lock_exclusive), but spins on the
    /// gate for up to `rounds` polls before sleeping.
    pub fn lock_exclusive_spin(&self, rounds: u32) {
        self.gate.spin_lock(rounds);
        self.grant_exclusive();
    }

    /// Sets the exclusive-intent bit and waits out the drain. The gate
    /// must already be held.
    fn grant_exclusive(&self) {
        let prev = self.state.fetch_or(X, Acquire);
        debug_assert!(prev & X == 0);
        if prev != 0 {
            self.exclusive_wait(prev);
        }
    }

    /// Sleeps until the last of `lk` shared holders has drained and the
    /// exclusive lock is therefore granted.
    #[cold]
    fn exclusive_wait(&self, lk: u32) {
        debug_assert!(lk != 0);
        let mut lk = lk | X;
        loop {
            debug_assert!(lk > X);
            trace!(
                lock = ?fmt::ptr(self),
                holders = lk & !X,
                "SharedLock: waiting for shared holders to drain",
            );
            park::park(&self.state, lk);
            lk = self.state.load(Acquire);
            if lk == X {
                return;
            }
        }
    }

    /// Releases the exclusive lock.
    ///
    /// No wake on `state` is needed here: a pending exclusive requester
    /// sleeps inside the gate, and pending shared acquisitions queue on
    /// the gate as well.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the exclusive lock.
    #[cfg_attr(test, track_caller)]
    pub unsafe fn unlock_exclusive(&self) {
        debug_assert!(self.is_locked_exclusive());
        self.state.store(0, Release);
        self.gate.unlock();
    }

    /// Upgrades the update lock to exclusive, in place, blocking until
    /// concurrent shared holders have drained.
    ///
    /// New shared acquisitions are blocked from the moment this is
    /// called. The update holder's own count is converted into the
    /// exclusive grant, so a lone update holder upgrades without
    /// waiting.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the update lock.
    #[cfg_attr(test, track_caller)]
    pub unsafe fn upgrade(&self) {
        debug_assert!(self.gate.is_locked());
        let prev = self.state.fetch_add(X - 1, Acquire);
        debug_assert!(prev & X == 0);
        debug_assert!(prev != 0);
        if prev != 1 {
            self.exclusive_wait(prev - 1);
        }
    }

    /// Downgrades the exclusive lock to an update lock.
    ///
    /// Shared acquisitions that blocked while the lock was exclusive
    /// remain blocked until the update lock is released, because they
    /// are queued on the gate.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the exclusive lock.
    #[cfg_attr(test, track_caller)]
    pub unsafe fn downgrade(&self) {
        debug_assert!(self.is_locked_exclusive());
        self.state.store(1, Release);
    }

    /// Returns `true` if the exclusive lock is currently held.
    ///
    /// Advisory only; the answer may be stale as soon as it is
    /// produced.
    #[inline]
    #[must_use]
    pub fn is_locked_exclusive(&self) -> bool {
        self.state.load(Acquire) == X
    }

    /// Returns `true` if the lock is held in any mode.
    ///
    /// Advisory only.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.load(Acquire) != 0 || self.gate.is_locked()
    }

    /// Returns `true` if the lock is held in any mode or any thread is
    /// waiting for it.
    ///
    /// Advisory only; this exists for [lock elision](crate::elision)
    /// and diagnostics.
    #[inline]
    #[must_use]
    pub fn is_contended(&self) -> bool {
        self.state.load(Acquire) != 0 || self.gate.is_contended()
    }

    /// Returns the current number of shared/update holders.
    ///
    /// Not synchronized with concurrent acquisitions; for diagnostics
    /// only.
    #[inline]
    #[must_use]
    pub fn holder_count(&self) -> u32 {
        self.state.load(Relaxed) & !X
    }
}

impl Default for SharedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Snapshot the state once so the fields can't disagree.
        let state = self.state.load(Relaxed);
        f.debug_struct("SharedLock")
            .field("holders", &(state & !X))
            .field("exclusive", &(state == X))
            .field("draining", &(state & X != 0 && state != X))
            .field("gate", &self.gate)
            .finish()
    }
}

unsafe impl RawSharedLock for SharedLock {
    type GuardMarker = ();

    #[inline]
    #[cfg_attr(test, track_caller)]
    fn lock_shared(&self) {
        SharedLock::lock_shared(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    fn try_lock_shared(&self) -> bool {
        SharedLock::try_lock_shared(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    unsafe fn unlock_shared(&self) {
        SharedLock::unlock_shared(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    fn lock_update(&self) {
        SharedLock::lock_update(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    fn try_lock_update(&self) -> bool {
        SharedLock::try_lock_update(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    unsafe fn unlock_update(&self) {
        SharedLock::unlock_update(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    fn lock_exclusive(&self) {
        SharedLock::lock_exclusive(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    fn try_lock_exclusive(&self) -> bool {
        SharedLock::try_lock_exclusive(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    unsafe fn unlock_exclusive(&self) {
        SharedLock::unlock_exclusive(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    unsafe fn upgrade(&self) {
        SharedLock::upgrade(self)
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    unsafe fn downgrade(&self) {
        SharedLock::downgrade(self)
    }

    #[inline]
    fn is_locked(&self) -> bool {
        SharedLock::is_locked(self)
    }

    #[inline]
    fn is_locked_exclusive(&self) -> bool {
        SharedLock::is_locked_exclusive(self)
    }

    #[inline]
    fn is_contended(&self) -> bool {
        SharedLock::is_contended(self)
    }
}

feature! {
    #![all(feature = "lock_api", not(loom))]

    unsafe impl lock_api::RawRwLock for SharedLock {
        // As usual, clippy is totally wrong about this --- the whole point of
        // this constant is to create a *new* lock every time.
        #[allow(clippy::declare_interior_mutable_const)]
        const INIT: Self = Self::new();

        type GuardMarker = lock_api::GuardSend;

        #[inline]
        fn lock_shared(&self) {
            SharedLock::lock_shared(self)
        }

        #[inline]
        fn try_lock_shared(&self) -> bool {
            SharedLock::try_lock_shared(self)
        }

        #[inline]
        unsafe fn unlock_shared(&self) {
            SharedLock::unlock_shared(self)
        }

        #[inline]
        fn lock_exclusive(&self) {
            SharedLock::lock_exclusive(self)
        }

        #[inline]
        fn try_lock_exclusive(&self) -> bool {
            SharedLock::try_lock_exclusive(self)
        }

        #[inline]
        unsafe fn unlock_exclusive(&self) {
            SharedLock::unlock_exclusive(self)
        }

        #[inline]
        fn is_locked(&self) -> bool {
            SharedLock::is_locked(self)
        }

        #[inline]
        fn is_locked_exclusive(&self) -> bool {
            SharedLock::is_locked_exclusive(self)
        }
    }

    /// The update mode maps onto `lock_api`'s upgradable reads.
    unsafe impl lock_api::RawRwLockUpgrade for SharedLock {
        #[inline]
        fn lock_upgradable(&self) {
            SharedLock::lock_update(self)
        }

        #[inline]
        fn try_lock_upgradable(&self) -> bool {
            SharedLock::try_lock_update(self)
        }

        #[inline]
        unsafe fn unlock_upgradable(&self) {
            SharedLock::unlock_update(self)
        }

        #[inline]
        unsafe fn upgrade(&self) {
            SharedLock::upgrade(self)
        }

        #[inline]
        unsafe fn try_upgrade(&self) -> bool {
            // succeeds only when the update holder is the sole holder,
            // in which case the upgrade is instantaneous.
            self.state.compare_exchange(1, X, Acquire, Relaxed).is_ok()
        }
    }

    unsafe impl lock_api::RawRwLockDowngrade for SharedLock {
        #[inline]
        unsafe fn downgrade(&self) {
            // exclusive to *shared*: release the gate as well, since a
            // plain shared holder does not own it.
            debug_assert!(self.is_locked_exclusive());
            self.state.store(1, Release);
            self.gate.unlock();
        }
    }

    unsafe impl lock_api::RawRwLockUpgradeDowngrade for SharedLock {
        #[inline]
        unsafe fn downgrade_upgradable(&self) {
            // update to shared: the holder count already includes us;
            // just stop being the gate's owner.
            self.gate.unlock();
        }

        #[inline]
        unsafe fn downgrade_to_upgradable(&self) {
            SharedLock::downgrade(self)
        }
    }
}
