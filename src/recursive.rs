//! A re-entrant shared/update/exclusive lock with ownership transfer.
//!
//! See the [`RecursiveSharedLock`] type's documentation for details.
use crate::{
    loom::sync::atomic::{AtomicU32, AtomicU64, Ordering::*},
    shared_lock::SharedLock,
    util::fmt,
};
use core::num::NonZeroU64;

/// A [`SharedLock`] extended with re-entrancy for the update and
/// exclusive modes, and with explicit ownership that can be transferred
/// between threads.
///
/// A thread that holds the update or exclusive lock is the lock's
/// *write owner*. Further update or exclusive acquisitions by the owner
/// do not touch the underlying lock at all; they only bump a recursion
/// count, which makes re-entry cheap. Shared acquisitions are never
/// re-entrant, and the write owner must not request one.
///
/// [`upgrade`] and [`downgrade`] convert the *whole* nest of holds
/// between the update and exclusive modes, not just the innermost one,
/// so a function that upgrades does not need to know how deep its
/// callers' re-entry goes. Up to 2¹⁶ − 1 holds of each mode may be
/// nested.
///
/// # Ownership transfer
///
/// Unusually for a lock, a hold does not have to end on the thread that
/// began it. The `*_disowned` acquisition methods take the lock with
/// *no* owner; another thread may later [`claim`] it (or be appointed
/// with [`set_owner`]) and eventually release it. A disowned,
/// non-recursive hold may even be released directly by any thread. This
/// supports completion-callback patterns — one thread acquires the lock
/// around an asynchronous operation, and whichever thread the
/// completion runs on releases it — which ordinary locks cannot express
/// without being unsound.
///
/// The owner identity is an [`OwnerId`], a cheap per-thread token.
/// Because ownership is explicit rather than inferred, the owner word
/// is the lock's single source of truth for re-entry decisions.
///
/// [`upgrade`]: Self::upgrade
/// [`downgrade`]: Self::downgrade
/// [`claim`]: Self::claim
/// [`set_owner`]: Self::set_owner
pub struct RecursiveSharedLock {
    lock: SharedLock,
    /// Packed per-mode recursion counts: update holds in the high half,
    /// exclusive holds in the low half. Only the write owner mutates
    /// this, under the protection of `lock`.
    recursion: AtomicU32,
    /// The [`OwnerId`] of the write owner, or [`OWNER_NONE`] when the
    /// write side is unheld or held disowned.
    owner: AtomicU64,
}

/// A compact identifier for the current thread, used as the owner
/// identity in a [`RecursiveSharedLock`].
///
/// Ids are allocated from a global counter the first time a thread asks
/// for [`OwnerId::current`], and are never reused while the process
/// lives. An `OwnerId` is always nonzero, so the lock can use zero as
/// its "no owner" sentinel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OwnerId(NonZeroU64);

/// One exclusive hold.
const EXCLUSIVE_UNIT: u32 = 1;
/// One update hold.
const UPDATE_UNIT: u32 = 1 << 16;
/// The maximum nesting depth of either mode.
const COUNT_MASK: u32 = UPDATE_UNIT - 1;
/// The `owner` value meaning "no owner".
const OWNER_NONE: u64 = 0;

// === impl OwnerId ===

impl OwnerId {
    /// Returns the current thread's owner id.
    #[must_use]
    pub fn current() -> Self {
        use core::sync::atomic;
        static NEXT_ID: atomic::AtomicU64 = atomic::AtomicU64::new(1);
        std::thread_local! {
            static ID: NonZeroU64 = {
                let id = NEXT_ID.fetch_add(1, atomic::Ordering::Relaxed);
                NonZeroU64::new(id).expect("owner id space exhausted")
            };
        }
        Self(ID.with(|id| *id))
    }

    fn as_u64(self) -> u64 {
        self.0.get()
    }
}

// === impl RecursiveSharedLock ===

impl RecursiveSharedLock {
    loom_const_fn! {
        /// Returns a new `RecursiveSharedLock`, unlocked and unowned.
        #[must_use]
        pub fn new() -> Self {
            Self {
                lock: SharedLock::new(),
                recursion: AtomicU32::new(0),
                owner: AtomicU64::new(OWNER_NONE),
            }
        }
    }

    /// Acquires a shared lock; see [`SharedLock::lock_shared`].
    ///
    /// Shared holds are never re-entrant: the write owner must not call
    /// this (it would deadlock against its own pending upgrade).
    pub fn lock_shared(&self) {
        debug_assert!(!self.owns_write());
        self.lock.lock_shared();
    }

    /// Attempts to acquire a shared lock; see
    /// [`SharedLock::try_lock_shared`].
    pub fn try_lock_shared(&self) -> bool {
        debug_assert!(!self.owns_write());
        self.lock.try_lock_shared()
    }

    /// Releases a shared lock; see [`SharedLock::unlock_shared`].
    ///
    /// # Safety
    ///
    /// The calling thread must hold a shared lock.
    pub unsafe fn unlock_shared(&self) {
        self.lock.unlock_shared();
    }

    /// Acquires the update lock, re-entrantly if this thread is already
    /// the write owner.
    pub fn lock_update(&self) {
        if self.owns_write() {
            self.recurse(UPDATE_UNIT);
        } else {
            self.lock.lock_update();
            self.begin_hold(UPDATE_UNIT);
            self.owner.store(OwnerId::current().as_u64(), Relaxed);
        }
    }

    /// Attempts to acquire the update lock, re-entrantly if this thread
    /// is already the write owner.
    pub fn try_lock_update(&self) -> bool {
        if self.owns_write() {
            self.recurse(UPDATE_UNIT);
            return true;
        }
        if !self.lock.try_lock_update() {
            return false;
        }
        self.begin_hold(UPDATE_UNIT);
        self.owner.store(OwnerId::current().as_u64(), Relaxed);
        true
    }

    /// Acquires the update lock with no owner, so that another thread
    /// may later [`claim`](Self::claim) and release it.
    pub fn lock_update_disowned(&self) {
        debug_assert!(!self.owns_write());
        self.lock.lock_update();
        self.begin_hold(UPDATE_UNIT);
    }

    /// Attempts to acquire the update lock with no owner.
    pub fn try_lock_update_disowned(&self) -> bool {
        debug_assert!(!self.owns_write());
        if !self.lock.try_lock_update() {
            return false;
        }
        self.begin_hold(UPDATE_UNIT);
        true
    }

    /// Releases one update hold. When the last hold of both modes is
    /// released, the underlying lock is unlocked and the owner cleared.
    ///
    /// # Safety
    ///
    /// The calling thread must be the write owner, or the lock must be
    /// held disowned with exactly one update hold and no exclusive
    /// holds.
    pub unsafe fn unlock_update(&self) {
        self.release(UPDATE_UNIT);
    }

    /// Acquires the exclusive lock, re-entrantly if this thread is
    /// already holding it.
    ///
    /// A thread holding only the *update* lock must not call this; use
    /// [`lock_exclusive_or_upgrade`](Self::lock_exclusive_or_upgrade)
    /// or [`upgrade`](Self::upgrade) instead.
    pub fn lock_exclusive(&self) {
        if self.owns_write() {
            self.recurse(EXCLUSIVE_UNIT);
        } else {
            self.lock.lock_exclusive();
            self.begin_hold(EXCLUSIVE_UNIT);
            self.owner.store(OwnerId::current().as_u64(), Relaxed);
        }
    }

    /// Attempts to acquire the exclusive lock, re-entrantly if this
    /// thread is already holding it.
    pub fn try_lock_exclusive(&self) -> bool {
        if self.owns_write() {
            self.recurse(EXCLUSIVE_UNIT);
            return true;
        }
        if !self.lock.try_lock_exclusive() {
            return false;
        }
        self.begin_hold(EXCLUSIVE_UNIT);
        self.owner.store(OwnerId::current().as_u64(), Relaxed);
        true
    }

    /// Acquires the exclusive lock with no owner, so that another
    /// thread may later [`claim`](Self::claim) and release it.
    pub fn lock_exclusive_disowned(&self) {
        debug_assert!(!self.owns_write());
        self.lock.lock_exclusive();
        self.begin_hold(EXCLUSIVE_UNIT);
    }

    /// Attempts to acquire the exclusive lock with no owner.
    pub fn try_lock_exclusive_disowned(&self) -> bool {
        debug_assert!(!self.owns_write());
        if !self.lock.try_lock_exclusive() {
            return false;
        }
        self.begin_hold(EXCLUSIVE_UNIT);
        true
    }

    /// Acquires the exclusive lock, upgrading in place if this thread
    /// currently holds the update lock.
    ///
    /// Returns `true` if update holds were converted to exclusive holds
    /// (so that the caller knows to [`downgrade`](Self::downgrade) on
    /// its way out, rather than merely unlocking).
    pub fn lock_exclusive_or_upgrade(&self) -> bool {
        if self.owns_write() {
            let rec = self.recursion.load(Relaxed);
            debug_assert!(rec != 0);
            if rec & COUNT_MASK == 0 {
                // update holds only: convert the whole nest.
                unsafe {
                    // Safety: this thread is the write owner with no
                    // exclusive holds, so it holds the update lock.
                    self.upgrade();
                }
                return true;
            }
            self.recurse(EXCLUSIVE_UNIT);
        } else {
            self.lock.lock_exclusive();
            self.begin_hold(EXCLUSIVE_UNIT);
            self.owner.store(OwnerId::current().as_u64(), Relaxed);
        }
        false
    }

    /// Releases one exclusive hold. When the last hold of both modes is
    /// released, the underlying lock is unlocked and the owner cleared.
    ///
    /// # Safety
    ///
    /// The calling thread must be the write owner, or the lock must be
    /// held disowned with exactly one exclusive hold and no update
    /// holds.
    pub unsafe fn unlock_exclusive(&self) {
        self.release(EXCLUSIVE_UNIT);
    }

    /// Upgrades this thread's update holds to exclusive holds, in
    /// place; see [`SharedLock::upgrade`].
    ///
    /// Every update hold becomes an exclusive hold, so the matching
    /// releases become [`unlock_exclusive`](Self::unlock_exclusive)
    /// calls (or a [`downgrade`](Self::downgrade) converts them back).
    ///
    /// # Safety
    ///
    /// The calling thread must hold the update lock (in any number of
    /// holds) and no exclusive holds.
    pub unsafe fn upgrade(&self) {
        debug_assert!(self.owns_update() || self.owner.load(Relaxed) == OWNER_NONE);
        self.lock.upgrade();
        let rec = self.recursion.load(Relaxed);
        self.recursion.store(rec / UPDATE_UNIT, Relaxed);
    }

    /// Downgrades this thread's exclusive holds to update holds; see
    /// [`SharedLock::downgrade`].
    ///
    /// # Safety
    ///
    /// The calling thread must hold the exclusive lock (in any number
    /// of holds) and no update holds.
    pub unsafe fn downgrade(&self) {
        debug_assert!(self.owns_exclusive() || self.owner.load(Relaxed) == OWNER_NONE);
        let rec = self.recursion.load(Relaxed);
        debug_assert!(rec != 0 && rec <= COUNT_MASK);
        self.recursion.store(rec * UPDATE_UNIT, Relaxed);
        self.lock.downgrade();
    }

    /// Makes `owner` the write owner of a held lock.
    ///
    /// # Safety
    ///
    /// The update or exclusive lock must be held, and either the caller
    /// must be its current owner or the hold must be disowned.
    pub unsafe fn set_owner(&self, owner: OwnerId) {
        self.owner.store(owner.as_u64(), Relaxed);
    }

    /// Makes the current thread the write owner of a held lock.
    ///
    /// # Safety
    ///
    /// As for [`set_owner`](Self::set_owner).
    pub unsafe fn claim(&self) {
        self.set_owner(OwnerId::current());
    }

    /// Relinquishes ownership of a held lock without releasing it, so
    /// that another thread may [`claim`](Self::claim) or release it.
    ///
    /// # Safety
    ///
    /// The calling thread must be the write owner.
    pub unsafe fn disown(&self) {
        debug_assert!(self.owns_write());
        self.owner.store(OWNER_NONE, Relaxed);
    }

    /// Returns `true` if the current thread is the write owner (holding
    /// the lock in the update or exclusive mode).
    #[must_use]
    pub fn owns_write(&self) -> bool {
        let is_owner = self.owner.load(Relaxed) == OwnerId::current().as_u64();
        debug_assert!(!is_owner || self.recursion.load(Relaxed) != 0);
        is_owner
    }

    /// Returns `true` if the current thread holds the update lock (and
    /// has not upgraded it).
    #[must_use]
    pub fn owns_update(&self) -> bool {
        self.owns_write() && self.recursion.load(Relaxed) & COUNT_MASK == 0
    }

    /// Returns `true` if the current thread holds the exclusive lock.
    #[must_use]
    pub fn owns_exclusive(&self) -> bool {
        self.owns_write() && self.recursion.load(Relaxed) & COUNT_MASK != 0
    }

    /// Returns `true` if the lock is unheld in every mode, unowned, and
    /// nobody is waiting for it.
    ///
    /// Advisory, like every other lock predicate; it is exact only when
    /// the caller otherwise knows that no thread is using the lock.
    #[must_use]
    pub fn is_vacant(&self) -> bool {
        !self.lock.is_contended()
            && self.recursion.load(Relaxed) == 0
            && self.owner.load(Relaxed) == OWNER_NONE
    }

    /// Records the first hold of a freshly-acquired write mode.
    fn begin_hold(&self, unit: u32) {
        debug_assert_eq!(self.owner.load(Relaxed), OWNER_NONE);
        debug_assert_eq!(self.recursion.load(Relaxed), 0);
        self.recursion.store(unit, Relaxed);
    }

    /// Bumps the recursion count of a mode the current thread already
    /// holds.
    fn recurse(&self, unit: u32) {
        debug_assert!(self.owns_write());
        let rec = self.recursion.load(Relaxed);
        if unit == EXCLUSIVE_UNIT {
            // re-entering exclusive requires actually holding exclusive,
            // not just update.
            debug_assert!(rec & COUNT_MASK != 0);
        }
        debug_assert!((rec / unit) & COUNT_MASK < COUNT_MASK, "lock recursion overflow");
        self.recursion.store(rec + unit, Relaxed);
    }

    /// Drops one hold of the given mode, releasing the underlying lock
    /// when the last hold of both modes is gone.
    unsafe fn release(&self, unit: u32) {
        #[cfg(debug_assertions)]
        {
            let owner = self.owner.load(Relaxed);
            debug_assert!(
                owner == OwnerId::current().as_u64()
                    || (owner == OWNER_NONE && self.recursion.load(Relaxed) == unit),
                "released a lock owned by another thread",
            );
            debug_assert!((self.recursion.load(Relaxed) / unit) & COUNT_MASK != 0);
        }

        let rec = self.recursion.load(Relaxed) - unit;
        self.recursion.store(rec, Relaxed);
        if rec == 0 {
            self.owner.store(OWNER_NONE, Relaxed);
            if unit == UPDATE_UNIT {
                self.lock.unlock_update();
            } else {
                self.lock.unlock_exclusive();
            }
        }
    }
}

impl Default for RecursiveSharedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RecursiveSharedLock {
    fn drop(&mut self) {
        debug_assert!(
            self.is_vacant(),
            "dropped a RecursiveSharedLock that was still held",
        );
    }
}

impl fmt::Debug for RecursiveSharedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rec = self.recursion.load(Relaxed);
        let owner = NonZeroU64::new(self.owner.load(Relaxed));
        f.debug_struct("RecursiveSharedLock")
            .field("owner", &fmt::opt(&owner).or_else("<none>"))
            .field("update_holds", &(rec >> 16))
            .field("exclusive_holds", &(rec & COUNT_MASK))
            .field("lock", &self.lock)
            .finish()
    }
}

#[cfg(test)]
mod tests;
