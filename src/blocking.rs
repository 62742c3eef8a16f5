//! Data-owning wrappers and the raw lock traits behind them.
//!
//! The lock types at the root of this crate ([`FutexMutex`],
//! [`SharedLock`]) are *raw*: they are bare state machines that protect
//! no data, and their release operations are `unsafe`. This module
//! provides the safe layer on top:
//!
//! - [`Mutex`]: owns a `T` and hands out RAII [`MutexGuard`]s, like
//!   `std::sync::Mutex` without poisoning.
//! - [`RwLock`]: owns a `T` and hands out [read](RwLockReadGuard),
//!   [update](RwLockUpdateGuard), and [write](RwLockWriteGuard) guards;
//!   an update guard can be upgraded in place to a write guard, and a
//!   write guard downgraded to an update guard.
//!
//! Both wrappers are generic over the raw lock implementation, via the
//! [`RawMutex`] and [`RawSharedLock`] traits, so an alternative raw
//! lock (a test double, or a lock tuned differently) can be swapped in
//! without changing the wrapper. By default they use the futex-based
//! locks from this crate.
//!
//! [`FutexMutex`]: crate::mutex::FutexMutex
//! [`SharedLock`]: crate::shared_lock::SharedLock
mod mutex;
mod rwlock;

pub use self::{mutex::*, rwlock::*};

/// Trait abstracting over raw blocking mutex implementations.
///
/// # Safety
///
/// Implementations of this trait must ensure that the mutex is actually
/// exclusive: a lock can't be acquired while the mutex is already
/// locked.
pub unsafe trait RawMutex {
    /// Marker type which determines whether a lock guard should be
    /// [`Send`].
    type GuardMarker;

    /// Acquires this mutex, blocking the current thread until it is
    /// able to do so.
    fn lock(&self);

    /// Attempts to acquire this mutex without blocking. Returns `true`
    /// if the lock was successfully acquired and `false` otherwise.
    fn try_lock(&self) -> bool;

    /// Unlocks this mutex.
    ///
    /// # Safety
    ///
    /// This method may only be called if the mutex is held in the
    /// current context, i.e. it must be paired with a successful call
    /// to [`lock`] or [`try_lock`].
    ///
    /// [`lock`]: RawMutex::lock
    /// [`try_lock`]: RawMutex::try_lock
    unsafe fn unlock(&self);

    /// Returns `true` if the mutex is currently locked.
    fn is_locked(&self) -> bool;

    /// Returns `true` if the mutex is locked *or* any thread is waiting
    /// to lock it.
    fn is_contended(&self) -> bool;
}

/// Trait abstracting over raw shared/update/exclusive lock
/// implementations.
///
/// This extends the usual reader-writer pair of modes with an *update*
/// mode: at most one update holder at a time, coexisting with shared
/// holders, and upgradable in place to exclusive.
///
/// # Safety
///
/// Implementations must enforce the mode compatibility rules: an
/// exclusive lock can't coexist with any other lock, an update lock
/// can't coexist with another update or exclusive lock, and shared
/// locks can't coexist with an exclusive lock.
pub unsafe trait RawSharedLock {
    /// Marker type which determines whether a lock guard should be
    /// [`Send`].
    type GuardMarker;

    /// Acquires a shared lock, blocking until it can be granted.
    fn lock_shared(&self);

    /// Attempts to acquire a shared lock without blocking.
    fn try_lock_shared(&self) -> bool;

    /// Releases a shared lock.
    ///
    /// # Safety
    ///
    /// This method may only be called if a shared lock is held in the
    /// current context.
    unsafe fn unlock_shared(&self);

    /// Acquires the update lock, blocking until it can be granted.
    fn lock_update(&self);

    /// Attempts to acquire the update lock without blocking.
    fn try_lock_update(&self) -> bool;

    /// Releases the update lock.
    ///
    /// # Safety
    ///
    /// This method may only be called if the update lock is held in the
    /// current context.
    unsafe fn unlock_update(&self);

    /// Acquires the exclusive lock, blocking until it can be granted.
    fn lock_exclusive(&self);

    /// Attempts to acquire the exclusive lock without blocking.
    fn try_lock_exclusive(&self) -> bool;

    /// Releases the exclusive lock.
    ///
    /// # Safety
    ///
    /// This method may only be called if the exclusive lock is held in
    /// the current context.
    unsafe fn unlock_exclusive(&self);

    /// Upgrades the update lock to exclusive, blocking until concurrent
    /// shared holders have released.
    ///
    /// # Safety
    ///
    /// This method may only be called if the update lock is held in the
    /// current context. On return, the caller holds the exclusive lock
    /// instead.
    unsafe fn upgrade(&self);

    /// Downgrades the exclusive lock to the update lock.
    ///
    /// # Safety
    ///
    /// This method may only be called if the exclusive lock is held in
    /// the current context. On return, the caller holds the update lock
    /// instead.
    unsafe fn downgrade(&self);

    /// Returns `true` if the lock is held in any mode.
    fn is_locked(&self) -> bool;

    /// Returns `true` if the lock is held in exclusive mode.
    fn is_locked_exclusive(&self) -> bool;

    /// Returns `true` if the lock is held in any mode *or* any thread
    /// is waiting for it.
    fn is_contended(&self) -> bool;
}
