//! Hardware transactional lock elision, as a seam.
//!
//! On processors with hardware transactional memory, a critical section
//! can sometimes run *without taking its lock at all*: the section
//! executes inside a hardware transaction, reading the lock word to
//! verify that the lock is free, and commits at the end. Conflicting
//! lock holders abort the transaction, in which case the section
//! re-runs with the lock genuinely held.
//!
//! This crate does not implement any particular ISA's transactional
//! memory. Instead, this module defines the *contract* such an
//! implementation must satisfy — the [`HardwareTransaction`] trait —
//! and the guard types that consume it. The [`NoElision`] placeholder
//! implementation never starts a transaction, so the guards degrade to
//! plain RAII acquisition, and a program written against them gains
//! elision by swapping in a real [`HardwareTransaction`] without any
//! other change.
//!
//! The `is_locked` / `is_contended` predicates on the raw lock types
//! exist for these guards: a transaction that observes the lock as free
//! has, by the transaction's own semantics, proven that no holder can
//! have overlapped the elided section. They are *not* meant for
//! ordinary synchronization.
use crate::{
    blocking::{RawMutex, RawSharedLock},
    mutex::FutexMutex,
    shared_lock::SharedLock,
    util::fmt,
};
use core::marker::PhantomData;

/// A hardware transactional memory facility.
///
/// # Safety
///
/// Implementations must provide real transactional semantics: when
/// [`begin`] returns `true`, all memory operations until the matching
/// [`commit`] must take effect atomically, or the whole group must be
/// rolled back and control returned to the point where [`begin`]
/// reports `false`. [`abort`] must roll back the current transaction
/// and must not return to the aborted path.
///
/// [`begin`]: Self::begin
/// [`commit`]: Self::commit
/// [`abort`]: Self::abort
pub unsafe trait HardwareTransaction {
    /// Returns `true` if transactional execution is available at all on
    /// this processor.
    fn is_supported() -> bool;

    /// Attempts to begin a transaction, returning `true` on success.
    ///
    /// When an in-progress transaction aborts, control resumes as if
    /// this call had returned `false`.
    fn begin() -> bool;

    /// Commits the current transaction.
    ///
    /// Must only be called in a transaction started by a [`begin`] that
    /// returned `true`.
    ///
    /// [`begin`]: Self::begin
    fn commit();

    /// Aborts the current transaction, rolling back its effects.
    ///
    /// Must only be called in a transaction started by a [`begin`] that
    /// returned `true`; does not return to the caller.
    ///
    /// [`begin`]: Self::begin
    fn abort();
}

/// The placeholder [`HardwareTransaction`] for processors (or builds)
/// without transactional memory: [`begin`](HardwareTransaction::begin)
/// always declines, so elision guards always take their lock for real.
#[derive(Debug)]
pub enum NoElision {}

unsafe impl HardwareTransaction for NoElision {
    #[inline]
    fn is_supported() -> bool {
        false
    }

    #[inline]
    fn begin() -> bool {
        false
    }

    #[inline]
    fn commit() {
        unreachable!("NoElision never starts a transaction")
    }

    #[inline]
    fn abort() {
        unreachable!("NoElision never starts a transaction")
    }
}

/// A scoped acquisition of a [`RawMutex`] that elides the lock when a
/// hardware transaction can be started and the lock is quiescent.
#[must_use = "if unused, the lock (or transaction) is immediately released"]
pub struct TransactionalMutexGuard<'a, L: RawMutex = FutexMutex, Tx: HardwareTransaction = NoElision>
{
    lock: &'a L,
    elided: bool,
    _tx: PhantomData<Tx>,
}

/// A scoped *shared* acquisition of a [`RawSharedLock`] that elides the
/// lock when a hardware transaction can be started and no exclusive
/// holder exists.
#[must_use = "if unused, the lock (or transaction) is immediately released"]
pub struct TransactionalReadGuard<
    'a,
    L: RawSharedLock = SharedLock,
    Tx: HardwareTransaction = NoElision,
> {
    lock: &'a L,
    elided: bool,
    _tx: PhantomData<Tx>,
}

/// A scoped *update* acquisition of a [`RawSharedLock`] that elides the
/// lock when a hardware transaction can be started and the lock is
/// quiescent.
#[must_use = "if unused, the lock (or transaction) is immediately released"]
pub struct TransactionalUpdateGuard<
    'a,
    L: RawSharedLock = SharedLock,
    Tx: HardwareTransaction = NoElision,
> {
    lock: &'a L,
    elided: bool,
    _tx: PhantomData<Tx>,
}

// === impl TransactionalMutexGuard ===

impl<'a, L: RawMutex, Tx: HardwareTransaction> TransactionalMutexGuard<'a, L, Tx> {
    /// Acquires `lock`, transactionally if possible.
    ///
    /// If a transaction starts and the lock is neither held nor waited
    /// for, the critical section runs inside the transaction and no
    /// lock operation ever happens. Otherwise the transaction (if any)
    /// is aborted and the lock is acquired for real.
    pub fn lock(lock: &'a L) -> Self {
        if Tx::begin() {
            if !lock.is_contended() {
                return Self {
                    lock,
                    elided: true,
                    _tx: PhantomData,
                };
            }
            // a holder or waiter exists; the transaction would conflict
            // with its writes anyway.
            Tx::abort();
        }
        lock.lock();
        Self {
            lock,
            elided: false,
            _tx: PhantomData,
        }
    }

    /// Returns `true` if this acquisition is running inside a hardware
    /// transaction rather than holding the lock.
    #[inline]
    #[must_use]
    pub fn was_elided(&self) -> bool {
        self.elided
    }
}

impl<L: RawMutex, Tx: HardwareTransaction> Drop for TransactionalMutexGuard<'_, L, Tx> {
    fn drop(&mut self) {
        if self.elided {
            Tx::commit();
        } else {
            unsafe {
                // Safety: `self.elided` is false, so `lock()` acquired
                // the lock for real.
                self.lock.unlock();
            }
        }
    }
}

impl<L: RawMutex, Tx: HardwareTransaction> fmt::Debug for TransactionalMutexGuard<'_, L, Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalMutexGuard")
            .field("elided", &self.elided)
            .finish()
    }
}

// === impl TransactionalReadGuard ===

impl<'a, L: RawSharedLock, Tx: HardwareTransaction> TransactionalReadGuard<'a, L, Tx> {
    /// Acquires a shared lock on `lock`, transactionally if possible.
    ///
    /// Shared elision only has to exclude an exclusive holder; other
    /// shared holders (and an update holder) could coexist with us
    /// anyway.
    pub fn lock(lock: &'a L) -> Self {
        if Tx::begin() {
            if !lock.is_locked_exclusive() {
                return Self {
                    lock,
                    elided: true,
                    _tx: PhantomData,
                };
            }
            Tx::abort();
        }
        lock.lock_shared();
        Self {
            lock,
            elided: false,
            _tx: PhantomData,
        }
    }

    /// Returns `true` if this acquisition is running inside a hardware
    /// transaction rather than holding the lock.
    #[inline]
    #[must_use]
    pub fn was_elided(&self) -> bool {
        self.elided
    }
}

impl<L: RawSharedLock, Tx: HardwareTransaction> Drop for TransactionalReadGuard<'_, L, Tx> {
    fn drop(&mut self) {
        if self.elided {
            Tx::commit();
        } else {
            unsafe {
                // Safety: `self.elided` is false, so `lock()` acquired
                // a shared lock for real.
                self.lock.unlock_shared();
            }
        }
    }
}

impl<L: RawSharedLock, Tx: HardwareTransaction> fmt::Debug for TransactionalReadGuard<'_, L, Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalReadGuard")
            .field("elided", &self.elided)
            .finish()
    }
}

// === impl TransactionalUpdateGuard ===

impl<'a, L: RawSharedLock, Tx: HardwareTransaction> TransactionalUpdateGuard<'a, L, Tx> {
    /// Acquires the update lock on `lock`, transactionally if possible.
    pub fn lock(lock: &'a L) -> Self {
        if Tx::begin() {
            if !lock.is_contended() {
                return Self {
                    lock,
                    elided: true,
                    _tx: PhantomData,
                };
            }
            Tx::abort();
        }
        lock.lock_update();
        Self {
            lock,
            elided: false,
            _tx: PhantomData,
        }
    }

    /// Returns `true` if this acquisition is running inside a hardware
    /// transaction rather than holding the lock.
    #[inline]
    #[must_use]
    pub fn was_elided(&self) -> bool {
        self.elided
    }
}

impl<L: RawSharedLock, Tx: HardwareTransaction> Drop for TransactionalUpdateGuard<'_, L, Tx> {
    fn drop(&mut self) {
        if self.elided {
            Tx::commit();
        } else {
            unsafe {
                // Safety: `self.elided` is false, so `lock()` acquired
                // the update lock for real.
                self.lock.unlock_update();
            }
        }
    }
}

impl<L: RawSharedLock, Tx: HardwareTransaction> fmt::Debug for TransactionalUpdateGuard<'_, L, Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalUpdateGuard")
            .field("elided", &self.elided)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_elision_takes_the_real_lock() {
        crate::loom::model(|| {
            let mutex = FutexMutex::new();
            {
                let guard = TransactionalMutexGuard::<'_, _, NoElision>::lock(&mutex);
                assert!(!guard.was_elided());
                assert!(mutex.is_locked());
            }
            assert!(!mutex.is_contended());
        });
    }

    #[test]
    fn shared_and_update_fall_back() {
        crate::loom::model(|| {
            let lock = SharedLock::new();
            {
                let read = TransactionalReadGuard::<'_, _, NoElision>::lock(&lock);
                assert!(!read.was_elided());
                // an elidable update acquisition coexists with the
                // shared hold.
                let update = TransactionalUpdateGuard::<'_, _, NoElision>::lock(&lock);
                assert!(!update.was_elided());
                assert!(lock.is_locked());
            }
            assert!(!lock.is_contended());
        });
    }
}
