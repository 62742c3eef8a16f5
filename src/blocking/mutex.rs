use super::RawMutex;
use crate::{
    loom::cell::{MutPtr, UnsafeCell},
    mutex::FutexMutex,
    util::fmt,
};
use core::ops::{Deref, DerefMut};

/// A blocking mutual exclusion lock for protecting shared data.
///
/// Each mutex has a type parameter which represents the data that it is
/// protecting. The data can only be accessed through the RAII guards
/// returned from [`lock`] and [`try_lock`], which guarantees that the
/// data is only ever accessed when the mutex is locked.
///
/// By default, the lock itself is a [`FutexMutex`], so an uncontended
/// `Mutex<T>` costs four bytes on top of the `T`. The `Lock` type
/// parameter substitutes any other [`RawMutex`] implementation.
///
/// # Fairness
///
/// This is *not* a fair mutex.
///
/// [`lock`]: Mutex::lock
/// [`try_lock`]: Mutex::try_lock
pub struct Mutex<T, Lock = FutexMutex> {
    lock: Lock,
    data: UnsafeCell<T>,
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure is
/// dropped (falls out of scope), the lock will be unlocked.
///
/// The data protected by the mutex can be accessed through this guard via its
/// [`Deref`] and [`DerefMut`] implementations.
///
/// This structure is created by the [`lock`] and [`try_lock`] methods on
/// [`Mutex`].
///
/// [`lock`]: Mutex::lock
/// [`try_lock`]: Mutex::try_lock
#[must_use = "if unused, the `Mutex` will immediately unlock"]
pub struct MutexGuard<'a, T, Lock: RawMutex = FutexMutex> {
    ptr: MutPtr<T>,
    lock: &'a Lock,
}

// === impl Mutex ===

impl<T> Mutex<T> {
    loom_const_fn! {
        /// Returns a new `Mutex` protecting the provided `data`.
        ///
        /// The returned `Mutex` is in an unlocked state, ready for use.
        ///
        /// # Examples
        ///
        /// ```
        /// use enoki_sync::Mutex;
        ///
        /// let mutex = Mutex::new(0);
        /// # drop(mutex);
        /// ```
        #[must_use]
        pub fn new(data: T) -> Self {
            Self {
                lock: FutexMutex::new(),
                data: UnsafeCell::new(data),
            }
        }
    }
}

impl<T, Lock> Mutex<T, Lock> {
    loom_const_fn! {
        /// Returns a new `Mutex` protecting the provided `data`, using
        /// `lock` as the raw mutex implementation.
        ///
        /// This constructor is used to override the internal implementation of
        /// mutex operations, with an alternative implementation of the
        /// [`RawMutex`] trait.
        ///
        /// The returned `Mutex` is in an unlocked state, ready for use.
        #[must_use]
        pub fn with_raw_mutex(data: T, lock: Lock) -> Self {
            Self {
                lock,
                data: UnsafeCell::new(data),
            }
        }
    }
}

impl<T, Lock> Mutex<T, Lock>
where
    Lock: RawMutex,
{
    fn guard(&self) -> MutexGuard<'_, T, Lock> {
        MutexGuard {
            ptr: self.data.get_mut(),
            lock: &self.lock,
        }
    }

    /// Attempts to acquire this lock without blocking.
    ///
    /// If the lock could not be acquired at this time, then [`None`] is returned.
    /// Otherwise, an RAII guard is returned. The lock will be unlocked when the
    /// guard is dropped.
    #[must_use]
    #[cfg_attr(test, track_caller)]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, Lock>> {
        if self.lock.try_lock() {
            Some(self.guard())
        } else {
            None
        }
    }

    /// Acquires the mutex, blocking the current thread until it is locked.
    ///
    /// Upon returning, the thread is the only thread with the lock held. An
    /// RAII guard is returned to allow scoped unlock of the lock. When the
    /// guard goes out of scope, the mutex will be unlocked.
    #[cfg_attr(test, track_caller)]
    pub fn lock(&self) -> MutexGuard<'_, T, Lock> {
        self.lock.lock();
        self.guard()
    }

    /// Returns `true` if the mutex is currently locked.
    ///
    /// The answer may be stale as soon as it is produced; this is a
    /// diagnostic, not a synchronization mechanism.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Forcibly unlock the mutex.
    ///
    /// If a lock is currently held, it will be released, regardless of who's
    /// holding it. Of course, this is **outrageously, disgustingly unsafe** and
    /// you should never do it.
    ///
    /// # Safety
    ///
    /// This deliberately violates mutual exclusion.
    ///
    /// Only call this method when it is _guaranteed_ that no stack frame that
    /// has previously locked the mutex will ever continue executing.
    pub unsafe fn force_unlock(&self) {
        self.lock.unlock()
    }

    /// Consumes this `Mutex`, returning the guarded data.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking needs to
    /// take place -- the mutable borrow statically guarantees no locks exist.
    ///
    /// # Examples
    ///
    /// ```
    /// let mut lock = enoki_sync::Mutex::new(0);
    /// *lock.get_mut() = 10;
    /// assert_eq!(*lock.lock(), 10);
    /// ```
    pub fn get_mut(&mut self) -> &mut T {
        unsafe {
            // Safety: since this call borrows the `Mutex` mutably, no actual
            // locking needs to take place -- the mutable borrow statically
            // guarantees no locks exist.
            self.data.with_mut(|data| &mut *data)
        }
    }
}

impl<T: Default, Lock: Default> Default for Mutex<T, Lock> {
    fn default() -> Self {
        Self {
            lock: Default::default(),
            data: UnsafeCell::new(Default::default()),
        }
    }
}

impl<T, Lock> fmt::Debug for Mutex<T, Lock>
where
    T: fmt::Debug,
    Lock: fmt::Debug + RawMutex,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("data", &fmt::opt(&self.try_lock()).or_else("<locked>"))
            .field("lock", &self.lock)
            .finish()
    }
}

unsafe impl<T: Send, Lock> Send for Mutex<T, Lock> {}
unsafe impl<T: Send, Lock> Sync for Mutex<T, Lock> {}

// === impl MutexGuard ===

impl<'a, T, Lock: RawMutex> MutexGuard<'a, T, Lock> {
    /// Disassembles the guard without releasing the lock, for
    /// re-assembly by [`from_raw_parts`](Self::from_raw_parts). This is
    /// how the condition variable relinquishes and reacquires the lock
    /// around a wait.
    pub(crate) fn into_raw_parts(self) -> (MutPtr<T>, &'a Lock) {
        let this = core::mem::ManuallyDrop::new(self);
        // Safety: `this` is never dropped, so the lock is not released;
        // reading the fields out of it does not duplicate ownership.
        unsafe { (core::ptr::read(&this.ptr), this.lock) }
    }

    /// Reassembles a guard from [`into_raw_parts`](Self::into_raw_parts).
    ///
    /// The lock must be held by the current thread.
    pub(crate) fn from_raw_parts(ptr: MutPtr<T>, lock: &'a Lock) -> Self {
        Self { ptr, lock }
    }
}

impl<T, Lock: RawMutex> Deref for MutexGuard<'_, T, Lock> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe {
            // Safety: we are holding the lock, so it is okay to dereference the
            // mut pointer.
            &*self.ptr.deref()
        }
    }
}

impl<T, Lock: RawMutex> DerefMut for MutexGuard<'_, T, Lock> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            // Safety: we are holding the lock, so it is okay to dereference the
            // mut pointer.
            self.ptr.deref()
        }
    }
}

impl<T, Lock> Drop for MutexGuard<'_, T, Lock>
where
    Lock: RawMutex,
{
    #[inline]
    #[cfg_attr(test, track_caller)]
    fn drop(&mut self) {
        unsafe { self.lock.unlock() }
    }
}

impl<T, Lock> fmt::Debug for MutexGuard<'_, T, Lock>
where
    T: fmt::Debug,
    Lock: RawMutex,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

impl<T, Lock> fmt::Display for MutexGuard<'_, T, Lock>
where
    T: fmt::Display,
    Lock: RawMutex,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

unsafe impl<T, Lock> Send for MutexGuard<'_, T, Lock>
where
    T: Send,
    Lock: RawMutex + Sync,
    Lock::GuardMarker: Send,
{
}
unsafe impl<T, Lock> Sync for MutexGuard<'_, T, Lock>
where
    T: Send,
    Lock: RawMutex + Sync,
    Lock::GuardMarker: Send,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::{self, thread};
    use std::sync::Arc;

    #[test]
    fn multithreaded() {
        loom::model(|| {
            let mutex = Arc::new(Mutex::new(String::new()));
            let mutex2 = mutex.clone();

            let t1 = thread::spawn(move || {
                tracing::info!("t1: locking...");
                let mut lock = mutex2.lock();
                tracing::info!("t1: locked");
                lock.push_str("bbbbb");
                tracing::info!("t1: dropping...");
            });

            {
                tracing::info!("t2: locking...");
                let mut lock = mutex.lock();
                tracing::info!("t2: locked");
                lock.push_str("bbbbb");
                tracing::info!("t2: dropping...");
            }
            t1.join().unwrap();

            assert_eq!(mutex.lock().len(), "bbbbb".len() * 2);
        });
    }

    #[test]
    fn try_lock() {
        loom::model(|| {
            let mutex = Mutex::new(42);
            // First lock succeeds
            let a = mutex.try_lock();
            assert_eq!(a.as_ref().map(|r| **r), Some(42));

            // Additional lock fails
            let b = mutex.try_lock();
            assert!(b.is_none());

            // After dropping lock, it succeeds again
            ::core::mem::drop(a);
            let c = mutex.try_lock();
            assert_eq!(c.as_ref().map(|r| **r), Some(42));
        });
    }
}
