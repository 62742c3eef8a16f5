use super::RawSharedLock;
use crate::{
    loom::cell::{ConstPtr, MutPtr, UnsafeCell},
    shared_lock::SharedLock,
    util::fmt,
};
use core::{
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

/// A reader-writer lock with a third, *update*, access mode.
///
/// This type of lock protects a value of type `T` and allows, at any
/// point in time, any number of readers, at most one *update* holder
/// (which may coexist with readers), or exactly one writer (which
/// excludes everything else).
///
/// The update mode is what distinguishes this from an ordinary
/// `RwLock`: a thread that may need to write, but usually does not, can
/// take the [update](RwLock::update) lock without blocking readers, and
/// later [upgrade](RwLockUpdateGuard::upgrade) its guard to a write
/// guard in place — without the release-and-reacquire race that an
/// ordinary rw-lock forces on this pattern.
///
/// By default the lock is a [`SharedLock`], so the whole wrapper costs
/// eight bytes on top of the `T`. The `Lock` type parameter substitutes
/// any other [`RawSharedLock`] implementation.
///
/// # Fairness
///
/// This is *not* a fair lock, with one exception: once a writer is
/// waiting, new readers block until the writer has acquired and
/// released, so readers cannot starve writers indefinitely.
pub struct RwLock<T: ?Sized, Lock = SharedLock> {
    lock: Lock,
    data: UnsafeCell<T>,
}

/// An RAII guard for shared (read) access to an [`RwLock`]. When this
/// structure is dropped (falls out of scope), the shared lock will be
/// released.
///
/// The data protected by the [`RwLock`] can be immutably accessed
/// through this guard via its [`Deref`] implementation.
///
/// This structure is created by the [`read`] and [`try_read`] methods
/// on [`RwLock`].
///
/// [`read`]: RwLock::read
/// [`try_read`]: RwLock::try_read
#[must_use = "if unused, the `RwLock` will immediately unlock"]
pub struct RwLockReadGuard<'lock, T: ?Sized, Lock: RawSharedLock = SharedLock> {
    ptr: ConstPtr<T>,
    lock: &'lock Lock,
    _marker: PhantomData<Lock::GuardMarker>,
}

/// An RAII guard for update access to an [`RwLock`]. When this
/// structure is dropped (falls out of scope), the update lock will be
/// released.
///
/// An update guard permits *reading* the data (concurrent readers may
/// exist), and reserves the right to [`upgrade`] to a
/// [`RwLockWriteGuard`] in place.
///
/// This structure is created by the [`update`] and [`try_update`]
/// methods on [`RwLock`], and by [`RwLockWriteGuard::downgrade`].
///
/// [`upgrade`]: Self::upgrade
/// [`update`]: RwLock::update
/// [`try_update`]: RwLock::try_update
#[must_use = "if unused, the `RwLock` will immediately unlock"]
pub struct RwLockUpdateGuard<'lock, T: ?Sized, Lock: RawSharedLock = SharedLock> {
    rwlock: &'lock RwLock<T, Lock>,
    ptr: ConstPtr<T>,
    _marker: PhantomData<Lock::GuardMarker>,
}

/// An RAII guard for exclusive (write) access to an [`RwLock`]. When
/// this structure is dropped (falls out of scope), the write lock will
/// be released.
///
/// The data protected by the [`RwLock`] can be mutably accessed through
/// this guard via its [`Deref`] and [`DerefMut`] implementations.
///
/// This structure is created by the [`write`] and [`try_write`] methods
/// on [`RwLock`], and by [`RwLockUpdateGuard::upgrade`].
///
/// [`write`]: RwLock::write
/// [`try_write`]: RwLock::try_write
#[must_use = "if unused, the `RwLock` will immediately unlock"]
pub struct RwLockWriteGuard<'lock, T: ?Sized, Lock: RawSharedLock = SharedLock> {
    rwlock: &'lock RwLock<T, Lock>,
    ptr: MutPtr<T>,
    _marker: PhantomData<Lock::GuardMarker>,
}

// === impl RwLock ===

impl<T> RwLock<T> {
    loom_const_fn! {
        /// Creates a new, unlocked `RwLock<T>` protecting the provided
        /// `data`.
        ///
        /// # Examples
        ///
        /// ```
        /// use enoki_sync::RwLock;
        ///
        /// let lock = RwLock::new(5);
        /// # drop(lock);
        /// ```
        #[must_use]
        pub fn new(data: T) -> Self {
            Self {
                lock: SharedLock::new(),
                data: UnsafeCell::new(data),
            }
        }
    }

    /// Returns the current number of holders of the shared and update
    /// locks.
    ///
    /// # Note
    ///
    /// This method is not synchronized with attempts to increment the
    /// holder count, and its value may become out of date as soon as it
    /// is read. This is **not** intended to be used for synchronization
    /// purposes! It is intended only for debugging purposes or for use
    /// as a heuristic.
    #[inline]
    #[must_use]
    pub fn holder_count(&self) -> u32 {
        self.lock.holder_count()
    }
}

impl<T, Lock> RwLock<T, Lock> {
    loom_const_fn! {
        /// Returns a new `RwLock` protecting the provided `data`, using
        /// `lock` as the raw lock implementation.
        #[must_use]
        pub fn with_raw_lock(data: T, lock: Lock) -> Self {
            Self {
                lock,
                data: UnsafeCell::new(data),
            }
        }
    }
}

impl<T: ?Sized, Lock: RawSharedLock> RwLock<T, Lock> {
    /// The raw lock, for the condition variable's unlock-park-relock
    /// cycle.
    pub(crate) fn raw(&self) -> &Lock {
        &self.lock
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, T, Lock> {
        RwLockReadGuard {
            ptr: self.data.get(),
            lock: &self.lock,
            _marker: PhantomData,
        }
    }

    fn update_guard(&self) -> RwLockUpdateGuard<'_, T, Lock> {
        RwLockUpdateGuard {
            rwlock: self,
            ptr: self.data.get(),
            _marker: PhantomData,
        }
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, T, Lock> {
        RwLockWriteGuard {
            rwlock: self,
            ptr: self.data.get_mut(),
            _marker: PhantomData,
        }
    }

    /// Locks this `RwLock` for shared read access, blocking the current
    /// thread until it can be acquired.
    ///
    /// The calling thread will block until there is no writer holding
    /// the lock, and no writer waiting for it. There may be other
    /// readers (and an update holder) inside the lock when this method
    /// returns.
    ///
    /// Returns an RAII guard which will release this thread's shared
    /// access once it is dropped.
    #[cfg_attr(test, track_caller)]
    pub fn read(&self) -> RwLockReadGuard<'_, T, Lock> {
        self.lock.lock_shared();
        self.read_guard()
    }

    /// Attempts to acquire this `RwLock` for shared read access.
    ///
    /// If the access could not be granted at this time, this method returns
    /// [`None`]. Otherwise, [`Some`]`(`[`RwLockReadGuard`]`)` containing a RAII
    /// guard is returned. The shared access is released when it is dropped.
    ///
    /// This function does not block.
    #[cfg_attr(test, track_caller)]
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T, Lock>> {
        if self.lock.try_lock_shared() {
            Some(self.read_guard())
        } else {
            None
        }
    }

    /// Locks this `RwLock` for update access, blocking the current
    /// thread until there is no other update holder and no writer.
    ///
    /// Readers may coexist with the returned guard. The guard can be
    /// [upgraded](RwLockUpdateGuard::upgrade) to a write guard in
    /// place.
    #[cfg_attr(test, track_caller)]
    pub fn update(&self) -> RwLockUpdateGuard<'_, T, Lock> {
        self.lock.lock_update();
        self.update_guard()
    }

    /// Attempts to acquire this `RwLock` for update access.
    ///
    /// If another thread holds the update or write lock (or is waiting
    /// for the write lock), returns [`None`].
    ///
    /// This function does not block.
    #[cfg_attr(test, track_caller)]
    pub fn try_update(&self) -> Option<RwLockUpdateGuard<'_, T, Lock>> {
        if self.lock.try_lock_update() {
            Some(self.update_guard())
        } else {
            None
        }
    }

    /// Locks this `RwLock` for exclusive write access, blocking the
    /// current thread until write access can be acquired.
    ///
    /// This function will not return while other writers or other
    /// readers currently have access to the lock.
    ///
    /// Returns an RAII guard which will drop the write access of this
    /// `RwLock` when dropped.
    #[cfg_attr(test, track_caller)]
    pub fn write(&self) -> RwLockWriteGuard<'_, T, Lock> {
        self.lock.lock_exclusive();
        self.write_guard()
    }

    /// Attempts to acquire this `RwLock` for exclusive write access.
    ///
    /// If the access could not be granted at this time, this method returns
    /// [`None`]. Otherwise, [`Some`]`(`[`RwLockWriteGuard`]`)` containing a
    /// RAII guard is returned. The write access is released when it is dropped.
    ///
    /// This function does not block.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T, Lock>> {
        if self.lock.try_lock_exclusive() {
            Some(self.write_guard())
        } else {
            None
        }
    }

    /// Returns `true` if there is currently a writer holding a write lock.
    ///
    /// # Note
    ///
    /// This method is not synchronized and its value may become out of date as
    /// soon as it is read. This is **not** intended to be used for
    /// synchronization purposes! It is intended only for debugging purposes or
    /// for use as a heuristic.
    #[inline]
    #[must_use]
    pub fn has_writer(&self) -> bool {
        self.lock.is_locked_exclusive()
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `RwLock` mutably, no actual locking needs to
    /// take place -- the mutable borrow statically guarantees no locks exist.
    ///
    /// # Examples
    ///
    /// ```
    /// let mut lock = enoki_sync::RwLock::new(0);
    /// *lock.get_mut() = 10;
    /// assert_eq!(*lock.read(), 10);
    /// ```
    pub fn get_mut(&mut self) -> &mut T {
        unsafe {
            // Safety: since this call borrows the `RwLock` mutably, no actual
            // locking needs to take place -- the mutable borrow statically
            // guarantees no locks exist.
            self.data.with_mut(|data| &mut *data)
        }
    }
}

impl<T, Lock: RawSharedLock> RwLock<T, Lock> {
    /// Consumes this `RwLock`, returning the guarded data.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default, Lock: Default> Default for RwLock<T, Lock> {
    /// Creates a new `RwLock<T>`, with the `Default` value for T.
    fn default() -> RwLock<T, Lock> {
        RwLock {
            data: UnsafeCell::new(Default::default()),
            lock: Default::default(),
        }
    }
}

impl<T> From<T> for RwLock<T> {
    /// Creates a new instance of an `RwLock<T>` which is unlocked.
    /// This is equivalent to [`RwLock::new`].
    fn from(t: T) -> Self {
        RwLock::new(t)
    }
}

impl<T, Lock> fmt::Debug for RwLock<T, Lock>
where
    T: fmt::Debug,
    Lock: fmt::Debug + RawSharedLock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field(
                "data",
                &fmt::opt(&self.try_read()).or_else("<write locked>"),
            )
            .field("lock", &self.lock)
            .finish()
    }
}

unsafe impl<T: ?Sized + Send, Lock: Send> Send for RwLock<T, Lock> {}
unsafe impl<T: ?Sized + Send + Sync, Lock: Sync> Sync for RwLock<T, Lock> {}

// === impl RwLockReadGuard ===

impl<'lock, T: ?Sized, Lock: RawSharedLock> RwLockReadGuard<'lock, T, Lock> {
    /// Disassembles the guard without releasing the lock; see
    /// [`MutexGuard::into_raw_parts`](super::MutexGuard::into_raw_parts).
    pub(crate) fn into_raw_parts(self) -> (ConstPtr<T>, &'lock Lock) {
        let this = core::mem::ManuallyDrop::new(self);
        // Safety: `this` is never dropped, so the lock is not released;
        // reading the fields out of it does not duplicate ownership.
        unsafe { (core::ptr::read(&this.ptr), this.lock) }
    }

    /// Reassembles a guard from [`into_raw_parts`](Self::into_raw_parts).
    /// A shared lock must be held by the current thread.
    pub(crate) fn from_raw_parts(ptr: ConstPtr<T>, lock: &'lock Lock) -> Self {
        Self {
            ptr,
            lock,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized, Lock: RawSharedLock> Deref for RwLockReadGuard<'_, T, Lock> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe {
            // Safety: we are holding a read lock, so it is okay to dereference
            // the const pointer immutably.
            self.ptr.deref()
        }
    }
}

impl<T: ?Sized, Lock: RawSharedLock> Drop for RwLockReadGuard<'_, T, Lock> {
    #[inline]
    #[cfg_attr(test, track_caller)]
    fn drop(&mut self) {
        unsafe { self.lock.unlock_shared() }
    }
}

impl<T, Lock> fmt::Debug for RwLockReadGuard<'_, T, Lock>
where
    T: ?Sized + fmt::Debug,
    Lock: RawSharedLock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

/// A [`RwLockReadGuard`] is [`Sync`] if both `T` and the `Lock` type parameter
/// are [`Sync`].
unsafe impl<T, Lock> Sync for RwLockReadGuard<'_, T, Lock>
where
    T: ?Sized + Sync,
    Lock: RawSharedLock + Sync,
{
}
/// A [`RwLockReadGuard`] is [`Send`] if both `T` and the `Lock` type parameter
/// are [`Sync`], because sending a `RwLockReadGuard` is equivalent to sending a
/// `&(T, Lock)`.
///
/// Additionally, the `Lock` type's [`RawSharedLock::GuardMarker`] must indicate
/// that the guard is [`Send`].
unsafe impl<T, Lock> Send for RwLockReadGuard<'_, T, Lock>
where
    T: ?Sized + Sync,
    Lock: RawSharedLock + Sync,
    Lock::GuardMarker: Send,
{
}

// === impl RwLockUpdateGuard ===

impl<'lock, T: ?Sized, Lock: RawSharedLock> RwLockUpdateGuard<'lock, T, Lock> {
    /// Upgrades update access to exclusive write access, in place,
    /// blocking the current thread until any concurrent readers have
    /// released.
    ///
    /// New readers are blocked from the moment this is called, so the
    /// upgrade cannot be starved by a stream of readers. The value read
    /// through the update guard before upgrading cannot have changed by
    /// the time the write guard is returned: no writer can have
    /// intervened, because the update holder is the writer-in-waiting.
    #[cfg_attr(test, track_caller)]
    pub fn upgrade(self) -> RwLockWriteGuard<'lock, T, Lock> {
        let this = core::mem::ManuallyDrop::new(self);
        let rwlock = this.rwlock;
        unsafe {
            // Safety: this guard's existence proves the update lock is
            // held, and it is not released here (the guard is never
            // dropped). The read pointer must be released before the
            // write pointer is taken, so that loom's access tracking
            // sees them as disjoint.
            drop(core::ptr::read(&this.ptr));
            rwlock.lock.upgrade();
        }
        rwlock.write_guard()
    }

    /// Forgets the guard without releasing the update lock.
    pub(crate) fn into_rwlock(self) -> &'lock RwLock<T, Lock> {
        let this = core::mem::ManuallyDrop::new(self);
        unsafe {
            // Safety: the guard is never dropped, so reading the ptr
            // out does not duplicate it; the lock stays held.
            drop(core::ptr::read(&this.ptr));
        }
        this.rwlock
    }

    /// Reassembles a guard from [`into_rwlock`](Self::into_rwlock). The
    /// update lock must be held by the current thread.
    pub(crate) fn from_rwlock(rwlock: &'lock RwLock<T, Lock>) -> Self {
        rwlock.update_guard()
    }
}

impl<T: ?Sized, Lock: RawSharedLock> Deref for RwLockUpdateGuard<'_, T, Lock> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe {
            // Safety: an update lock permits shared (read-only) access;
            // no writer can exist while this guard is live.
            self.ptr.deref()
        }
    }
}

impl<T: ?Sized, Lock: RawSharedLock> Drop for RwLockUpdateGuard<'_, T, Lock> {
    #[inline]
    #[cfg_attr(test, track_caller)]
    fn drop(&mut self) {
        unsafe { self.rwlock.lock.unlock_update() }
    }
}

impl<T, Lock> fmt::Debug for RwLockUpdateGuard<'_, T, Lock>
where
    T: ?Sized + fmt::Debug,
    Lock: RawSharedLock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

/// A [`RwLockUpdateGuard`] is [`Sync`] if both `T` and the `Lock` type
/// parameter are [`Sync`].
unsafe impl<T, Lock> Sync for RwLockUpdateGuard<'_, T, Lock>
where
    T: ?Sized + Send + Sync,
    Lock: RawSharedLock + Sync,
{
}
/// A [`RwLockUpdateGuard`] is [`Send`] if `T` is [`Send`] and [`Sync`] and the
/// `Lock` type parameter is [`Sync`], with the `Lock` type's
/// [`RawSharedLock::GuardMarker`] indicating that the guard is [`Send`].
unsafe impl<T, Lock> Send for RwLockUpdateGuard<'_, T, Lock>
where
    T: ?Sized + Send + Sync,
    Lock: RawSharedLock + Sync,
    Lock::GuardMarker: Send,
{
}

// === impl RwLockWriteGuard ===

impl<'lock, T: ?Sized, Lock: RawSharedLock> RwLockWriteGuard<'lock, T, Lock> {
    /// Downgrades exclusive write access to update access, atomically.
    ///
    /// Readers that blocked while this guard was held remain blocked
    /// until the returned update guard is dropped; readers arriving
    /// after the downgrade may acquire shared access immediately.
    #[cfg_attr(test, track_caller)]
    pub fn downgrade(self) -> RwLockUpdateGuard<'lock, T, Lock> {
        let this = core::mem::ManuallyDrop::new(self);
        let rwlock = this.rwlock;
        unsafe {
            // Safety: this guard's existence proves the write lock is
            // held, and it is not released here (the guard is never
            // dropped). The write pointer must be released before the
            // read pointer is taken, so that loom's access tracking
            // sees them as disjoint.
            drop(core::ptr::read(&this.ptr));
            rwlock.lock.downgrade();
        }
        rwlock.update_guard()
    }
}

impl<T: ?Sized, Lock: RawSharedLock> Deref for RwLockWriteGuard<'_, T, Lock> {
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

impl<T: ?Sized, Lock: RawSharedLock> DerefMut for RwLockWriteGuard<'_, T, Lock> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            // Safety: we are holding the lock, so it is okay to dereference the
            // mut pointer.
            self.ptr.deref()
        }
    }
}

impl<T: ?Sized, Lock: RawSharedLock> Drop for RwLockWriteGuard<'_, T, Lock> {
    #[inline]
    #[cfg_attr(test, track_caller)]
    fn drop(&mut self) {
        unsafe { self.rwlock.lock.unlock_exclusive() }
    }
}

impl<T, Lock> fmt::Debug for RwLockWriteGuard<'_, T, Lock>
where
    T: ?Sized + fmt::Debug,
    Lock: RawSharedLock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

/// A [`RwLockWriteGuard`] is only [`Send`] if `T` is [`Send`] and [`Sync`],
/// because it can be used to *move* a `T` across thread boundaries, as it
/// allows mutable access to the `T` that can be used with
/// [`core::mem::replace`] or [`core::mem::swap`].
unsafe impl<T, Lock> Send for RwLockWriteGuard<'_, T, Lock>
where
    T: ?Sized + Send + Sync,
    Lock: RawSharedLock + Sync,
    Lock::GuardMarker: Send,
{
}

/// A [`RwLockWriteGuard`] is only [`Sync`] if `T` is [`Send`] and [`Sync`],
/// because it can be used to *move* a `T` across thread boundaries, as it
/// allows mutable access to the `T` that can be used with
/// [`core::mem::replace`] or [`core::mem::swap`].
unsafe impl<T, Lock> Sync for RwLockWriteGuard<'_, T, Lock>
where
    T: ?Sized + Send + Sync,
    Lock: RawSharedLock + Sync,
{
}
