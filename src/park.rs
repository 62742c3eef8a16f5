//! The kernel wait/wake seam.
//!
//! Everything in this crate parks and wakes threads through these three
//! functions, which wrap the platform's atomic-wait facility (`futex`
//! on Linux, `WaitOnAddress`/`WakeByAddress*` on Windows, `_umtx_op` on
//! FreeBSD, `__ulock_*` on macOS) by way of the `atomic-wait` crate.
//!
//! [`park`] may return spuriously, so every caller re-checks the lock
//! word in a loop. Under `cfg(loom)` there is no kernel to sleep in;
//! `park` degrades to a scheduler yield (which is just an eager
//! spurious wakeup) and the wake functions become no-ops.

use crate::loom::sync::atomic::AtomicU32;

/// Block the current thread while `*word == expected`.
#[cfg(not(loom))]
#[inline]
pub(crate) fn park(word: &AtomicU32, expected: u32) {
    atomic_wait::wait(word, expected);
}

/// Wake one thread parked on `word`, if any.
#[cfg(not(loom))]
#[inline]
pub(crate) fn unpark_one(word: &AtomicU32) {
    atomic_wait::wake_one(word);
}

/// Wake all threads parked on `word`.
#[cfg(not(loom))]
#[inline]
pub(crate) fn unpark_all(word: &AtomicU32) {
    atomic_wait::wake_all(word);
}

#[cfg(loom)]
pub(crate) fn park(_word: &AtomicU32, _expected: u32) {
    loom::thread::yield_now();
}

#[cfg(loom)]
pub(crate) fn unpark_one(_word: &AtomicU32) {}

#[cfg(loom)]
pub(crate) fn unpark_all(_word: &AtomicU32) {}
