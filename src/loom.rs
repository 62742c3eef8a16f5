//! Abstracts over `loom` and `core`/`std` types, so that the same lock
//! code runs under both the real atomics and loom's simulated ones.
#[allow(unused_imports)]
pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    #![allow(dead_code, unused_imports)]

    pub(crate) use loom::{cell, hint, model, sync, thread};
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code, unused_imports)]

    pub(crate) mod sync {
        pub(crate) use core::sync::atomic;
    }

    pub(crate) use core::hint;

    #[cfg(test)]
    pub(crate) use std::thread;

    /// Run `f` as a "model". Without `cfg(loom)`, this just initializes
    /// test tracing and runs the closure once; under loom, the closure
    /// is run under every permitted interleaving instead.
    #[cfg(test)]
    pub(crate) fn model(f: impl FnOnce()) {
        let _trace = crate::util::test::trace_init();
        f()
    }

    pub(crate) mod cell {
        #[derive(Debug)]
        pub(crate) struct UnsafeCell<T: ?Sized>(core::cell::UnsafeCell<T>);

        impl<T> UnsafeCell<T> {
            pub const fn new(data: T) -> UnsafeCell<T> {
                UnsafeCell(core::cell::UnsafeCell::new(data))
            }

            #[inline(always)]
            #[must_use]
            pub(crate) fn into_inner(self) -> T {
                self.0.into_inner()
            }
        }

        impl<T: ?Sized> UnsafeCell<T> {
            #[inline(always)]
            pub fn with<F, R>(&self, f: F) -> R
            where
                F: FnOnce(*const T) -> R,
            {
                f(self.0.get())
            }

            #[inline(always)]
            pub fn with_mut<F, R>(&self, f: F) -> R
            where
                F: FnOnce(*mut T) -> R,
            {
                f(self.0.get())
            }

            #[inline(always)]
            pub(crate) fn get(&self) -> ConstPtr<T> {
                ConstPtr(self.0.get())
            }

            #[inline(always)]
            pub(crate) fn get_mut(&self) -> MutPtr<T> {
                MutPtr(self.0.get())
            }
        }

        #[derive(Debug)]
        pub(crate) struct ConstPtr<T: ?Sized>(*const T);

        impl<T: ?Sized> ConstPtr<T> {
            #[inline(always)]
            pub(crate) unsafe fn deref(&self) -> &T {
                &*self.0
            }
        }

        #[derive(Debug)]
        pub(crate) struct MutPtr<T: ?Sized>(*mut T);

        impl<T: ?Sized> MutPtr<T> {
            // Clippy knows that it's Bad and Wrong to construct a mutable reference
            // from an immutable one...but this function is intended to simulate a raw
            // pointer, so we have to do that here.
            #[allow(clippy::mut_from_ref)]
            #[inline(always)]
            pub(crate) unsafe fn deref(&self) -> &mut T {
                &mut *self.0
            }
        }
    }
}
