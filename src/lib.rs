#![doc = include_str!("../README.md")]
#![warn(missing_docs, missing_debug_implementations)]

pub(crate) mod loom;

#[macro_use]
pub(crate) mod util;

pub mod blocking;
pub mod condvar;
pub mod elision;
pub mod mutex;
pub(crate) mod park;
pub mod recursive;
pub mod shared_lock;

#[doc(inline)]
pub use self::blocking::{Mutex, MutexGuard, RwLock};
#[doc(inline)]
pub use self::blocking::{RwLockReadGuard, RwLockUpdateGuard, RwLockWriteGuard};
#[doc(inline)]
pub use self::condvar::Condvar;
#[doc(inline)]
pub use self::mutex::FutexMutex;
#[doc(inline)]
pub use self::recursive::{OwnerId, RecursiveSharedLock};
#[doc(inline)]
pub use self::shared_lock::SharedLock;
