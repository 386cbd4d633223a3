//! Internal bookkeeping lock built on the OSAL mutex.
//!
//! The reuse pool, the condition-variable registry, the static-initializer
//! guards, each thread's cancel and key locks, and each TSD key's association
//! set are guarded by an [`OsLock`]. User-visible mutexes are never built on
//! this type.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use embpthread_osal::{OsMutex, Osal};

use crate::error::Result;

/// Data guarded by an OSAL mutex.
pub(crate) struct OsLock<T> {
    raw: Box<dyn OsMutex>,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through an `OsLockGuard`, which exists only
// while `raw` is held, so at most one thread touches `data` at a time.
unsafe impl<T: Send> Send for OsLock<T> {}
// SAFETY: see above; shared references only hand out guarded access.
unsafe impl<T: Send> Sync for OsLock<T> {}

impl<T> OsLock<T> {
    pub(crate) fn new(osal: &dyn Osal, value: T) -> Result<Self> {
        Ok(Self {
            raw: osal.mutex_create()?,
            data: UnsafeCell::new(value),
        })
    }

    pub(crate) fn lock(&self) -> OsLockGuard<'_, T> {
        self.raw.lock();
        OsLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }
}

/// RAII guard; releases the OSAL mutex on drop.
pub(crate) struct OsLockGuard<'a, T> {
    lock: &'a OsLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for OsLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the OSAL mutex is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for OsLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the OSAL mutex is held, and `&mut self`
        // prevents aliasing through this guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for OsLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}
