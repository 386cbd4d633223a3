//! Storage cell for user-visible synchronization objects.
//!
//! A cell is in one of four states:
//! - `Uninit`: never initialized; every operation reports `InvalidArgument`.
//! - `Static(seed)`: declared with a static initializer. The first operation
//!   initializes it under a per-kind global guard: racy check, take the guard,
//!   recheck, initialize.
//! - `Ready(obj)`: initialized.
//! - `Destroyed`: destroyed; `InvalidArgument` until re-initialized explicitly.
//!
//! A destroyed cell never re-enters `Static`, so a racer that loses to a
//! destroy observes `InvalidArgument` instead of silently initializing again.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::error::{Error, Result};
use crate::oslock::OsLock;

enum Slot<T, S> {
    Uninit,
    Static(S),
    Ready(Arc<T>),
    Destroyed,
}

pub(crate) struct ObjectCell<T, S: Copy = ()> {
    slot: RwLock<Slot<T, S>>,
}

impl<T, S: Copy> ObjectCell<T, S> {
    pub(crate) const fn uninit() -> Self {
        Self {
            slot: parking_lot::const_rwlock(Slot::Uninit),
        }
    }

    pub(crate) const fn with_static(seed: S) -> Self {
        Self {
            slot: parking_lot::const_rwlock(Slot::Static(seed)),
        }
    }

    /// Returns the initialized object, lazily initializing a static one.
    pub(crate) fn resolve(
        &self,
        guard: &OsLock<()>,
        init: impl FnOnce(S) -> Result<Arc<T>>,
    ) -> Result<Arc<T>> {
        match &*self.slot.read() {
            Slot::Ready(obj) => return Ok(obj.clone()),
            Slot::Uninit | Slot::Destroyed => return Err(Error::InvalidArgument),
            Slot::Static(_) => {}
        }

        let _guard = guard.lock();
        let mut slot = self.slot.write();
        match &*slot {
            Slot::Ready(obj) => Ok(obj.clone()),
            Slot::Uninit | Slot::Destroyed => Err(Error::InvalidArgument),
            Slot::Static(seed) => {
                let obj = init(*seed)?;
                *slot = Slot::Ready(obj.clone());
                trace!("static object initialized on first use");
                Ok(obj)
            }
        }
    }

    /// Returns the object only if it is already initialized.
    pub(crate) fn ready(&self) -> Result<Arc<T>> {
        match &*self.slot.read() {
            Slot::Ready(obj) => Ok(obj.clone()),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Like [`ObjectCell::ready`], but a still-static object yields `None`.
    pub(crate) fn ready_or_static(&self) -> Result<Option<Arc<T>>> {
        match &*self.slot.read() {
            Slot::Ready(obj) => Ok(Some(obj.clone())),
            Slot::Static(_) => Ok(None),
            Slot::Uninit | Slot::Destroyed => Err(Error::InvalidArgument),
        }
    }

    /// Explicit initialization. An initialized object reports `Busy`.
    pub(crate) fn install(&self, make: impl FnOnce() -> Result<Arc<T>>) -> Result<()> {
        let mut slot = self.slot.write();
        if matches!(&*slot, Slot::Ready(_)) {
            return Err(Error::Busy);
        }
        *slot = Slot::Ready(make()?);
        Ok(())
    }

    /// Destroys the object if `retire` accepts it.
    ///
    /// `retire` runs with the cell write-locked, so no new operation can
    /// resolve the object meanwhile. When `retire` fails the object stays
    /// initialized and usable. A static object that was never used is
    /// destroyed under `guard`.
    pub(crate) fn destroy(
        &self,
        guard: Option<&OsLock<()>>,
        retire: impl FnOnce(&Arc<T>) -> Result<()>,
    ) -> Result<()> {
        let is_static = matches!(&*self.slot.read(), Slot::Static(_));
        let _guard = if is_static { guard.map(OsLock::lock) } else { None };

        let mut slot = self.slot.write();
        match &*slot {
            Slot::Uninit | Slot::Destroyed => Err(Error::InvalidArgument),
            Slot::Static(_) => {
                *slot = Slot::Destroyed;
                Ok(())
            }
            Slot::Ready(obj) => {
                retire(obj)?;
                *slot = Slot::Destroyed;
                Ok(())
            }
        }
    }
}
