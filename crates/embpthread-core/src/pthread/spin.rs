//! Spin locks.
//!
//! On a single processor spinning only burns the holder's time slice, so
//! under [`SpinPolicy::Auto`](crate::SpinPolicy) a spin lock there is a plain
//! mutex wearing a spin lock's interface.

use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};
use crate::object::ObjectCell;
use crate::pthread::attr::ProcessShared;
use crate::pthread::mutex::{MutexKind, RawMutex};
use crate::runtime::Runtime;

const SPIN_INVALID: i32 = 0;
const SPIN_UNLOCKED: i32 = 1;
const SPIN_LOCKED: i32 = 2;
const SPIN_USE_MUTEX: i32 = 3;

pub(crate) struct RawSpin {
    interlock: AtomicI32,
    mutex: Option<RawMutex>,
}

impl RawSpin {
    fn new(rt: &Runtime) -> Result<Self> {
        let ctx = &rt.ctx;
        if ctx.config.spin_policy.uses_mutex(ctx.processors) {
            Ok(Self {
                interlock: AtomicI32::new(SPIN_USE_MUTEX),
                mutex: Some(RawMutex::new(ctx.osal.as_ref(), MutexKind::Normal)?),
            })
        } else {
            Ok(Self {
                interlock: AtomicI32::new(SPIN_UNLOCKED),
                mutex: None,
            })
        }
    }

    fn delegate(&self) -> Option<&RawMutex> {
        if self.interlock.load(Ordering::Relaxed) == SPIN_USE_MUTEX {
            self.mutex.as_ref()
        } else {
            None
        }
    }

    fn lock(&self, rt: &Runtime) -> Result<()> {
        if let Some(mutex) = self.delegate() {
            return mutex.lock(rt);
        }
        loop {
            match self.interlock.compare_exchange_weak(
                SPIN_UNLOCKED,
                SPIN_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(SPIN_LOCKED) => {
                    while self.interlock.load(Ordering::Relaxed) == SPIN_LOCKED {
                        hint::spin_loop();
                    }
                }
                Err(SPIN_UNLOCKED) => {}
                Err(_) => return Err(Error::InvalidArgument),
            }
        }
    }

    fn try_lock(&self, rt: &Runtime) -> Result<()> {
        if let Some(mutex) = self.delegate() {
            return mutex.try_lock(rt);
        }
        match self.interlock.compare_exchange(
            SPIN_UNLOCKED,
            SPIN_LOCKED,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(()),
            Err(SPIN_LOCKED) => Err(Error::Busy),
            Err(_) => Err(Error::InvalidArgument),
        }
    }

    fn unlock(&self, rt: &Runtime) -> Result<()> {
        if let Some(mutex) = self.delegate() {
            return mutex.unlock(rt);
        }
        match self.interlock.compare_exchange(
            SPIN_LOCKED,
            SPIN_UNLOCKED,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(()),
            Err(SPIN_UNLOCKED) => Err(Error::NotPermitted),
            Err(_) => Err(Error::InvalidArgument),
        }
    }

    fn retire(&self, rt: &Runtime) -> Result<()> {
        if let Some(mutex) = self.delegate() {
            return mutex.check_destroyable(rt);
        }
        self.interlock
            .compare_exchange(SPIN_UNLOCKED, SPIN_INVALID, Ordering::AcqRel, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    fn uses_mutex(&self) -> bool {
        self.delegate().is_some()
    }
}

/// A spin lock. [`SpinLock::new`] is a static initializer.
pub struct SpinLock {
    cell: ObjectCell<RawSpin>,
}

impl SpinLock {
    #[must_use]
    pub const fn new() -> Self {
        Self::new_static()
    }

    #[must_use]
    pub const fn new_static() -> Self {
        Self {
            cell: ObjectCell::with_static(()),
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    fn resolve_spin(&self, spin: &SpinLock) -> Result<Arc<RawSpin>> {
        spin.cell
            .resolve(&self.ctx.guards.spin, |()| Ok(Arc::new(RawSpin::new(self)?)))
    }

    pub fn spin_init(&self, spin: &SpinLock, pshared: ProcessShared) -> Result<()> {
        pshared.require_private()?;
        self.check_live()?;
        spin.cell.install(|| Ok(Arc::new(RawSpin::new(self)?)))
    }

    /// `Busy` while the lock is held.
    pub fn spin_destroy(&self, spin: &SpinLock) -> Result<()> {
        spin.cell
            .destroy(Some(&self.ctx.guards.spin), |raw| raw.retire(self))
    }

    pub fn spin_lock(&self, spin: &SpinLock) -> Result<()> {
        self.resolve_spin(spin)?.lock(self)
    }

    pub fn spin_trylock(&self, spin: &SpinLock) -> Result<()> {
        self.resolve_spin(spin)?.try_lock(self)
    }

    /// `NotPermitted` when the lock is not held.
    pub fn spin_unlock(&self, spin: &SpinLock) -> Result<()> {
        spin.cell.ready()?.unlock(self)
    }

    /// Whether `spin` is backed by a blocking mutex.
    pub fn spin_uses_mutex(&self, spin: &SpinLock) -> Result<bool> {
        Ok(self.resolve_spin(spin)?.uses_mutex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RuntimeConfig, SpinPolicy};
    use embpthread_osal::HostOsal;

    fn runtime(policy: SpinPolicy) -> Runtime {
        Runtime::init(
            Arc::new(HostOsal::new()),
            RuntimeConfig::default().with_spin_policy(policy),
        )
        .unwrap()
    }

    #[test]
    fn busy_wait_spin_lock_excludes() {
        let rt = runtime(SpinPolicy::AlwaysSpin);
        let spin = SpinLock::new();
        rt.spin_lock(&spin).unwrap();
        assert!(!rt.spin_uses_mutex(&spin).unwrap());
        assert_eq!(rt.spin_trylock(&spin).unwrap_err(), Error::Busy);
        assert_eq!(rt.spin_destroy(&spin).unwrap_err(), Error::Busy);
        rt.spin_unlock(&spin).unwrap();
        assert_eq!(rt.spin_unlock(&spin).unwrap_err(), Error::NotPermitted);
        rt.spin_destroy(&spin).unwrap();
        assert_eq!(rt.spin_lock(&spin).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn blocking_policy_delegates_to_mutex() {
        let rt = runtime(SpinPolicy::AlwaysBlock);
        let spin = SpinLock::new();
        rt.spin_init(&spin, ProcessShared::Private).unwrap();
        assert!(rt.spin_uses_mutex(&spin).unwrap());
        rt.spin_lock(&spin).unwrap();
        assert_eq!(rt.spin_trylock(&spin).unwrap_err(), Error::Busy);
        assert_eq!(rt.spin_destroy(&spin).unwrap_err(), Error::Busy);
        rt.spin_unlock(&spin).unwrap();
        rt.spin_destroy(&spin).unwrap();
    }

    #[test]
    fn contended_spin_lock_counts_exactly() {
        let rt = runtime(SpinPolicy::AlwaysSpin);
        let spin = Arc::new(SpinLock::new());
        rt.spin_init(&spin, ProcessShared::Private).unwrap();
        let counter = Arc::new(AtomicI32::new(0));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let (worker, spin, counter) = (rt.clone(), spin.clone(), counter.clone());
                rt.create(None, move || {
                    for _ in 0..500 {
                        worker.spin_lock(&spin)?;
                        let seen = counter.load(Ordering::Relaxed);
                        counter.store(seen + 1, Ordering::Relaxed);
                        worker.spin_unlock(&spin)?;
                    }
                    Ok(0)
                })
                .unwrap()
            })
            .collect();
        for worker in workers {
            rt.join(worker).unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
    }

    #[test]
    fn shared_spin_lock_is_unsupported() {
        let rt = runtime(SpinPolicy::Auto);
        let spin = SpinLock::new();
        assert_eq!(
            rt.spin_init(&spin, ProcessShared::Shared).unwrap_err(),
            Error::NotSupported
        );
    }
}
