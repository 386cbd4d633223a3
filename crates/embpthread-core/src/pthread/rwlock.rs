//! Read-write locks, writer preferring.
//!
//! Readers pass through `exclusive` just long enough to bump `n_shared`.
//! A writer takes `exclusive` for the whole write section, which holds off new
//! readers, then waits on `completed` until readers already inside have all
//! left. `n_completed` counts departed readers; while a writer is draining it
//! holds the negated count of readers still inside, and the last one to leave
//! brings it to zero and signals.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::object::ObjectCell;
use crate::pthread::attr::RwLockAttr;
use crate::pthread::cond::RawCond;
use crate::pthread::mutex::{LockMode, MutexKind, RawMutex};
use crate::runtime::Runtime;

pub(crate) struct RawRwLock {
    exclusive: RawMutex,
    shared_completed: RawMutex,
    completed: Arc<RawCond>,
    n_shared: AtomicI32,
    n_exclusive: AtomicI32,
    n_completed: AtomicI32,
}

impl RawRwLock {
    fn new(rt: &Runtime) -> Result<Self> {
        let osal = rt.ctx.osal.as_ref();
        Ok(Self {
            exclusive: RawMutex::new(osal, MutexKind::Normal)?,
            shared_completed: RawMutex::new(osal, MutexKind::Normal)?,
            completed: rt.register_cond()?,
            n_shared: AtomicI32::new(0),
            n_exclusive: AtomicI32::new(0),
            n_completed: AtomicI32::new(0),
        })
    }

    fn read_lock(&self, rt: &Runtime, mode: LockMode) -> Result<()> {
        self.exclusive.acquire(rt, mode)?;
        if self.n_shared.fetch_add(1, Ordering::Relaxed) + 1 == i32::MAX {
            // Fold departed readers back in before the counter saturates.
            if let Err(err) = self.shared_completed.lock(rt) {
                self.n_shared.fetch_sub(1, Ordering::Relaxed);
                let _ = self.exclusive.unlock(rt);
                return Err(err);
            }
            let completed = self.n_completed.swap(0, Ordering::Relaxed);
            self.n_shared.fetch_sub(completed, Ordering::Relaxed);
            self.shared_completed.unlock(rt)?;
        }
        self.exclusive.unlock(rt)
    }

    fn write_lock(&self, rt: &Runtime, mode: LockMode) -> Result<()> {
        self.exclusive.acquire(rt, mode)?;
        if let Err(err) = self.shared_completed.acquire(rt, mode) {
            let _ = self.exclusive.unlock(rt);
            return Err(err);
        }

        if self.n_exclusive.load(Ordering::Relaxed) == 0 {
            let completed = self.n_completed.swap(0, Ordering::Relaxed);
            if completed > 0 {
                self.n_shared.fetch_sub(completed, Ordering::Relaxed);
            }
            let shared = self.n_shared.load(Ordering::Relaxed);
            if shared > 0 {
                if mode == LockMode::Try {
                    self.release_both(rt)?;
                    return Err(Error::Busy);
                }
                self.n_completed.store(-shared, Ordering::Relaxed);
                if let Err(err) = self.drain_readers(rt, mode) {
                    self.n_shared
                        .store(-self.n_completed.swap(0, Ordering::Relaxed), Ordering::Relaxed);
                    self.release_both(rt)?;
                    return Err(err);
                }
                self.n_shared.store(0, Ordering::Relaxed);
            }
        }
        self.n_exclusive.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Sleep on `completed` until every reader inside has left.
    fn drain_readers(&self, rt: &Runtime, mode: LockMode) -> Result<()> {
        let deadline = match mode {
            LockMode::Until(deadline) => Some(deadline),
            LockMode::Blocking | LockMode::Try => None,
        };
        while self.n_completed.load(Ordering::Relaxed) < 0 {
            self.completed.wait(rt, &self.shared_completed, deadline)?;
        }
        Ok(())
    }

    fn release_both(&self, rt: &Runtime) -> Result<()> {
        let inner = self.shared_completed.unlock(rt);
        self.exclusive.unlock(rt).and(inner)
    }

    /// `NotPermitted` when no reader or writer holds the lock. A stray reader
    /// unlock would otherwise count as a departure and admit a writer early.
    fn unlock(&self, rt: &Runtime) -> Result<()> {
        if self.n_exclusive.load(Ordering::Relaxed) == 0 {
            self.shared_completed.lock(rt)?;
            let completed = self.n_completed.load(Ordering::Relaxed);
            if completed >= 0 && self.n_shared.load(Ordering::Relaxed) <= completed {
                self.shared_completed.unlock(rt)?;
                return Err(Error::NotPermitted);
            }
            let signaled = if self.n_completed.fetch_add(1, Ordering::Relaxed) + 1 == 0 {
                self.completed.unblock(rt, false)
            } else {
                Ok(())
            };
            let released = self.shared_completed.unlock(rt);
            signaled.and(released)
        } else {
            self.n_exclusive.fetch_sub(1, Ordering::Relaxed);
            self.release_both(rt)
        }
    }

    fn check_destroyable(&self, rt: &Runtime) -> Result<()> {
        self.exclusive.try_lock(rt)?;
        if let Err(err) = self.shared_completed.try_lock(rt) {
            self.exclusive.unlock(rt)?;
            return Err(err);
        }
        let in_use = self.n_exclusive.load(Ordering::Relaxed) > 0
            || self.n_shared.load(Ordering::Relaxed) > self.n_completed.load(Ordering::Relaxed);
        self.release_both(rt)?;
        if in_use { Err(Error::Busy) } else { Ok(()) }
    }
}

/// A read-write lock. [`RwLock::new`] is a static initializer.
pub struct RwLock {
    cell: ObjectCell<RawRwLock>,
}

impl RwLock {
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

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    fn resolve_rwlock(&self, rwlock: &RwLock) -> Result<Arc<RawRwLock>> {
        rwlock
            .cell
            .resolve(&self.ctx.guards.rwlock, |()| Ok(Arc::new(RawRwLock::new(self)?)))
    }

    pub fn rwlock_init(&self, rwlock: &RwLock, attr: Option<&RwLockAttr>) -> Result<()> {
        attr.copied().unwrap_or_default().pshared().require_private()?;
        self.check_live()?;
        rwlock.cell.install(|| Ok(Arc::new(RawRwLock::new(self)?)))
    }

    /// `Busy` while any reader or writer holds the lock.
    pub fn rwlock_destroy(&self, rwlock: &RwLock) -> Result<()> {
        rwlock.cell.destroy(Some(&self.ctx.guards.rwlock), |raw| {
            raw.check_destroyable(self)?;
            let mut conds = self.ctx.conds.lock();
            Self::unregister_cond(&mut conds, &raw.completed);
            Ok(())
        })
    }

    pub fn rwlock_rdlock(&self, rwlock: &RwLock) -> Result<()> {
        self.resolve_rwlock(rwlock)?.read_lock(self, LockMode::Blocking)
    }

    /// `Busy` while a writer holds or is waiting for the lock.
    pub fn rwlock_tryrdlock(&self, rwlock: &RwLock) -> Result<()> {
        self.resolve_rwlock(rwlock)?.read_lock(self, LockMode::Try)
    }

    pub fn rwlock_timedrdlock(&self, rwlock: &RwLock, deadline: SystemTime) -> Result<()> {
        self.resolve_rwlock(rwlock)?
            .read_lock(self, LockMode::Until(deadline))
    }

    /// Cancellation point while readers drain.
    pub fn rwlock_wrlock(&self, rwlock: &RwLock) -> Result<()> {
        self.resolve_rwlock(rwlock)?.write_lock(self, LockMode::Blocking)
    }

    pub fn rwlock_trywrlock(&self, rwlock: &RwLock) -> Result<()> {
        self.resolve_rwlock(rwlock)?.write_lock(self, LockMode::Try)
    }

    pub fn rwlock_timedwrlock(&self, rwlock: &RwLock, deadline: SystemTime) -> Result<()> {
        self.resolve_rwlock(rwlock)?
            .write_lock(self, LockMode::Until(deadline))
    }

    /// Releases a read or write hold, whichever the caller has.
    pub fn rwlock_unlock(&self, rwlock: &RwLock) -> Result<()> {
        match rwlock.cell.ready_or_static()? {
            Some(raw) => raw.unlock(self),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;
    use embpthread_osal::HostOsal;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::init(Arc::new(HostOsal::new()), RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn readers_share_and_exclude_writers() {
        let rt = runtime();
        let lock = RwLock::new();
        rt.rwlock_rdlock(&lock).unwrap();
        rt.rwlock_tryrdlock(&lock).unwrap();
        assert_eq!(rt.rwlock_trywrlock(&lock).unwrap_err(), Error::Busy);
        rt.rwlock_unlock(&lock).unwrap();
        rt.rwlock_unlock(&lock).unwrap();
        rt.rwlock_trywrlock(&lock).unwrap();
        assert_eq!(rt.rwlock_tryrdlock(&lock).unwrap_err(), Error::Busy);
        rt.rwlock_unlock(&lock).unwrap();
        rt.rwlock_destroy(&lock).unwrap();
    }

    #[test]
    fn destroy_is_busy_while_held() {
        let rt = runtime();
        let lock = RwLock::new();
        rt.rwlock_init(&lock, None).unwrap();
        assert_eq!(rt.live_conds(), 1);
        rt.rwlock_rdlock(&lock).unwrap();
        assert_eq!(rt.rwlock_destroy(&lock).unwrap_err(), Error::Busy);
        rt.rwlock_unlock(&lock).unwrap();
        rt.rwlock_destroy(&lock).unwrap();
        assert_eq!(rt.live_conds(), 0);
        assert_eq!(rt.rwlock_rdlock(&lock).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn timed_write_gives_up_and_readers_continue() {
        let rt = runtime();
        let lock = RwLock::new();
        rt.rwlock_rdlock(&lock).unwrap();
        let deadline = SystemTime::now() + Duration::from_millis(20);
        assert_eq!(rt.rwlock_timedwrlock(&lock, deadline).unwrap_err(), Error::TimedOut);
        rt.rwlock_rdlock(&lock).unwrap();
        rt.rwlock_unlock(&lock).unwrap();
        rt.rwlock_unlock(&lock).unwrap();
        rt.rwlock_wrlock(&lock).unwrap();
        rt.rwlock_unlock(&lock).unwrap();
    }

    #[test]
    fn unlock_without_holder_is_rejected() {
        let rt = runtime();
        let lock = RwLock::new();
        rt.rwlock_init(&lock, None).unwrap();
        assert_eq!(rt.rwlock_unlock(&lock).unwrap_err(), Error::NotPermitted);

        rt.rwlock_rdlock(&lock).unwrap();
        rt.rwlock_unlock(&lock).unwrap();
        assert_eq!(rt.rwlock_unlock(&lock).unwrap_err(), Error::NotPermitted);

        // The rejected unlocks left no credit behind for a writer to use.
        rt.rwlock_rdlock(&lock).unwrap();
        assert_eq!(rt.rwlock_trywrlock(&lock).unwrap_err(), Error::Busy);
        rt.rwlock_unlock(&lock).unwrap();
        rt.rwlock_trywrlock(&lock).unwrap();
        rt.rwlock_unlock(&lock).unwrap();
        rt.rwlock_destroy(&lock).unwrap();
    }

    #[test]
    fn writer_waits_for_reader_to_leave() {
        let rt = runtime();
        let lock = Arc::new(RwLock::new());
        rt.rwlock_rdlock(&lock).unwrap();
        let worker = rt.clone();
        let wlock = lock.clone();
        let writer = rt
            .create(None, move || {
                worker.rwlock_wrlock(&wlock)?;
                worker.rwlock_unlock(&wlock)?;
                Ok(7)
            })
            .unwrap();
        // Once the writer is draining, new readers are turned away.
        while rt.rwlock_tryrdlock(&lock).is_ok() {
            rt.rwlock_unlock(&lock).unwrap();
            std::thread::yield_now();
        }
        rt.rwlock_unlock(&lock).unwrap();
        assert_eq!(rt.join(writer).unwrap().value(), Some(7));
        rt.rwlock_destroy(&lock).unwrap();
    }
}
