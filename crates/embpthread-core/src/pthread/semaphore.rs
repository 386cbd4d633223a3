//! Counting semaphores.
//!
//! The value lives under an internal lock with an OSAL semaphore behind it.
//! A negative value counts blocked waiters; posts only reach the OSAL
//! semaphore when someone is waiting. A waiter that times out or is canceled
//! re-takes the lock and polls the OSAL semaphore once. Without a post it
//! gives its reservation back. With one, a timed-out waiter keeps the unit
//! and a canceled waiter posts it again for the next taker.
//!
//! Barriers and condition variables are built on [`RawSemaphore`].

use std::sync::Arc;
use std::time::SystemTime;

use embpthread_osal::{OsSemaphore, Osal};

use crate::error::{Error, Result};
use crate::object::ObjectCell;
use crate::oslock::OsLock;
use crate::pthread::attr::ProcessShared;
use crate::runtime::Runtime;
use crate::time::relative_millis;

/// Largest value a semaphore can hold.
pub const SEM_VALUE_MAX: i32 = i32::MAX;

pub(crate) struct RawSemaphore {
    value: OsLock<i32>,
    sem: Box<dyn OsSemaphore>,
}

impl RawSemaphore {
    pub(crate) fn new(osal: &dyn Osal, initial: u32) -> Result<Self> {
        let initial = i32::try_from(initial).map_err(|_| Error::InvalidArgument)?;
        Ok(Self {
            value: OsLock::new(osal, initial)?,
            sem: osal.semaphore_create(0)?,
        })
    }

    /// Take one unit. With `cancellable`, this is a cancellation point.
    pub(crate) fn wait(
        &self,
        rt: &Runtime,
        deadline: Option<SystemTime>,
        cancellable: bool,
    ) -> Result<()> {
        if cancellable {
            rt.test_cancel()?;
        }
        let value = {
            let mut value = self.value.lock();
            *value -= 1;
            *value
        };
        if value >= 0 {
            return Ok(());
        }

        let timeout = deadline.map(relative_millis);
        let result = if cancellable {
            rt.cancellable_pend(self.sem.as_ref(), timeout)
        } else {
            self.sem.pend(timeout).map_err(Error::from)
        };
        match result {
            Ok(()) => Ok(()),
            Err(Error::TimedOut) => {
                let mut value = self.value.lock();
                if self.sem.pend(Some(0)).is_ok() {
                    Ok(())
                } else {
                    *value += 1;
                    Err(Error::TimedOut)
                }
            }
            Err(err) => {
                let raced = {
                    let mut value = self.value.lock();
                    let raced = self.sem.pend(Some(0)).is_ok();
                    if !raced {
                        *value += 1;
                    }
                    raced
                };
                // A post that raced the cancellation was meant for this
                // waiter. Hand the unit on, since we unwind without using it.
                if raced && let Err(repost) = self.post() {
                    tracing::warn!(%repost, "could not return a raced semaphore unit");
                }
                Err(err)
            }
        }
    }

    pub(crate) fn try_wait(&self) -> Result<()> {
        let mut value = self.value.lock();
        if *value > 0 {
            *value -= 1;
            Ok(())
        } else {
            Err(Error::ResourceExhausted)
        }
    }

    pub(crate) fn post(&self) -> Result<()> {
        self.post_multiple(1)
    }

    /// Release `count` units, waking at most that many waiters.
    pub(crate) fn post_multiple(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidArgument);
        }
        let count = i32::try_from(count).map_err(|_| Error::ResourceExhausted)?;
        let mut value = self.value.lock();
        if *value > SEM_VALUE_MAX - count {
            return Err(Error::ResourceExhausted);
        }
        let waiters = (-*value).max(0);
        *value += count;
        if waiters > 0 {
            let wake = waiters.min(count).unsigned_abs();
            if self.sem.post(wake).is_err() {
                *value -= count;
                return Err(Error::InvalidArgument);
            }
        }
        Ok(())
    }

    /// Current value; negative means that many waiters are blocked.
    pub(crate) fn value(&self) -> i32 {
        *self.value.lock()
    }

    /// `Busy` while any waiter is blocked.
    pub(crate) fn check_idle(&self) -> Result<()> {
        if *self.value.lock() < 0 {
            Err(Error::Busy)
        } else {
            Ok(())
        }
    }
}

/// A counting semaphore. Must be initialized with [`Runtime::sem_init`].
pub struct Semaphore {
    cell: ObjectCell<RawSemaphore>,
}

impl Semaphore {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: ObjectCell::uninit(),
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn sem_init(&self, sem: &Semaphore, pshared: ProcessShared, value: u32) -> Result<()> {
        pshared.require_private()?;
        if value > SEM_VALUE_MAX.unsigned_abs() {
            return Err(Error::InvalidArgument);
        }
        self.check_live()?;
        sem.cell
            .install(|| Ok(Arc::new(RawSemaphore::new(self.ctx.osal.as_ref(), value)?)))
    }

    /// `Busy` while threads are blocked on `sem`.
    pub fn sem_destroy(&self, sem: &Semaphore) -> Result<()> {
        sem.cell.destroy(None, |raw| raw.check_idle())
    }

    /// Cancellation point.
    pub fn sem_wait(&self, sem: &Semaphore) -> Result<()> {
        sem.cell.ready()?.wait(self, None, true)
    }

    /// `ResourceExhausted` when no unit is available.
    pub fn sem_trywait(&self, sem: &Semaphore) -> Result<()> {
        sem.cell.ready()?.try_wait()
    }

    /// Cancellation point.
    pub fn sem_timedwait(&self, sem: &Semaphore, deadline: SystemTime) -> Result<()> {
        sem.cell.ready()?.wait(self, Some(deadline), true)
    }

    pub fn sem_post(&self, sem: &Semaphore) -> Result<()> {
        sem.cell.ready()?.post()
    }

    pub fn sem_post_multiple(&self, sem: &Semaphore, count: u32) -> Result<()> {
        sem.cell.ready()?.post_multiple(count)
    }

    /// Current value; negative values report the number of blocked waiters.
    pub fn sem_getvalue(&self, sem: &Semaphore) -> Result<i32> {
        Ok(sem.cell.ready()?.value())
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
    fn uninitialized_semaphore_is_invalid() {
        let rt = runtime();
        let sem = Semaphore::new();
        assert_eq!(rt.sem_post(&sem).unwrap_err(), Error::InvalidArgument);
        assert_eq!(rt.sem_destroy(&sem).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn trywait_consumes_available_units() {
        let rt = runtime();
        let sem = Semaphore::new();
        rt.sem_init(&sem, ProcessShared::Private, 2).unwrap();
        rt.sem_trywait(&sem).unwrap();
        rt.sem_trywait(&sem).unwrap();
        assert_eq!(rt.sem_trywait(&sem).unwrap_err(), Error::ResourceExhausted);
        rt.sem_post(&sem).unwrap();
        assert_eq!(rt.sem_getvalue(&sem).unwrap(), 1);
    }

    #[test]
    fn timedwait_times_out_and_restores_value() {
        let rt = runtime();
        let sem = Semaphore::new();
        rt.sem_init(&sem, ProcessShared::Private, 0).unwrap();
        let deadline = SystemTime::now() + Duration::from_millis(20);
        assert_eq!(rt.sem_timedwait(&sem, deadline).unwrap_err(), Error::TimedOut);
        assert_eq!(rt.sem_getvalue(&sem).unwrap(), 0);
    }

    #[test]
    fn post_multiple_wakes_blocked_waiters() {
        let rt = runtime();
        let sem = Arc::new(Semaphore::new());
        rt.sem_init(&sem, ProcessShared::Private, 0).unwrap();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let worker = rt.clone();
                let sem = sem.clone();
                rt.create(None, move || worker.sem_wait(&sem).map(|()| 1))
                    .unwrap()
            })
            .collect();
        while rt.sem_getvalue(&sem).unwrap() != -3 {
            std::thread::yield_now();
        }
        rt.sem_post_multiple(&sem, 5).unwrap();
        for waiter in waiters {
            assert_eq!(rt.join(waiter).unwrap().value(), Some(1));
        }
        assert_eq!(rt.sem_getvalue(&sem).unwrap(), 2);
    }

    #[test]
    fn destroy_is_busy_with_waiters() {
        let rt = runtime();
        let sem = Arc::new(Semaphore::new());
        rt.sem_init(&sem, ProcessShared::Private, 0).unwrap();
        let worker = rt.clone();
        let waiting = sem.clone();
        let t = rt.create(None, move || worker.sem_wait(&waiting).map(|()| 0)).unwrap();
        while rt.sem_getvalue(&sem).unwrap() >= 0 {
            std::thread::yield_now();
        }
        assert_eq!(rt.sem_destroy(&sem).unwrap_err(), Error::Busy);
        rt.sem_post(&sem).unwrap();
        rt.join(t).unwrap();
        rt.sem_destroy(&sem).unwrap();
    }

    #[test]
    fn overflow_and_shared_are_rejected() {
        let rt = runtime();
        let sem = Semaphore::new();
        assert_eq!(
            rt.sem_init(&sem, ProcessShared::Shared, 0).unwrap_err(),
            Error::NotSupported
        );
        rt.sem_init(&sem, ProcessShared::Private, SEM_VALUE_MAX.unsigned_abs())
            .unwrap();
        assert_eq!(rt.sem_post(&sem).unwrap_err(), Error::ResourceExhausted);
        assert_eq!(rt.sem_post_multiple(&sem, 0).unwrap_err(), Error::InvalidArgument);
    }
}
