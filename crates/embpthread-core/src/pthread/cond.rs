//! Condition variables.
//!
//! Two-semaphore scheme with three counters:
//! - `blocked`: waiters that entered and were not yet chosen by a signal;
//! - `gone`: waiters that left by timeout or cancellation without being chosen;
//! - `to_unblock`: waiters chosen by the signal currently being delivered.
//!
//! `block_lock` is a binary gate: waiters pass it to register, and a signal
//! holds it from the moment it chooses waiters until the last chosen waiter
//! has left, so late arrivals cannot steal wakeups. `block_queue` is where
//! waiters sleep. `unblock_lock` guards `gone` and `to_unblock`.
//!
//! `gone` is folded back into `blocked` by signals, and by a leaving waiter
//! once it reaches `i32::MAX / 2`, so neither counter overflows.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::SystemTime;

use embpthread_osal::Osal;

use crate::error::{Error, Result};
use crate::object::ObjectCell;
use crate::pthread::attr::CondAttr;
use crate::pthread::mutex::{Mutex, MutexKind, RawMutex};
use crate::pthread::semaphore::RawSemaphore;
use crate::runtime::Runtime;

const GONE_FOLD_THRESHOLD: i32 = i32::MAX / 2;

/// Snapshot of a condition variable's waiter accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CondCounters {
    pub blocked: i32,
    pub gone: i32,
    pub to_unblock: i32,
}

pub(crate) struct RawCond {
    blocked: AtomicI32,
    gone: AtomicI32,
    to_unblock: AtomicI32,
    block_lock: RawSemaphore,
    block_queue: RawSemaphore,
    unblock_lock: RawMutex,
    gone_fold_at: i32,
}

impl RawCond {
    pub(crate) fn new(osal: &dyn Osal) -> Result<Self> {
        Ok(Self {
            blocked: AtomicI32::new(0),
            gone: AtomicI32::new(0),
            to_unblock: AtomicI32::new(0),
            block_lock: RawSemaphore::new(osal, 1)?,
            block_queue: RawSemaphore::new(osal, 0)?,
            unblock_lock: RawMutex::new(osal, MutexKind::Normal)?,
            gone_fold_at: GONE_FOLD_THRESHOLD,
        })
    }

    /// Release `mutex`, sleep until signaled or `deadline`, reacquire `mutex`.
    ///
    /// A cancellation point. When canceled, the mutex is reacquired before
    /// `Err(Canceled)` is returned.
    pub(crate) fn wait(
        &self,
        rt: &Runtime,
        mutex: &RawMutex,
        deadline: Option<SystemTime>,
    ) -> Result<()> {
        self.block_lock.wait(rt, None, true)?;
        self.blocked.fetch_add(1, Ordering::Relaxed);
        self.block_lock.post()?;

        if let Err(err) = mutex.unlock(rt) {
            self.retract(rt)?;
            return Err(err);
        }

        let waited = self.block_queue.wait(rt, deadline, true);
        let retracted = self.retract(rt);
        let relocked = mutex.lock(rt);
        match waited {
            Err(err) if err.is_unwind() => Err(err),
            waited => retracted.and(relocked).and(waited),
        }
    }

    /// Bookkeeping for a waiter leaving, woken or not.
    fn retract(&self, rt: &Runtime) -> Result<()> {
        self.unblock_lock.lock(rt)?;
        let signals_left = self.to_unblock.load(Ordering::Relaxed);
        if signals_left != 0 {
            self.to_unblock.store(signals_left - 1, Ordering::Relaxed);
        } else if self.gone.fetch_add(1, Ordering::Relaxed) + 1 == self.gone_fold_at {
            if let Err(err) = self.fold_gone(rt) {
                let _ = self.unblock_lock.unlock(rt);
                return Err(err);
            }
        }
        self.unblock_lock.unlock(rt)?;
        if signals_left == 1 {
            // Last chosen waiter out: reopen the gate.
            self.block_lock.post()?;
        }
        Ok(())
    }

    /// Caller holds `unblock_lock`.
    fn fold_gone(&self, rt: &Runtime) -> Result<()> {
        self.block_lock.wait(rt, None, false)?;
        let gone = self.gone.load(Ordering::Relaxed);
        self.blocked.fetch_sub(gone, Ordering::Relaxed);
        self.block_lock.post()?;
        self.gone.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Wake one waiter, or all of them with `all`.
    pub(crate) fn unblock(&self, rt: &Runtime, all: bool) -> Result<()> {
        self.unblock_lock.lock(rt)?;
        let to_unblock = self.to_unblock.load(Ordering::Relaxed);
        let blocked = self.blocked.load(Ordering::Relaxed);

        let signals = if to_unblock != 0 {
            // A signal is still in flight and holds the gate.
            if blocked == 0 {
                return self.unblock_lock.unlock(rt);
            }
            let signals = if all { blocked } else { 1 };
            self.to_unblock.store(to_unblock + signals, Ordering::Relaxed);
            self.blocked.store(blocked - signals, Ordering::Relaxed);
            signals
        } else if blocked > self.gone.load(Ordering::Relaxed) {
            if let Err(err) = self.block_lock.wait(rt, None, false) {
                let _ = self.unblock_lock.unlock(rt);
                return Err(err);
            }
            let gone = self.gone.swap(0, Ordering::Relaxed);
            let blocked = blocked - gone;
            let signals = if all { blocked } else { 1 };
            self.to_unblock.store(signals, Ordering::Relaxed);
            self.blocked.store(blocked - signals, Ordering::Relaxed);
            signals
        } else {
            return self.unblock_lock.unlock(rt);
        };

        self.unblock_lock.unlock(rt)?;
        self.block_queue.post_multiple(signals.unsigned_abs())
    }

    /// Leaves both locks held on success; the object is about to be retired.
    fn check_destroyable(&self, rt: &Runtime) -> Result<()> {
        self.block_lock.wait(rt, None, false)?;
        if let Err(err) = self.unblock_lock.try_lock(rt) {
            self.block_lock.post()?;
            return Err(err);
        }
        if self.blocked.load(Ordering::Relaxed) > self.gone.load(Ordering::Relaxed) {
            let reopened = self.block_lock.post();
            self.unblock_lock.unlock(rt)?;
            reopened?;
            return Err(Error::Busy);
        }
        Ok(())
    }

    fn counters(&self, rt: &Runtime) -> Result<CondCounters> {
        self.unblock_lock.lock(rt)?;
        let counters = CondCounters {
            blocked: self.blocked.load(Ordering::Relaxed),
            gone: self.gone.load(Ordering::Relaxed),
            to_unblock: self.to_unblock.load(Ordering::Relaxed),
        };
        self.unblock_lock.unlock(rt)?;
        Ok(counters)
    }
}

/// A condition variable. [`Cond::new`] is a static initializer.
pub struct Cond {
    cell: ObjectCell<RawCond>,
}

impl Cond {
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

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Create a condition variable and add it to the registry.
    pub(crate) fn register_cond(&self) -> Result<Arc<RawCond>> {
        let raw = Arc::new(RawCond::new(self.ctx.osal.as_ref())?);
        self.ctx.conds.lock().push(raw.clone());
        Ok(raw)
    }

    /// Caller holds the registry lock through `conds`.
    pub(crate) fn unregister_cond(conds: &mut Vec<Arc<RawCond>>, raw: &Arc<RawCond>) {
        conds.retain(|cv| !Arc::ptr_eq(cv, raw));
    }

    fn resolve_cond(&self, cond: &Cond) -> Result<Arc<RawCond>> {
        cond.cell
            .resolve(&self.ctx.guards.cond, |()| self.register_cond())
    }

    pub fn cond_init(&self, cond: &Cond, attr: Option<&CondAttr>) -> Result<()> {
        attr.copied().unwrap_or_default().pshared().require_private()?;
        self.check_live()?;
        cond.cell.install(|| self.register_cond())
    }

    /// `Busy` while threads are waiting on `cond`.
    pub fn cond_destroy(&self, cond: &Cond) -> Result<()> {
        cond.cell.destroy(Some(&self.ctx.guards.cond), |raw| {
            let mut conds = self.ctx.conds.lock();
            raw.check_destroyable(self)?;
            Self::unregister_cond(&mut conds, raw);
            Ok(())
        })
    }

    /// Cancellation point. `mutex` must be held by the caller.
    pub fn cond_wait(&self, cond: &Cond, mutex: &Mutex) -> Result<()> {
        let raw = self.resolve_cond(cond)?;
        let held = mutex.cell.ready()?;
        raw.wait(self, &held, None)
    }

    /// Like [`Runtime::cond_wait`], giving up with `TimedOut` at `deadline`.
    pub fn cond_timedwait(&self, cond: &Cond, mutex: &Mutex, deadline: SystemTime) -> Result<()> {
        let raw = self.resolve_cond(cond)?;
        let held = mutex.cell.ready()?;
        raw.wait(self, &held, Some(deadline))
    }

    /// Wake one waiter. A no-op on a static condition variable never waited on.
    pub fn cond_signal(&self, cond: &Cond) -> Result<()> {
        match cond.cell.ready_or_static()? {
            Some(raw) => raw.unblock(self, false),
            None => Ok(()),
        }
    }

    pub fn cond_broadcast(&self, cond: &Cond) -> Result<()> {
        match cond.cell.ready_or_static()? {
            Some(raw) => raw.unblock(self, true),
            None => Ok(()),
        }
    }

    /// Broadcast every live condition variable, so timed waiters re-evaluate
    /// their deadlines after a wall-clock change.
    ///
    /// `ResourceExhausted` if any broadcast failed.
    pub fn timechange_handler_np(&self) -> Result<()> {
        let conds = self.ctx.conds.lock();
        let failed = conds
            .iter()
            .filter(|cv| cv.unblock(self, true).is_err())
            .count();
        if failed > 0 {
            return Err(Error::ResourceExhausted);
        }
        Ok(())
    }

    /// Waiter accounting snapshot, taken under the condition's internal lock.
    pub fn cond_counters(&self, cond: &Cond) -> Result<CondCounters> {
        match cond.cell.ready_or_static()? {
            Some(raw) => raw.counters(self),
            None => Ok(CondCounters::default()),
        }
    }

    /// Number of condition variables in the registry.
    #[must_use]
    pub fn live_conds(&self) -> usize {
        self.ctx.conds.lock().len()
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
    fn signal_on_unused_static_cond_is_noop() {
        let rt = runtime();
        let cv = Cond::new();
        rt.cond_signal(&cv).unwrap();
        rt.cond_broadcast(&cv).unwrap();
        assert_eq!(rt.live_conds(), 0);
        rt.cond_destroy(&cv).unwrap();
        assert_eq!(rt.cond_signal(&cv).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn timedwait_times_out_with_mutex_reacquired() {
        let rt = runtime();
        let cv = Cond::new();
        let m = Mutex::new_static(MutexKind::ErrorCheck);
        rt.mutex_lock(&m).unwrap();
        let deadline = SystemTime::now() + Duration::from_millis(20);
        assert_eq!(rt.cond_timedwait(&cv, &m, deadline).unwrap_err(), Error::TimedOut);
        assert_eq!(rt.mutex_lock(&m).unwrap_err(), Error::WouldDeadlock);
        let counters = rt.cond_counters(&cv).unwrap();
        assert_eq!(counters.blocked, 1);
        assert_eq!(counters.gone, 1);
        rt.mutex_unlock(&m).unwrap();
        rt.cond_destroy(&cv).unwrap();
    }

    #[test]
    fn wait_without_holding_errorcheck_mutex_is_rejected() {
        let rt = runtime();
        let cv = Cond::new();
        let m = Mutex::new_static(MutexKind::ErrorCheck);
        rt.mutex_lock(&m).unwrap();
        rt.mutex_unlock(&m).unwrap();
        assert_eq!(rt.cond_wait(&cv, &m).unwrap_err(), Error::NotPermitted);
        rt.cond_destroy(&cv).unwrap();
    }

    #[test]
    fn registry_tracks_init_and_destroy() {
        let rt = runtime();
        let a = Cond::new();
        let b = Cond::new();
        rt.cond_init(&a, None).unwrap();
        rt.cond_init(&b, None).unwrap();
        assert_eq!(rt.live_conds(), 2);
        rt.timechange_handler_np().unwrap();
        rt.cond_destroy(&a).unwrap();
        assert_eq!(rt.live_conds(), 1);
        rt.cond_destroy(&b).unwrap();
        assert_eq!(rt.live_conds(), 0);
    }

    #[test]
    fn destroy_is_busy_with_waiters() {
        let rt = runtime();
        let cv = Arc::new(Cond::new());
        let m = Arc::new(Mutex::new());
        let (worker, wcv, wm) = (rt.clone(), cv.clone(), m.clone());
        let t = rt
            .create(None, move || {
                worker.mutex_lock(&wm)?;
                worker.cond_wait(&wcv, &wm)?;
                worker.mutex_unlock(&wm)?;
                Ok(1)
            })
            .unwrap();
        while rt.cond_counters(&cv).unwrap().blocked == 0 {
            std::thread::yield_now();
        }
        assert_eq!(rt.cond_destroy(&cv).unwrap_err(), Error::Busy);
        rt.mutex_lock(&m).unwrap();
        rt.cond_signal(&cv).unwrap();
        rt.mutex_unlock(&m).unwrap();
        assert_eq!(rt.join(t).unwrap().value(), Some(1));
        rt.cond_destroy(&cv).unwrap();
    }

    #[test]
    fn gone_counter_folds_before_overflow() {
        let rt = runtime();
        let mut raw = RawCond::new(rt.osal().as_ref()).unwrap();
        raw.gone_fold_at = 3;
        let mutex = RawMutex::new(rt.osal().as_ref(), MutexKind::Normal).unwrap();
        for _ in 0..3 {
            mutex.lock(&rt).unwrap();
            let deadline = SystemTime::now();
            assert_eq!(raw.wait(&rt, &mutex, Some(deadline)).unwrap_err(), Error::TimedOut);
            mutex.unlock(&rt).unwrap();
        }
        let counters = raw.counters(&rt).unwrap();
        assert_eq!(counters, CondCounters::default());
    }
}
