//! Deferred cancellation and cleanup handlers.
//!
//! A cancel request moves the target to `CancelPending` and asks the OSAL to
//! interrupt its cancellable waits. The target acts on it at the next
//! cancellation point: it moves to `Canceling`, disables further
//! cancellation, and the cancellation point returns [`Error::Canceled`].
//! Propagating that error with `?` drops the thread's [`CleanupGuard`]s,
//! which run their routines while the thread is unwinding.

use embpthread_osal::{OsError, OsSemaphore};
use tracing::debug;

use crate::error::{Error, Result};
use crate::pthread::reuse::ThreadSlot;
use crate::pthread::thread::{Pthread, ThreadState};
use crate::runtime::Runtime;

#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelState {
    #[default]
    Enable = 0,
    Disable = 1,
}

impl CancelState {
    pub(crate) const fn from_u8(value: u8) -> Self {
        if value == Self::Disable as u8 {
            Self::Disable
        } else {
            Self::Enable
        }
    }
}

#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelType {
    #[default]
    Deferred = 0,
    Asynchronous = 1,
}

impl CancelType {
    pub(crate) const fn from_u8(value: u8) -> Self {
        if value == Self::Asynchronous as u8 {
            Self::Asynchronous
        } else {
            Self::Deferred
        }
    }
}

impl Runtime {
    /// Request cancellation of `thread`.
    ///
    /// Asynchronous cancellation only acts on the calling thread itself, which
    /// then receives `Err(Canceled)`; asking another thread with asynchronous
    /// cancellation enabled reports `NotPermitted`.
    pub fn cancel(&self, thread: Pthread) -> Result<()> {
        self.kill(thread, 0)?;
        let me = self.current()?;
        let target = self.ctx.threads.validate(thread, |slot| Ok(slot.clone()))?;
        let control = target.control.lock();
        let state = target.state();

        if target.cancel_type() == CancelType::Asynchronous
            && target.cancel_state() == CancelState::Enable
            && state < ThreadState::Canceling
        {
            if me.handle() != thread {
                return Err(Error::NotPermitted);
            }
            target.set_state(ThreadState::Canceling);
            target.set_cancel_state(CancelState::Disable);
            drop(control);
            debug!(thread = thread.index(), "acting on asynchronous self-cancel");
            return Err(Error::Canceled);
        }

        if state >= ThreadState::Canceling {
            return Err(Error::NotFound);
        }
        if state < ThreadState::CancelPending {
            target.set_state(ThreadState::CancelPending);
            let os_id = control.os_id.ok_or(Error::NotFound)?;
            self.ctx
                .osal
                .thread_cancel(os_id)
                .map_err(|_| Error::NotFound)?;
            debug!(thread = thread.index(), "cancellation requested");
        }
        Ok(())
    }

    /// Set the calling thread's cancel state, returning the previous one.
    ///
    /// Enabling with asynchronous type while a request is pending acts on it.
    pub fn set_cancel_state(&self, state: CancelState) -> Result<CancelState> {
        let me = self.current()?;
        let _control = me.control.lock();
        let old = me.cancel_state();
        me.set_cancel_state(state);
        if state == CancelState::Enable
            && me.cancel_type() == CancelType::Asynchronous
            && me.state() == ThreadState::CancelPending
        {
            return Err(Self::begin_canceling(&me));
        }
        Ok(old)
    }

    /// Set the calling thread's cancel type, returning the previous one.
    pub fn set_cancel_type(&self, ty: CancelType) -> Result<CancelType> {
        let me = self.current()?;
        let _control = me.control.lock();
        let old = me.cancel_type();
        me.set_cancel_type(ty);
        if ty == CancelType::Asynchronous
            && me.cancel_state() == CancelState::Enable
            && me.state() == ThreadState::CancelPending
        {
            return Err(Self::begin_canceling(&me));
        }
        Ok(old)
    }

    /// Explicit cancellation point.
    pub fn test_cancel(&self) -> Result<()> {
        let Some(me) = self.current_if_registered() else {
            return Ok(());
        };
        if me.state() != ThreadState::CancelPending {
            return Ok(());
        }
        let _control = me.control.lock();
        if me.state() == ThreadState::CancelPending && me.cancel_state() == CancelState::Enable {
            return Err(Self::begin_canceling(&me));
        }
        Ok(())
    }

    /// Push a cleanup routine. See [`CleanupGuard`].
    pub fn cleanup_push<F: FnOnce()>(&self, routine: F) -> CleanupGuard<'_, F> {
        CleanupGuard {
            rt: self,
            routine: Some(routine),
        }
    }

    /// Pend on `sem`, interruptibly when the caller has cancellation enabled.
    ///
    /// An interrupted wait turns into `Err(Canceled)` unless the caller is
    /// already canceling, which reports `InvalidArgument`.
    pub(crate) fn cancellable_pend(
        &self,
        sem: &dyn OsSemaphore,
        timeout_ms: Option<u32>,
    ) -> Result<()> {
        let me = self.current().ok();
        let enabled = me
            .as_ref()
            .is_some_and(|slot| slot.cancel_state() == CancelState::Enable);
        let result = if enabled {
            sem.cancellable_pend(timeout_ms)
        } else {
            sem.pend(timeout_ms)
        };
        match result {
            Ok(()) => Ok(()),
            Err(OsError::Timeout) => Err(Error::TimedOut),
            Err(OsError::Interrupted) => {
                if let Some(me) = me {
                    self.acknowledge_cancel(&me)?;
                }
                Err(Error::InvalidArgument)
            }
            Err(_) => Err(Error::InvalidArgument),
        }
    }

    /// Act on an OS-level interruption: `Err(Canceled)` if the caller was not
    /// already canceling, `Ok(())` otherwise.
    pub(crate) fn acknowledge_cancel(&self, me: &ThreadSlot) -> Result<()> {
        let _control = me.control.lock();
        if me.state() < ThreadState::Canceling {
            return Err(Self::begin_canceling(me));
        }
        Ok(())
    }

    /// Caller holds `me.control`.
    fn begin_canceling(me: &ThreadSlot) -> Error {
        me.set_state(ThreadState::Canceling);
        me.set_cancel_state(CancelState::Disable);
        debug!(thread = me.index, "acting on cancellation");
        Error::Canceled
    }

    pub(crate) fn is_unwinding(&self) -> bool {
        self.current_if_registered().is_some_and(|me| {
            matches!(me.state(), ThreadState::Canceling | ThreadState::Exiting)
        })
    }
}

/// A pushed cleanup routine.
///
/// [`CleanupGuard::pop`] removes it, running it when asked. A guard dropped
/// without `pop` runs its routine only while the thread is canceling or
/// exiting, which is what happens when `Err(Canceled)` or `Err(Exited)` is
/// propagated past it. Guards drop in reverse order of creation.
#[must_use = "dropping the guard immediately discards the routine"]
pub struct CleanupGuard<'a, F: FnOnce()> {
    rt: &'a Runtime,
    routine: Option<F>,
}

impl<F: FnOnce()> CleanupGuard<'_, F> {
    pub fn pop(mut self, execute: bool) {
        if let Some(routine) = self.routine.take() {
            if execute {
                routine();
            }
        }
    }
}

impl<F: FnOnce()> Drop for CleanupGuard<'_, F> {
    fn drop(&mut self) {
        if let Some(routine) = self.routine.take() {
            if self.rt.is_unwinding() {
                routine();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExitStatus, RuntimeConfig};
    use embpthread_osal::HostOsal;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::init(Arc::new(HostOsal::new()), RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn deferred_cancel_acts_at_test_cancel() {
        let rt = runtime();
        let worker = rt.clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let t = rt
            .create(None, move || {
                ready_tx.send(()).ok();
                go_rx.recv().ok();
                worker.test_cancel()?;
                Ok(0)
            })
            .unwrap();
        ready_rx.recv().unwrap();
        rt.cancel(t).unwrap();
        assert_eq!(rt.thread_state(t).unwrap(), ThreadState::CancelPending);
        go_tx.send(()).unwrap();
        assert_eq!(rt.join(t).unwrap(), ExitStatus::Canceled);
    }

    #[test]
    fn disabled_cancel_is_held_until_enabled() {
        let rt = runtime();
        let worker = rt.clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let survived = Arc::new(AtomicBool::new(false));
        let survived_flag = survived.clone();
        let t = rt
            .create(None, move || {
                worker.set_cancel_state(CancelState::Disable)?;
                ready_tx.send(()).ok();
                go_rx.recv().ok();
                worker.test_cancel()?;
                survived_flag.store(true, Ordering::SeqCst);
                worker.set_cancel_state(CancelState::Enable)?;
                worker.test_cancel()?;
                Ok(0)
            })
            .unwrap();
        ready_rx.recv().unwrap();
        rt.cancel(t).unwrap();
        go_tx.send(()).unwrap();
        assert_eq!(rt.join(t).unwrap(), ExitStatus::Canceled);
        assert!(survived.load(Ordering::SeqCst));
    }

    #[test]
    fn delay_is_interrupted_by_cancel() {
        let rt = runtime();
        let worker = rt.clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let t = rt
            .create(None, move || {
                ready_tx.send(()).ok();
                worker.delay_np(Duration::from_secs(30))?;
                Ok(0)
            })
            .unwrap();
        ready_rx.recv().unwrap();
        rt.cancel(t).unwrap();
        assert_eq!(rt.join(t).unwrap(), ExitStatus::Canceled);
    }

    #[test]
    fn cleanup_runs_on_cancel_but_not_on_normal_drop() {
        let rt = runtime();
        let worker = rt.clone();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_thread = ran.clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let t = rt
            .create(None, move || {
                {
                    let _discarded = worker.cleanup_push(|| {
                        ran_in_thread.fetch_add(100, Ordering::SeqCst);
                    });
                }
                let _guard = worker.cleanup_push(|| {
                    ran_in_thread.fetch_add(1, Ordering::SeqCst);
                });
                ready_tx.send(()).ok();
                worker.delay_np(Duration::from_secs(30))?;
                Ok(0)
            })
            .unwrap();
        ready_rx.recv().unwrap();
        rt.cancel(t).unwrap();
        assert_eq!(rt.join(t).unwrap(), ExitStatus::Canceled);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pop_executes_on_request() {
        let rt = runtime();
        let mut hits = 0;
        rt.cleanup_push(|| hits += 1).pop(true);
        assert_eq!(hits, 1);
        let mut misses = 0;
        rt.cleanup_push(|| misses += 1).pop(false);
        assert_eq!(misses, 0);
    }

    #[test]
    fn async_self_cancel_acts_immediately() {
        let rt = runtime();
        let worker = rt.clone();
        let t = rt
            .create(None, move || {
                worker.set_cancel_type(CancelType::Asynchronous)?;
                let me = worker.self_id()?;
                worker.cancel(me)?;
                Ok(0)
            })
            .unwrap();
        assert_eq!(rt.join(t).unwrap(), ExitStatus::Canceled);
    }

    #[test]
    fn async_cancel_of_other_thread_is_not_permitted() {
        let rt = runtime();
        let worker = rt.clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let t = rt
            .create(None, move || {
                worker.set_cancel_type(CancelType::Asynchronous)?;
                ready_tx.send(()).ok();
                go_rx.recv().ok();
                Ok(5)
            })
            .unwrap();
        ready_rx.recv().unwrap();
        assert_eq!(rt.cancel(t).unwrap_err(), Error::NotPermitted);
        go_tx.send(()).unwrap();
        assert_eq!(rt.join(t).unwrap(), ExitStatus::Value(5));
    }

    #[test]
    fn set_cancel_state_returns_previous() {
        let rt = runtime();
        assert_eq!(rt.set_cancel_state(CancelState::Disable).unwrap(), CancelState::Enable);
        assert_eq!(rt.set_cancel_state(CancelState::Enable).unwrap(), CancelState::Disable);
        assert_eq!(rt.set_cancel_type(CancelType::Deferred).unwrap(), CancelType::Deferred);
    }

    #[test]
    fn cancel_of_ended_thread_is_not_found() {
        let rt = runtime();
        let t = rt.create(None, || Ok(0)).unwrap();
        while rt.thread_state(t).unwrap() != ThreadState::Last {
            std::thread::yield_now();
        }
        assert_eq!(rt.cancel(t).unwrap_err(), Error::NotFound);
        assert_eq!(rt.join(t).unwrap(), ExitStatus::Value(0));
    }
}
