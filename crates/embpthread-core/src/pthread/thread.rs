//! Thread lifecycle: create, join, detach, exit, identity, scheduling.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use embpthread_osal::{OsError, ThreadSpawn};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::pthread::attr::{DetachState, InheritSched, SchedParam, SchedPolicy, ThreadAttr};
use crate::pthread::cancel::CancelState;
use crate::pthread::reuse::ThreadSlot;
use crate::runtime::Runtime;
use crate::time::interval_millis;

/// Thread identity: slot index plus the slot's generation when issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pthread {
    index: u32,
    generation: u32,
}

impl Pthread {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    pub(crate) const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

/// Thread lifecycle state. Ordered: comparisons such as `< Canceling` are
/// meaningful.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ThreadState {
    Initial = 0,
    Running = 1,
    Suspended = 2,
    CancelPending = 3,
    Canceling = 4,
    Exiting = 5,
    Last = 6,
}

impl ThreadState {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initial,
            1 => Self::Running,
            2 => Self::Suspended,
            3 => Self::CancelPending,
            4 => Self::Canceling,
            5 => Self::Exiting,
            _ => Self::Last,
        }
    }
}

/// How a joined thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Returned from its entry or called [`Runtime::exit`].
    Value(usize),
    /// Acted on a cancellation request.
    Canceled,
    /// Entry returned an error other than an unwinding signal.
    Failed(Error),
}

impl ExitStatus {
    #[must_use]
    pub const fn value(self) -> Option<usize> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_canceled(self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl Runtime {
    /// Create and start a thread running `entry`.
    pub fn create<F>(&self, attr: Option<&ThreadAttr>, entry: F) -> Result<Pthread>
    where
        F: FnOnce() -> Result<usize> + Send + 'static,
    {
        self.check_live()?;
        let defaults = ThreadAttr::new();
        let attr = attr.unwrap_or(&defaults);
        let osal = self.ctx.osal.clone();

        let priority = match attr.inherit_sched() {
            InheritSched::Inherit => self.current()?.control.lock().priority,
            InheritSched::Explicit => attr.sched_param().priority,
        };
        if !osal.thread_priority_range().contains(priority) {
            return Err(Error::InvalidArgument);
        }
        let stack_size = match attr.stack_size() {
            0 => self.ctx.config.default_stack_size,
            size => size,
        };

        let slot = self.ctx.threads.acquire(osal.as_ref())?;
        {
            let mut control = slot.control.lock();
            control.detach = attr.detach_state();
            control.priority = priority;
        }
        let handle = slot.handle();
        let spawn = ThreadSpawn {
            stack_size,
            priority,
            name: Some(format!("embpthread-{}", handle.index())),
        };
        let rt = self.clone();
        let worker = slot.clone();
        let os_id = match osal.thread_create(spawn, Box::new(move || thread_main(&rt, &worker, entry))) {
            Ok(id) => id,
            Err(err) => {
                self.ctx.threads.release(&slot);
                debug!(%err, "OS thread creation failed");
                return Err(Error::ResourceExhausted);
            }
        };
        slot.control.lock().os_id = Some(os_id);

        if let Err(err) = osal.thread_start(os_id) {
            slot.control.lock().os_id = None;
            if osal.thread_delete(os_id).is_err() {
                warn!(thread = handle.index(), "failed to delete unstarted OS thread");
            }
            self.ctx.threads.release(&slot);
            debug!(%err, "OS thread start failed");
            return Err(Error::ResourceExhausted);
        }
        debug!(
            thread = handle.index(),
            generation = handle.generation(),
            priority,
            stack_size,
            "thread created"
        );
        Ok(handle)
    }

    /// Wait for `thread` to end and reclaim its handle.
    ///
    /// A cancellation point: when the caller is canceled while waiting, the
    /// target is left joinable and `Err(Canceled)` is returned.
    pub fn join(&self, thread: Pthread) -> Result<ExitStatus> {
        let target = self.ctx.threads.validate(thread, |slot| {
            if slot.control.lock().detach == DetachState::Detached {
                Err(Error::InvalidArgument)
            } else {
                Ok(slot.clone())
            }
        })?;
        let me = self.current()?;
        if me.handle() == thread {
            return Err(Error::WouldDeadlock);
        }
        let os_id = target.control.lock().os_id.ok_or(Error::NotFound)?;
        let cancellable = me.cancel_state() == CancelState::Enable;

        match self.ctx.osal.thread_wait_for_end(os_id, cancellable) {
            Ok(()) => {
                let status = target
                    .control
                    .lock()
                    .exit
                    .unwrap_or(ExitStatus::Canceled);
                self.detach(thread)?;
                Ok(status)
            }
            Err(OsError::Interrupted) => {
                self.acknowledge_cancel(&me)?;
                Err(Error::InvalidArgument)
            }
            Err(_) => Err(Error::NotFound),
        }
    }

    /// Mark `thread` detached; reclaim it now if it already ended.
    pub fn detach(&self, thread: Pthread) -> Result<()> {
        let ended = self.ctx.threads.validate(thread, |slot| {
            let mut control = slot.control.lock();
            if control.detach == DetachState::Detached {
                return Err(Error::InvalidArgument);
            }
            if slot.state() == ThreadState::Last {
                Ok(Some((slot.clone(), control.os_id)))
            } else {
                control.detach = DetachState::Detached;
                Ok(None)
            }
        })?;
        if let Some((slot, os_id)) = ended {
            if let Some(id) = os_id {
                // Already in `Last`; the wait only covers the trampoline's tail.
                let _ = self.ctx.osal.thread_wait_for_end(id, false);
            }
            self.destroy_thread(&slot);
        }
        Ok(())
    }

    /// Handle of the calling thread, created on demand for threads this
    /// runtime did not start.
    pub fn self_id(&self) -> Result<Pthread> {
        Ok(self.current()?.handle())
    }

    #[must_use]
    pub fn equal(&self, a: Pthread, b: Pthread) -> bool {
        a == b
    }

    /// Liveness probe. Only signal `0` is supported.
    pub fn kill(&self, thread: Pthread, signal: i32) -> Result<()> {
        self.ctx.threads.validate(thread, |slot| {
            if slot.control.lock().os_id.is_some() {
                Ok(())
            } else {
                Err(Error::NotFound)
            }
        })?;
        if signal != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Record `value` as the calling thread's exit value and start unwinding.
    ///
    /// Always returns `Err(Exited)`; propagate it to the thread entry with `?`.
    pub fn exit<T>(&self, value: usize) -> Result<T> {
        if let Some(me) = self.current_if_registered() {
            let _control = me.control.lock();
            me.exit_value.store(value, Ordering::Release);
            if me.state() < ThreadState::Canceling {
                me.set_state(ThreadState::Exiting);
            }
        }
        Err(Error::Exited)
    }

    /// Release the calling thread's implicit handle, running its TSD
    /// destructors. Threads started by [`Runtime::create`] are reclaimed when
    /// their entry returns and report `InvalidArgument`.
    pub fn detach_np(&self) -> Result<()> {
        let Some(me) = self.current_if_registered() else {
            return Ok(());
        };
        if !me.control.lock().implicit {
            return Err(Error::InvalidArgument);
        }
        self.run_key_destructors(&me);
        {
            let _control = me.control.lock();
            me.set_state(ThreadState::Last);
        }
        if self.ctx.osal.tls_set(self.ctx.self_slot, 0).is_err() {
            warn!(thread = me.index, "failed to clear self-lookup slot");
        }
        self.destroy_thread(&me);
        Ok(())
    }

    /// Sleep for `interval`. A cancellation point.
    ///
    /// A zero interval yields once, testing for cancellation before and after.
    pub fn delay_np(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            self.test_cancel()?;
            self.ctx.osal.thread_sleep(1);
            return self.test_cancel();
        }
        let ms = interval_millis(interval);
        let me = self.current()?;
        if me.cancel_state() != CancelState::Enable {
            self.ctx.osal.thread_sleep(ms);
            return Ok(());
        }
        match me.sleeper.cancellable_pend(Some(ms)) {
            Ok(()) | Err(OsError::Timeout) => Ok(()),
            Err(OsError::Interrupted) => {
                self.acknowledge_cancel(&me)?;
                Err(Error::InvalidArgument)
            }
            Err(_) => Err(Error::InvalidArgument),
        }
    }

    #[must_use]
    pub fn num_processors_np(&self) -> usize {
        self.ctx.processors
    }

    /// Change `thread`'s priority. Only [`SchedPolicy::Other`] is supported.
    pub fn set_schedparam(
        &self,
        thread: Pthread,
        policy: SchedPolicy,
        param: SchedParam,
    ) -> Result<()> {
        if policy != SchedPolicy::Other {
            return Err(Error::NotSupported);
        }
        if !self.ctx.osal.thread_priority_range().contains(param.priority) {
            return Err(Error::InvalidArgument);
        }
        self.ctx.threads.validate(thread, |slot| {
            let mut control = slot.control.lock();
            if let Some(id) = control.os_id {
                self.ctx
                    .osal
                    .thread_set_priority(id, param.priority)
                    .map_err(|_| Error::InvalidArgument)?;
            }
            control.priority = param.priority;
            Ok(())
        })
    }

    pub fn get_schedparam(&self, thread: Pthread) -> Result<(SchedPolicy, SchedParam)> {
        self.ctx.threads.validate(thread, |slot| {
            let priority = slot.control.lock().priority;
            Ok((SchedPolicy::Other, SchedParam { priority }))
        })
    }

    /// The calling thread's errno value.
    #[must_use]
    pub fn errno(&self) -> i32 {
        self.current_if_registered()
            .map_or(0, |me| me.errno.load(Ordering::Relaxed))
    }

    pub fn set_errno(&self, value: i32) {
        if let Ok(me) = self.current() {
            me.errno.store(value, Ordering::Relaxed);
        }
    }

    /// Lifecycle state of `thread`.
    pub fn thread_state(&self, thread: Pthread) -> Result<ThreadState> {
        self.ctx.threads.validate(thread, |slot| Ok(slot.state()))
    }

    pub(crate) fn current_if_registered(&self) -> Option<Arc<ThreadSlot>> {
        let stored = self.ctx.osal.tls_get(self.ctx.self_slot);
        let index = u32::try_from(stored.checked_sub(1)?).ok()?;
        self.ctx.threads.slot_by_index(index)
    }

    /// The calling thread's slot; foreign threads get an implicit, detached
    /// handle on first use.
    pub(crate) fn current(&self) -> Result<Arc<ThreadSlot>> {
        if let Some(me) = self.current_if_registered() {
            return Ok(me);
        }
        self.check_live()?;
        let osal = self.ctx.osal.as_ref();
        let slot = self.ctx.threads.acquire(osal)?;
        let os_id = osal.thread_current();
        {
            let mut control = slot.control.lock();
            control.implicit = true;
            control.detach = DetachState::Detached;
            control.os_id = Some(os_id);
            control.priority = osal
                .thread_get_priority(os_id)
                .unwrap_or(osal.thread_priority_range().default);
            slot.set_state(ThreadState::Running);
        }
        if osal.tls_set(self.ctx.self_slot, slot.index as usize + 1).is_err() {
            self.ctx.threads.release(&slot);
            return Err(Error::ResourceExhausted);
        }
        debug!(thread = slot.index, ?os_id, "implicit thread handle created");
        Ok(slot)
    }

    fn finish_thread(&self, slot: &Arc<ThreadSlot>, status: ExitStatus) {
        slot.control.lock().exit = Some(status);
        self.run_key_destructors(slot);
        let detached = {
            let control = slot.control.lock();
            slot.set_state(ThreadState::Last);
            control.detach == DetachState::Detached
        };
        trace!(thread = slot.index, ?status, detached, "thread finished");
        if detached {
            self.destroy_thread(slot);
        }
    }

    /// Recycle `slot` and release its OS thread.
    pub(crate) fn destroy_thread(&self, slot: &ThreadSlot) {
        let handle = slot.handle();
        let os_id = slot.control.lock().os_id.take();
        self.ctx.threads.release(slot);
        if let Some(id) = os_id {
            if let Err(err) = self.ctx.osal.thread_delete(id) {
                debug!(thread = handle.index(), %err, "OS thread delete failed");
            }
        }
        debug!(
            thread = handle.index(),
            generation = handle.generation(),
            "thread handle recycled"
        );
    }
}

/// Body of every thread started by [`Runtime::create`].
fn thread_main<F>(rt: &Runtime, slot: &Arc<ThreadSlot>, entry: F)
where
    F: FnOnce() -> Result<usize>,
{
    let ctx = &rt.ctx;
    if ctx
        .osal
        .tls_set(ctx.self_slot, slot.index as usize + 1)
        .is_err()
    {
        warn!(thread = slot.index, "failed to publish thread handle");
    }
    {
        let _control = slot.control.lock();
        if slot.state() < ThreadState::Running {
            slot.set_state(ThreadState::Running);
        }
    }

    let outcome = entry();
    let status = match (slot.state(), outcome) {
        (ThreadState::Canceling, _) | (_, Err(Error::Canceled)) => ExitStatus::Canceled,
        (ThreadState::Exiting, _) | (_, Err(Error::Exited)) => {
            ExitStatus::Value(slot.exit_value.load(Ordering::Acquire))
        }
        (_, Ok(value)) => ExitStatus::Value(value),
        (_, Err(err)) => {
            warn!(thread = slot.index, error = %err, "thread entry failed");
            ExitStatus::Failed(err)
        }
    };
    rt.finish_thread(slot, status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;
    use embpthread_osal::HostOsal;
    use std::sync::mpsc;

    fn runtime() -> Runtime {
        Runtime::init(Arc::new(HostOsal::new()), RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn join_returns_entry_value() {
        let rt = runtime();
        let t = rt.create(None, || Ok(42)).unwrap();
        assert_eq!(rt.join(t).unwrap(), ExitStatus::Value(42));
    }

    #[test]
    fn exit_value_is_reported_by_join() {
        let rt = runtime();
        let worker = rt.clone();
        let t = rt
            .create(None, move || {
                worker.exit::<()>(7)?;
                Ok(0)
            })
            .unwrap();
        assert_eq!(rt.join(t).unwrap(), ExitStatus::Value(7));
    }

    #[test]
    fn failed_entry_is_reported() {
        let rt = runtime();
        let t = rt.create(None, || Err(Error::Busy)).unwrap();
        assert_eq!(rt.join(t).unwrap(), ExitStatus::Failed(Error::Busy));
    }

    #[test]
    fn self_join_would_deadlock() {
        let rt = runtime();
        let worker = rt.clone();
        let t = rt
            .create(None, move || {
                let me = worker.self_id()?;
                match worker.join(me) {
                    Err(Error::WouldDeadlock) => Ok(1),
                    _ => Ok(0),
                }
            })
            .unwrap();
        assert_eq!(rt.join(t).unwrap(), ExitStatus::Value(1));
    }

    #[test]
    fn joined_handle_becomes_stale() {
        let rt = runtime();
        let t = rt.create(None, || Ok(0)).unwrap();
        rt.join(t).unwrap();
        assert_eq!(rt.join(t).unwrap_err(), Error::NotFound);
        assert_eq!(rt.kill(t, 0).unwrap_err(), Error::NotFound);
        assert_eq!(rt.detach(t).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn detached_thread_cannot_be_joined() {
        let rt = runtime();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let t = rt
            .create(None, move || {
                let _ = release_rx.recv();
                Ok(0)
            })
            .unwrap();
        rt.detach(t).unwrap();
        assert_eq!(rt.join(t).unwrap_err(), Error::InvalidArgument);
        assert_eq!(rt.detach(t).unwrap_err(), Error::InvalidArgument);
        release_tx.send(()).unwrap();
    }

    #[test]
    fn kill_rejects_real_signals() {
        let rt = runtime();
        let me = rt.self_id().unwrap();
        rt.kill(me, 0).unwrap();
        assert_eq!(rt.kill(me, 9).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn implicit_handle_is_stable_and_detached() {
        let rt = runtime();
        let first = rt.self_id().unwrap();
        let second = rt.self_id().unwrap();
        assert!(rt.equal(first, second));
        assert_eq!(rt.join(first).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn detach_np_releases_implicit_handle() {
        let rt = runtime();
        let first = rt.self_id().unwrap();
        rt.detach_np().unwrap();
        assert_eq!(rt.kill(first, 0).unwrap_err(), Error::NotFound);
        assert_eq!(rt.pooled_threads(), 1);
        let second = rt.self_id().unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);
    }

    #[test]
    fn errno_is_per_thread() {
        let rt = runtime();
        rt.set_errno(22);
        let worker = rt.clone();
        let t = rt
            .create(None, move || Ok(usize::try_from(worker.errno()).unwrap_or(99)))
            .unwrap();
        assert_eq!(rt.join(t).unwrap(), ExitStatus::Value(0));
        assert_eq!(rt.errno(), 22);
    }

    #[test]
    fn schedparam_is_validated() {
        let rt = runtime();
        let me = rt.self_id().unwrap();
        let range = rt.osal().thread_priority_range();
        rt.set_schedparam(me, SchedPolicy::Other, SchedParam { priority: range.max })
            .unwrap();
        assert_eq!(
            rt.get_schedparam(me).unwrap(),
            (SchedPolicy::Other, SchedParam { priority: range.max })
        );
        assert_eq!(
            rt.set_schedparam(me, SchedPolicy::Fifo, SchedParam { priority: range.max })
                .unwrap_err(),
            Error::NotSupported
        );
        assert_eq!(
            rt.set_schedparam(me, SchedPolicy::Other, SchedParam { priority: range.max + 1 })
                .unwrap_err(),
            Error::InvalidArgument
        );
    }

    #[test]
    fn explicit_priority_out_of_range_is_rejected() {
        let rt = runtime();
        let mut attr = ThreadAttr::new();
        attr.set_inherit_sched(InheritSched::Explicit)
            .set_sched_param(SchedParam { priority: i32::MAX });
        assert_eq!(rt.create(Some(&attr), || Ok(0)).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn delay_np_sleeps() {
        let rt = runtime();
        let start = std::time::Instant::now();
        rt.delay_np(Duration::from_millis(20)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
        rt.delay_np(Duration::ZERO).unwrap();
    }
}
