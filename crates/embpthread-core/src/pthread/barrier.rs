//! Barriers.
//!
//! Two semaphore gates alternate between generations. The last arrival of a
//! generation resets the count and opens that generation's gate for everyone
//! else, so a fast thread re-entering the barrier lands on the other gate.
//! The last arrival is the generation's serial thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use embpthread_osal::Osal;

use crate::error::{Error, Result};
use crate::object::ObjectCell;
use crate::pthread::attr::BarrierAttr;
use crate::pthread::semaphore::RawSemaphore;
use crate::runtime::Runtime;

/// Outcome of [`Runtime::barrier_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    /// Exactly one thread per generation gets this.
    SerialThread,
    Waiter,
}

impl BarrierWait {
    #[must_use]
    pub const fn is_serial(self) -> bool {
        matches!(self, Self::SerialThread)
    }
}

pub(crate) struct RawBarrier {
    initial: i32,
    current: AtomicI32,
    step: AtomicI32,
    gates: [RawSemaphore; 2],
}

impl RawBarrier {
    fn new(osal: &dyn Osal, count: u32) -> Result<Self> {
        let initial = i32::try_from(count).map_err(|_| Error::InvalidArgument)?;
        Ok(Self {
            initial,
            current: AtomicI32::new(initial),
            step: AtomicI32::new(0),
            gates: [RawSemaphore::new(osal, 0)?, RawSemaphore::new(osal, 0)?],
        })
    }

    fn gate(&self, step: i32) -> &RawSemaphore {
        &self.gates[usize::from(step != 0)]
    }

    fn wait(&self, rt: &Runtime) -> Result<BarrierWait> {
        let step = self.step.load(Ordering::Acquire);
        if self.current.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Reset and flip before opening the gate: a released thread
            // re-entering must already see the next generation.
            self.current.store(self.initial, Ordering::Release);
            self.step.store(1 - step, Ordering::Release);
            if self.initial > 1 {
                self.gate(step).post_multiple((self.initial - 1).unsigned_abs())?;
            }
            Ok(BarrierWait::SerialThread)
        } else {
            // Not a cancellation point.
            self.gate(step).wait(rt, None, false)?;
            Ok(BarrierWait::Waiter)
        }
    }

    fn check_idle(&self) -> Result<()> {
        let waiting = self.gates.iter().any(|gate| gate.value() < 0);
        if waiting || self.current.load(Ordering::Acquire) != self.initial {
            return Err(Error::Busy);
        }
        Ok(())
    }
}

/// A barrier. Must be initialized with [`Runtime::barrier_init`].
pub struct Barrier {
    cell: ObjectCell<RawBarrier>,
}

impl Barrier {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: ObjectCell::uninit(),
        }
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// `InvalidArgument` for a zero `count`.
    pub fn barrier_init(
        &self,
        barrier: &Barrier,
        attr: Option<&BarrierAttr>,
        count: u32,
    ) -> Result<()> {
        attr.copied().unwrap_or_default().pshared().require_private()?;
        if count == 0 {
            return Err(Error::InvalidArgument);
        }
        self.check_live()?;
        barrier
            .cell
            .install(|| Ok(Arc::new(RawBarrier::new(self.ctx.osal.as_ref(), count)?)))
    }

    /// `Busy` while a generation is partly assembled.
    pub fn barrier_destroy(&self, barrier: &Barrier) -> Result<()> {
        barrier.cell.destroy(None, |raw| raw.check_idle())
    }

    /// Block until `count` threads have arrived.
    pub fn barrier_wait(&self, barrier: &Barrier) -> Result<BarrierWait> {
        barrier.cell.ready()?.wait(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;
    use crate::pthread::attr::ProcessShared;
    use embpthread_osal::HostOsal;

    fn runtime() -> Runtime {
        Runtime::init(Arc::new(HostOsal::new()), RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn single_thread_barrier_is_always_serial() {
        let rt = runtime();
        let barrier = Barrier::new();
        rt.barrier_init(&barrier, None, 1).unwrap();
        for _ in 0..3 {
            assert_eq!(rt.barrier_wait(&barrier).unwrap(), BarrierWait::SerialThread);
        }
        rt.barrier_destroy(&barrier).unwrap();
    }

    #[test]
    fn invalid_init_is_rejected() {
        let rt = runtime();
        let barrier = Barrier::new();
        assert_eq!(rt.barrier_init(&barrier, None, 0).unwrap_err(), Error::InvalidArgument);
        let mut attr = BarrierAttr::new();
        assert_eq!(
            attr.set_pshared(ProcessShared::Shared).unwrap_err(),
            Error::NotSupported
        );
        assert_eq!(rt.barrier_wait(&barrier).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn destroy_is_busy_mid_generation() {
        let rt = runtime();
        let barrier = Arc::new(Barrier::new());
        rt.barrier_init(&barrier, None, 2).unwrap();
        let worker = rt.clone();
        let waiting = barrier.clone();
        let t = rt
            .create(None, move || {
                let outcome = worker.barrier_wait(&waiting)?;
                Ok(usize::from(outcome.is_serial()))
            })
            .unwrap();
        let raw = barrier.cell.ready().unwrap();
        while raw.current.load(Ordering::Acquire) == 2 {
            std::thread::yield_now();
        }
        assert_eq!(rt.barrier_destroy(&barrier).unwrap_err(), Error::Busy);
        let mine = rt.barrier_wait(&barrier).unwrap();
        let theirs = rt.join(t).unwrap().value().unwrap();
        assert_eq!(usize::from(mine.is_serial()) + theirs, 1);
        rt.barrier_destroy(&barrier).unwrap();
    }
}
