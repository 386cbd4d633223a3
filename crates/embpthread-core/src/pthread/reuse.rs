//! Thread slots and the handle reuse pool.
//!
//! Slots live in an append-only table and are never freed while the runtime
//! exists. A destroyed thread's slot is wiped, its generation bumped, and its
//! index pushed on a LIFO free stack; the next creation pops it. Handles carry
//! `(index, generation)`, so a handle to a destroyed thread fails validation
//! even after its slot is reused.
//!
//! Lock order: reuse lock, then a slot's cancel lock. The slot table's
//! `RwLock` is a leaf.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use embpthread_osal::{OsSemaphore, OsThreadId, Osal};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::oslock::OsLock;
use crate::pthread::attr::DetachState;
use crate::pthread::cancel::{CancelState, CancelType};
use crate::pthread::thread::{ExitStatus, Pthread, ThreadState};
use crate::pthread::tls::Key;

/// Fields guarded by a slot's cancel lock.
#[derive(Debug)]
pub(crate) struct ThreadControl {
    pub(crate) detach: DetachState,
    pub(crate) os_id: Option<OsThreadId>,
    /// Handle created on demand for a thread this library did not start.
    pub(crate) implicit: bool,
    pub(crate) priority: i32,
    pub(crate) exit: Option<ExitStatus>,
}

impl ThreadControl {
    const fn blank() -> Self {
        Self {
            detach: DetachState::Joinable,
            os_id: None,
            implicit: false,
            priority: 0,
            exit: None,
        }
    }
}

pub(crate) struct ThreadSlot {
    pub(crate) index: u32,
    generation: AtomicU32,
    in_use: AtomicBool,
    // Written only with `control` held; read racily by fast paths.
    state: AtomicU8,
    cancel_state: AtomicU8,
    cancel_type: AtomicU8,
    pub(crate) errno: AtomicI32,
    pub(crate) exit_value: AtomicUsize,
    /// The cancel lock.
    pub(crate) control: OsLock<ThreadControl>,
    /// The thread lock: keys this thread holds destructor associations for.
    pub(crate) keys: OsLock<BTreeSet<Key>>,
    /// Never posted; gives `delay_np` a cancellable timed sleep.
    pub(crate) sleeper: Box<dyn OsSemaphore>,
}

impl ThreadSlot {
    fn new(osal: &dyn Osal, index: u32) -> Result<Self> {
        Ok(Self {
            index,
            generation: AtomicU32::new(0),
            in_use: AtomicBool::new(false),
            state: AtomicU8::new(ThreadState::Initial as u8),
            cancel_state: AtomicU8::new(CancelState::Enable as u8),
            cancel_type: AtomicU8::new(CancelType::Deferred as u8),
            errno: AtomicI32::new(0),
            exit_value: AtomicUsize::new(0),
            control: OsLock::new(osal, ThreadControl::blank())?,
            keys: OsLock::new(osal, BTreeSet::new())?,
            sleeper: osal.semaphore_create(0)?,
        })
    }

    pub(crate) fn handle(&self) -> Pthread {
        Pthread::new(self.index, self.generation.load(Ordering::Acquire))
    }

    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn cancel_state(&self) -> CancelState {
        CancelState::from_u8(self.cancel_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_cancel_state(&self, state: CancelState) {
        self.cancel_state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn cancel_type(&self) -> CancelType {
        CancelType::from_u8(self.cancel_type.load(Ordering::Acquire))
    }

    pub(crate) fn set_cancel_type(&self, ty: CancelType) {
        self.cancel_type.store(ty as u8, Ordering::Release);
    }

    /// Back to a blank slot with a fresh generation. Caller holds the reuse lock.
    fn wipe(&self) {
        {
            let mut control = self.control.lock();
            *control = ThreadControl::blank();
            self.set_state(ThreadState::Initial);
            self.set_cancel_state(CancelState::Enable);
            self.set_cancel_type(CancelType::Deferred);
        }
        self.keys.lock().clear();
        self.errno.store(0, Ordering::Relaxed);
        self.exit_value.store(0, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.in_use.store(false, Ordering::Release);
    }
}

pub(crate) struct ThreadArena {
    table: RwLock<Vec<Arc<ThreadSlot>>>,
    /// The reuse lock and the LIFO free stack it guards.
    reuse: OsLock<Vec<u32>>,
}

impl ThreadArena {
    pub(crate) fn new(osal: &dyn Osal) -> Result<Self> {
        Ok(Self {
            table: RwLock::new(Vec::new()),
            reuse: OsLock::new(osal, Vec::new())?,
        })
    }

    /// Pop a recycled slot, or allocate a new one when the pool is empty.
    pub(crate) fn acquire(&self, osal: &dyn Osal) -> Result<Arc<ThreadSlot>> {
        let mut free = self.reuse.lock();
        let slot = match free.pop() {
            Some(index) => self
                .slot_by_index(index)
                .ok_or(Error::ResourceExhausted)?,
            None => {
                let mut table = self.table.write();
                let index = u32::try_from(table.len()).map_err(|_| Error::ResourceExhausted)?;
                let slot = Arc::new(
                    ThreadSlot::new(osal, index).map_err(|_| Error::ResourceExhausted)?,
                );
                table.push(slot.clone());
                slot
            }
        };
        slot.in_use.store(true, Ordering::Release);
        Ok(slot)
    }

    /// Wipe `slot`, bump its generation and push it on the free stack.
    pub(crate) fn release(&self, slot: &ThreadSlot) {
        let mut free = self.reuse.lock();
        slot.wipe();
        free.push(slot.index);
    }

    /// Run `f` on the slot `thread` names, with the reuse lock held.
    ///
    /// Fails with [`Error::NotFound`] when the handle is stale.
    pub(crate) fn validate<R>(
        &self,
        thread: Pthread,
        f: impl FnOnce(&Arc<ThreadSlot>) -> Result<R>,
    ) -> Result<R> {
        let _free = self.reuse.lock();
        let slot = self.slot_by_index(thread.index()).ok_or(Error::NotFound)?;
        if !slot.in_use.load(Ordering::Acquire) || slot.handle() != thread {
            return Err(Error::NotFound);
        }
        f(&slot)
    }

    pub(crate) fn slot_by_index(&self, index: u32) -> Option<Arc<ThreadSlot>> {
        self.table.read().get(index as usize).cloned()
    }

    pub(crate) fn pooled(&self) -> usize {
        self.reuse.lock().len()
    }

    /// Forget every pooled slot; returns how many were dropped from the pool.
    pub(crate) fn drain(&self) -> usize {
        let mut free = self.reuse.lock();
        let drained = free.len();
        free.clear();
        drained
    }
}
