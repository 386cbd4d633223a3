//! Hosted OSAL on `std::thread` and `parking_lot`.
//!
//! Each OSAL thread is a `std::thread` parked on a start gate until
//! [`Osal::thread_start`]. Semaphores are a counter under a `parking_lot::Mutex`
//! with a `Condvar`. Cancellation is a per-thread flag plus a record of the
//! object the thread is currently blocked on, so [`Osal::thread_cancel`] can
//! wake exactly that object's waiters.
//!
//! TLS values live in a `thread_local!` map keyed by (OSAL instance, slot), so
//! several independent `HostOsal` instances can coexist in one process.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::{
    OsError, OsMutex, OsResult, OsSemaphore, OsThreadId, Osal, PriorityRange, ThreadEntry,
    ThreadSpawn, TlsSlot,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Scheduler priority bounds reported by the hosted OSAL.
pub const HOST_PRIORITY_RANGE: PriorityRange = PriorityRange {
    min: 1,
    default: 8,
    max: 15,
};

/// Maximum simultaneously allocated TLS slots per instance.
pub const HOST_TLS_SLOTS_MAX: usize = 256;

/// Largest count a hosted semaphore may hold.
pub const HOST_SEMAPHORE_MAX: u64 = i32::MAX as u64;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_THREAD: Cell<u64> = const { Cell::new(0) };
    static TLS_VALUES: RefCell<HashMap<(u64, u32), usize>> = RefCell::new(HashMap::new());
}

fn current_thread_raw() -> u64 {
    CURRENT_THREAD.with(|cell| {
        let id = cell.get();
        if id != 0 {
            return id;
        }
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        cell.set(id);
        id
    })
}

fn deadline_after(timeout_ms: Option<u32>) -> Option<Instant> {
    timeout_ms.map(|ms| Instant::now() + Duration::from_millis(u64::from(ms)))
}

// ---------------------------------------------------------------------------
// Interruption plumbing
// ---------------------------------------------------------------------------

/// An object a thread can block on and that a canceler can wake.
trait Interruptible: Send + Sync {
    fn interrupt(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Suspended,
    Running,
    Ended,
    Abandoned,
}

struct ThreadRecord {
    canceled: AtomicBool,
    blocked_on: Mutex<Option<Arc<dyn Interruptible>>>,
    priority: AtomicI32,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
}

impl ThreadRecord {
    fn new(priority: i32, lifecycle: Lifecycle) -> Self {
        Self {
            canceled: AtomicBool::new(false),
            blocked_on: Mutex::new(None),
            priority: AtomicI32::new(priority),
            lifecycle: Mutex::new(lifecycle),
            changed: Condvar::new(),
        }
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn block_on(&self, target: Arc<dyn Interruptible>) {
        *self.blocked_on.lock() = Some(target);
    }

    fn unblock(&self) {
        *self.blocked_on.lock() = None;
    }

    /// Parks until started. Returns false when deleted before start.
    fn wait_for_start(&self) -> bool {
        let mut state = self.lifecycle.lock();
        while *state == Lifecycle::Suspended {
            self.changed.wait(&mut state);
        }
        *state == Lifecycle::Running
    }

    fn finish(&self) {
        let mut state = self.lifecycle.lock();
        if *state == Lifecycle::Running {
            *state = Lifecycle::Ended;
        }
        self.changed.notify_all();
    }
}

impl Interruptible for ThreadRecord {
    fn interrupt(&self) {
        let _state = self.lifecycle.lock();
        self.changed.notify_all();
    }
}

/// Marks the record ended even if the entry panics, so joiners never hang.
struct EndOnDrop(Arc<ThreadRecord>);

impl Drop for EndOnDrop {
    fn drop(&mut self) {
        self.0.finish();
    }
}

#[derive(Default)]
struct TlsTable {
    next: u32,
    live: HashSet<u32>,
}

struct Shared {
    instance: u64,
    threads: Mutex<HashMap<u64, Arc<ThreadRecord>>>,
    tls: Mutex<TlsTable>,
}

impl Shared {
    fn record(&self, id: OsThreadId) -> OsResult<Arc<ThreadRecord>> {
        self.threads
            .lock()
            .get(&id.0)
            .cloned()
            .ok_or(OsError::InvalidParam)
    }

    /// Record for the calling thread, registering foreign threads on demand.
    fn current_record(&self) -> (OsThreadId, Arc<ThreadRecord>) {
        let id = current_thread_raw();
        let mut threads = self.threads.lock();
        let record = threads
            .entry(id)
            .or_insert_with(|| {
                trace!(thread = id, "registering foreign thread with hosted OSAL");
                Arc::new(ThreadRecord::new(
                    HOST_PRIORITY_RANGE.default,
                    Lifecycle::Running,
                ))
            })
            .clone();
        (OsThreadId(id), record)
    }
}

// ---------------------------------------------------------------------------
// Semaphore and mutex
// ---------------------------------------------------------------------------

struct SemaphoreCore {
    count: Mutex<u64>,
    available: Condvar,
}

impl Interruptible for SemaphoreCore {
    fn interrupt(&self) {
        let _count = self.count.lock();
        self.available.notify_all();
    }
}

struct HostSemaphore {
    core: Arc<SemaphoreCore>,
    shared: Arc<Shared>,
}

impl HostSemaphore {
    fn pend_inner(&self, timeout_ms: Option<u32>, canceler: Option<&ThreadRecord>) -> OsResult<()> {
        let deadline = deadline_after(timeout_ms);
        let mut count = self.core.count.lock();
        loop {
            if *count > 0 {
                *count -= 1;
                return Ok(());
            }
            if canceler.is_some_and(ThreadRecord::is_canceled) {
                return Err(OsError::Interrupted);
            }
            match deadline {
                None => self.core.available.wait(&mut count),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(OsError::Timeout);
                    }
                    let _ = self.core.available.wait_until(&mut count, deadline);
                }
            }
        }
    }
}

impl OsSemaphore for HostSemaphore {
    fn pend(&self, timeout_ms: Option<u32>) -> OsResult<()> {
        self.pend_inner(timeout_ms, None)
    }

    fn cancellable_pend(&self, timeout_ms: Option<u32>) -> OsResult<()> {
        let (_, me) = self.shared.current_record();
        me.block_on(self.core.clone());
        let result = self.pend_inner(timeout_ms, Some(&me));
        me.unblock();
        result
    }

    fn post(&self, count: u32) -> OsResult<()> {
        let mut value = self.core.count.lock();
        let next = *value + u64::from(count);
        if next > HOST_SEMAPHORE_MAX {
            return Err(OsError::NoResources);
        }
        *value = next;
        if count == 1 {
            self.core.available.notify_one();
        } else if count > 1 {
            self.core.available.notify_all();
        }
        Ok(())
    }
}

struct HostMutex {
    locked: Mutex<bool>,
    released: Condvar,
}

impl OsMutex for HostMutex {
    fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.released.wait(&mut locked);
        }
        *locked = true;
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock();
        *locked = false;
        self.released.notify_one();
    }
}

// ---------------------------------------------------------------------------
// HostOsal
// ---------------------------------------------------------------------------

/// Reference OSAL for hosted targets.
pub struct HostOsal {
    shared: Arc<Shared>,
    processors: usize,
}

impl std::fmt::Debug for HostOsal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostOsal")
            .field("instance", &self.shared.instance)
            .field("processors", &self.processors)
            .finish()
    }
}

impl Default for HostOsal {
    fn default() -> Self {
        Self::new()
    }
}

impl HostOsal {
    /// Create an instance reporting the host's available parallelism.
    #[must_use]
    pub fn new() -> Self {
        let processors = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self::with_processors(processors)
    }

    /// Create an instance reporting exactly `processors` CPUs (minimum 1).
    #[must_use]
    pub fn with_processors(processors: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                instance: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
                threads: Mutex::new(HashMap::new()),
                tls: Mutex::new(TlsTable::default()),
            }),
            processors: processors.max(1),
        }
    }

    /// Number of thread records currently tracked (created and not deleted).
    #[must_use]
    pub fn tracked_threads(&self) -> usize {
        self.shared.threads.lock().len()
    }
}

impl Osal for HostOsal {
    fn thread_create(&self, spawn: ThreadSpawn, entry: ThreadEntry) -> OsResult<OsThreadId> {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(ThreadRecord::new(spawn.priority, Lifecycle::Suspended));
        self.shared.threads.lock().insert(id, record.clone());

        let mut builder = std::thread::Builder::new();
        if spawn.stack_size > 0 {
            builder = builder.stack_size(spawn.stack_size);
        }
        if let Some(name) = spawn.name {
            builder = builder.name(name);
        }

        let spawned = builder.spawn(move || {
            CURRENT_THREAD.with(|cell| cell.set(id));
            if !record.wait_for_start() {
                return;
            }
            let _end = EndOnDrop(record);
            entry();
        });

        match spawned {
            Ok(_) => {
                debug!(thread = id, "hosted thread created");
                Ok(OsThreadId(id))
            }
            Err(err) => {
                self.shared.threads.lock().remove(&id);
                debug!(error = %err, "hosted thread spawn failed");
                Err(OsError::NoResources)
            }
        }
    }

    fn thread_start(&self, id: OsThreadId) -> OsResult<()> {
        let record = self.shared.record(id)?;
        let mut state = record.lifecycle.lock();
        if *state != Lifecycle::Suspended {
            return Err(OsError::InvalidParam);
        }
        *state = Lifecycle::Running;
        record.changed.notify_all();
        Ok(())
    }

    fn thread_current(&self) -> OsThreadId {
        self.shared.current_record().0
    }

    fn thread_wait_for_end(&self, id: OsThreadId, cancellable: bool) -> OsResult<()> {
        let target = self.shared.record(id)?;
        let me = if cancellable {
            let (_, me) = self.shared.current_record();
            me.block_on(target.clone());
            Some(me)
        } else {
            None
        };

        let result = {
            let mut state = target.lifecycle.lock();
            loop {
                if matches!(*state, Lifecycle::Ended | Lifecycle::Abandoned) {
                    break Ok(());
                }
                if me.as_deref().is_some_and(ThreadRecord::is_canceled) {
                    break Err(OsError::Interrupted);
                }
                target.changed.wait(&mut state);
            }
        };

        if let Some(me) = me {
            me.unblock();
        }
        result
    }

    fn thread_delete(&self, id: OsThreadId) -> OsResult<()> {
        let record = self
            .shared
            .threads
            .lock()
            .remove(&id.0)
            .ok_or(OsError::InvalidParam)?;
        let mut state = record.lifecycle.lock();
        if *state == Lifecycle::Suspended {
            *state = Lifecycle::Abandoned;
            record.changed.notify_all();
        }
        debug!(thread = id.0, "hosted thread deleted");
        Ok(())
    }

    fn thread_set_priority(&self, id: OsThreadId, priority: i32) -> OsResult<()> {
        if !HOST_PRIORITY_RANGE.contains(priority) {
            return Err(OsError::InvalidParam);
        }
        self.shared
            .record(id)?
            .priority
            .store(priority, Ordering::Relaxed);
        Ok(())
    }

    fn thread_get_priority(&self, id: OsThreadId) -> OsResult<i32> {
        Ok(self.shared.record(id)?.priority.load(Ordering::Relaxed))
    }

    fn thread_priority_range(&self) -> PriorityRange {
        HOST_PRIORITY_RANGE
    }

    fn thread_sleep(&self, ms: u32) {
        if ms == 0 {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_millis(u64::from(ms)));
        }
    }

    fn thread_cancel(&self, id: OsThreadId) -> OsResult<()> {
        let record = self.shared.record(id)?;
        record.canceled.store(true, Ordering::SeqCst);
        let blocked = record.blocked_on.lock().clone();
        if let Some(target) = blocked {
            target.interrupt();
        }
        trace!(thread = id.0, "hosted thread flagged for cancellation");
        Ok(())
    }

    fn thread_check_cancel(&self, id: OsThreadId) -> OsResult<()> {
        if self.shared.record(id)?.is_canceled() {
            Err(OsError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn processor_count(&self) -> usize {
        self.processors
    }

    fn semaphore_create(&self, initial: u32) -> OsResult<Box<dyn OsSemaphore>> {
        if u64::from(initial) > HOST_SEMAPHORE_MAX {
            return Err(OsError::InvalidParam);
        }
        Ok(Box::new(HostSemaphore {
            core: Arc::new(SemaphoreCore {
                count: Mutex::new(u64::from(initial)),
                available: Condvar::new(),
            }),
            shared: self.shared.clone(),
        }))
    }

    fn mutex_create(&self) -> OsResult<Box<dyn OsMutex>> {
        Ok(Box::new(HostMutex {
            locked: Mutex::new(false),
            released: Condvar::new(),
        }))
    }

    fn tls_alloc(&self) -> OsResult<TlsSlot> {
        let mut table = self.shared.tls.lock();
        if table.live.len() >= HOST_TLS_SLOTS_MAX {
            return Err(OsError::NoResources);
        }
        table.next = table.next.checked_add(1).ok_or(OsError::NoResources)?;
        let slot = table.next;
        table.live.insert(slot);
        Ok(TlsSlot(slot))
    }

    fn tls_free(&self, slot: TlsSlot) -> OsResult<()> {
        if self.shared.tls.lock().live.remove(&slot.0) {
            Ok(())
        } else {
            Err(OsError::InvalidParam)
        }
    }

    fn tls_get(&self, slot: TlsSlot) -> usize {
        let key = (self.shared.instance, slot.0);
        TLS_VALUES.with(|values| values.borrow().get(&key).copied().unwrap_or(0))
    }

    fn tls_set(&self, slot: TlsSlot, value: usize) -> OsResult<()> {
        if !self.shared.tls.lock().live.contains(&slot.0) {
            return Err(OsError::InvalidParam);
        }
        let key = (self.shared.instance, slot.0);
        TLS_VALUES.with(|values| {
            let mut values = values.borrow_mut();
            if value == 0 {
                values.remove(&key);
            } else {
                values.insert(key, value);
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
