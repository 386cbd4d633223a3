//! # embpthread-osal
//!
//! The OS abstraction layer (OSAL) consumed by `embpthread-core`.
//!
//! The threading library never talks to an operating system directly. Everything
//! it needs is expressed through the [`Osal`] trait:
//!
//! - threads: create (suspended), start, wait-for-end, delete, priority, sleep,
//!   cancellation flagging
//! - counting semaphores with plain, timed and cancellable pends
//! - a mutual-exclusion primitive for internal bookkeeping locks
//! - TLS slots holding one machine word per thread
//!
//! Atomic exchange / compare-exchange / increment / decrement come from
//! `core::sync::atomic` and are not routed through the trait.
//!
//! [`HostOsal`] is a reference implementation on top of `std::thread` and
//! `parking_lot`, used by tests, the stress harness, and benchmarks.

#![forbid(unsafe_code)]

pub mod error;
pub mod host;

pub use error::{OsError, OsResult};
pub use host::HostOsal;

/// Opaque OS thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OsThreadId(pub u64);

/// Opaque TLS slot handle. A slot holds one `usize` per thread; `0` means unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TlsSlot(pub u32);

/// Priority bounds exposed by the OS scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityRange {
    pub min: i32,
    pub default: i32,
    pub max: i32,
}

impl PriorityRange {
    /// Returns true when `priority` lies within `[min, max]`.
    #[must_use]
    pub const fn contains(&self, priority: i32) -> bool {
        priority >= self.min && priority <= self.max
    }
}

/// Parameters for a new OS thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSpawn {
    /// Requested stack size in bytes; `0` selects the OS default.
    pub stack_size: usize,
    /// Initial scheduling priority.
    pub priority: i32,
    /// Optional debugging name.
    pub name: Option<String>,
}

/// Body executed by an OS thread once started.
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Counting semaphore provided by the OS. Deleted on drop.
pub trait OsSemaphore: Send + Sync {
    /// Wait for one unit. `None` waits forever; `Some(0)` polls.
    fn pend(&self, timeout_ms: Option<u32>) -> OsResult<()>;

    /// Like [`OsSemaphore::pend`], but returns [`OsError::Interrupted`] when
    /// the calling thread has a pending OS-level cancellation.
    fn cancellable_pend(&self, timeout_ms: Option<u32>) -> OsResult<()>;

    /// Release `count` units.
    fn post(&self, count: u32) -> OsResult<()>;
}

/// Non-recursive mutual exclusion used for internal bookkeeping.
///
/// Unlike a guard-based lock, `unlock` may be called from any code path that
/// holds the lock, which lets callers build their own RAII wrappers.
pub trait OsMutex: Send + Sync {
    fn lock(&self);
    fn unlock(&self);
}

/// The OS abstraction layer.
pub trait Osal: Send + Sync {
    /// Create a thread in the suspended state. It runs `entry` once started.
    fn thread_create(&self, spawn: ThreadSpawn, entry: ThreadEntry) -> OsResult<OsThreadId>;

    /// Release a thread created by [`Osal::thread_create`].
    fn thread_start(&self, id: OsThreadId) -> OsResult<()>;

    /// Identity of the calling thread. Threads the OSAL did not create are
    /// registered on first call.
    fn thread_current(&self) -> OsThreadId;

    /// Block until the thread's entry returned. With `cancellable`, a pending
    /// cancellation of the *calling* thread interrupts the wait.
    fn thread_wait_for_end(&self, id: OsThreadId, cancellable: bool) -> OsResult<()>;

    /// Release OS bookkeeping for a thread. A thread may delete itself.
    fn thread_delete(&self, id: OsThreadId) -> OsResult<()>;

    fn thread_set_priority(&self, id: OsThreadId, priority: i32) -> OsResult<()>;

    fn thread_get_priority(&self, id: OsThreadId) -> OsResult<i32>;

    fn thread_priority_range(&self) -> PriorityRange;

    /// Coarse sleep. `0` yields the processor.
    fn thread_sleep(&self, ms: u32);

    /// Flag `id` as canceled and interrupt any cancellable wait it is blocked in.
    fn thread_cancel(&self, id: OsThreadId) -> OsResult<()>;

    /// [`OsError::Interrupted`] when `id` has been flagged by [`Osal::thread_cancel`].
    fn thread_check_cancel(&self, id: OsThreadId) -> OsResult<()>;

    /// Number of processors available to the process.
    fn processor_count(&self) -> usize;

    fn semaphore_create(&self, initial: u32) -> OsResult<Box<dyn OsSemaphore>>;

    fn mutex_create(&self) -> OsResult<Box<dyn OsMutex>>;

    fn tls_alloc(&self) -> OsResult<TlsSlot>;

    fn tls_free(&self, slot: TlsSlot) -> OsResult<()>;

    /// Value stored by the calling thread, `0` when unset.
    fn tls_get(&self, slot: TlsSlot) -> usize;

    fn tls_set(&self, slot: TlsSlot, value: usize) -> OsResult<()>;
}
