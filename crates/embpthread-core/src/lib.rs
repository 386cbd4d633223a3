//! # embpthread-core
//!
//! POSIX-style threading primitives built only on the [`embpthread_osal::Osal`]
//! abstraction: thread lifecycle with handle reuse, mutexes, condition
//! variables, read-write locks, barriers, spinlocks, semaphores, thread-specific
//! data, one-time initialization, and deferred cancellation.
//!
//! All operations are methods on [`Runtime`], the process-wide context created
//! by [`Runtime::init`]. Synchronization objects are plain values; the
//! `new_static` constructors follow the static-initializer convention and are
//! initialized on first use.
//!
//! Cancellation and `exit` unwind by return: cancellation points yield
//! [`Error::Canceled`], [`Runtime::exit`] yields [`Error::Exited`], and both
//! are propagated with `?` to the thread entry, running any
//! [`CleanupGuard`]s on the way.

#![deny(unsafe_code)]

pub mod config;
pub mod errno;
pub mod error;
mod object;
#[allow(unsafe_code)]
mod oslock;
pub mod pthread;
pub mod runtime;
pub mod time;

pub use config::{RuntimeConfig, SpinPolicy};
pub use error::{Error, Result};
pub use pthread::attr::{
    BarrierAttr, CondAttr, ContentionScope, DetachState, InheritSched, MutexAttr, ProcessShared,
    RwLockAttr, SchedParam, SchedPolicy, ThreadAttr,
};
pub use pthread::barrier::{Barrier, BarrierWait};
pub use pthread::cancel::{CancelState, CancelType, CleanupGuard};
pub use pthread::cond::{Cond, CondCounters};
pub use pthread::mutex::{Mutex, MutexKind};
pub use pthread::once::Once;
pub use pthread::rwlock::RwLock;
pub use pthread::semaphore::{SEM_VALUE_MAX, Semaphore};
pub use pthread::spin::SpinLock;
pub use pthread::thread::{ExitStatus, Pthread, ThreadState};
pub use pthread::tls::{Destructor, Key};
pub use runtime::Runtime;
