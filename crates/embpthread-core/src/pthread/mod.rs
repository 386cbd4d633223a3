//! Threading primitives.
//!
//! Each submodule adds its operations to [`crate::Runtime`] and defines the
//! user-visible object type it manages.

pub mod attr;
pub mod barrier;
pub mod cancel;
pub mod cond;
pub mod mutex;
pub mod once;
pub(crate) mod reuse;
pub mod rwlock;
pub mod semaphore;
pub mod spin;
pub mod thread;
pub mod tls;
