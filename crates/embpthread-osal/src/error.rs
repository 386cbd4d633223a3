//! OSAL result codes.

use thiserror::Error;

/// Failure reported by an OS abstraction layer primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum OsError {
    /// The OS could not provide the requested object (memory, slots, threads).
    #[error("out of OS resources")]
    NoResources,
    /// A bounded wait expired before the object was signaled.
    #[error("wait timed out")]
    Timeout,
    /// A cancellable wait was interrupted by a cancellation request.
    #[error("wait interrupted by cancellation")]
    Interrupted,
    /// The handle or argument does not name a live OS object.
    #[error("invalid OS handle or parameter")]
    InvalidParam,
    /// Any other OS failure.
    #[error("generic OS failure")]
    Generic,
}

/// Result alias for OSAL calls.
pub type OsResult<T> = Result<T, OsError>;
