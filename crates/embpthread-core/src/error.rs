//! Library error type.
//!
//! Every public operation returns [`Result`]. Two variants are not failures in
//! the usual sense: [`Error::Canceled`] and [`Error::Exited`] are unwinding
//! signals. They are produced at cancellation points and by
//! [`crate::Runtime::exit`] and must be propagated with `?` back to the thread
//! entry, which turns them into the thread's exit status.

use embpthread_osal::OsError;
use thiserror::Error;

use crate::errno;

/// Error returned by threading primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Error {
    /// Null/unrecognized handle, destroyed object, lock not held, bad attribute.
    #[error("invalid argument")]
    InvalidArgument,
    /// Allocation failure or too many semaphore units.
    #[error("resource temporarily unavailable")]
    ResourceExhausted,
    /// Object is still referenced or locked.
    #[error("resource busy")]
    Busy,
    /// Stale or mismatched thread identity.
    #[error("no such thread")]
    NotFound,
    /// Deadline reached before acquisition.
    #[error("timed out")]
    TimedOut,
    /// Self-relock of an error-checking mutex, or a self-join.
    #[error("resource deadlock would occur")]
    WouldDeadlock,
    /// Unlock by a non-owner, or asynchronous cancellation of another thread.
    #[error("operation not permitted")]
    NotPermitted,
    /// Process-shared objects, non-default scheduling policy, user stacks.
    #[error("operation not supported")]
    NotSupported,
    /// The calling thread acted on a cancellation request and is unwinding.
    #[error("thread canceled")]
    Canceled,
    /// The calling thread requested exit and is unwinding.
    #[error("thread exited")]
    Exited,
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// POSIX errno equivalent.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => errno::EINVAL,
            Self::ResourceExhausted => errno::EAGAIN,
            Self::Busy => errno::EBUSY,
            Self::NotFound => errno::ESRCH,
            Self::TimedOut => errno::ETIMEDOUT,
            Self::WouldDeadlock => errno::EDEADLK,
            Self::NotPermitted => errno::EPERM,
            Self::NotSupported => errno::ENOTSUP,
            Self::Canceled => errno::ECANCELED,
            Self::Exited => errno::EINTR,
        }
    }

    /// Inverse of [`Error::errno`]. `0` and unknown values map to `None`.
    #[must_use]
    pub const fn from_errno(value: i32) -> Option<Self> {
        match value {
            errno::EINVAL => Some(Self::InvalidArgument),
            errno::EAGAIN | errno::ENOMEM | errno::ENOSPC => Some(Self::ResourceExhausted),
            errno::EBUSY => Some(Self::Busy),
            errno::ESRCH | errno::ENOENT => Some(Self::NotFound),
            errno::ETIMEDOUT => Some(Self::TimedOut),
            errno::EDEADLK => Some(Self::WouldDeadlock),
            errno::EPERM => Some(Self::NotPermitted),
            errno::ENOTSUP | errno::ENOSYS => Some(Self::NotSupported),
            errno::ECANCELED => Some(Self::Canceled),
            errno::EINTR => Some(Self::Exited),
            _ => None,
        }
    }

    /// True for the unwinding signals [`Error::Canceled`] and [`Error::Exited`].
    #[must_use]
    pub const fn is_unwind(self) -> bool {
        matches!(self, Self::Canceled | Self::Exited)
    }
}

impl From<OsError> for Error {
    fn from(err: OsError) -> Self {
        match err {
            OsError::Timeout => Self::TimedOut,
            OsError::NoResources => Self::ResourceExhausted,
            OsError::Interrupted | OsError::InvalidParam | OsError::Generic => {
                Self::InvalidArgument
            }
        }
    }
}

/// Convert a `Result<()>` into the errno convention (`0` on success).
#[must_use]
pub fn errno_of(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_roundtrips_for_primary_codes() {
        for err in [
            Error::InvalidArgument,
            Error::ResourceExhausted,
            Error::Busy,
            Error::NotFound,
            Error::TimedOut,
            Error::WouldDeadlock,
            Error::NotPermitted,
            Error::NotSupported,
            Error::Canceled,
            Error::Exited,
        ] {
            assert_eq!(Error::from_errno(err.errno()), Some(err));
        }
        assert_eq!(Error::from_errno(0), None);
    }

    #[test]
    fn os_errors_map_to_library_errors() {
        assert_eq!(Error::from(OsError::Timeout), Error::TimedOut);
        assert_eq!(Error::from(OsError::NoResources), Error::ResourceExhausted);
        assert_eq!(Error::from(OsError::Generic), Error::InvalidArgument);
    }

    #[test]
    fn errno_of_follows_posix_convention() {
        assert_eq!(errno_of(Ok(())), 0);
        assert_eq!(errno_of(Err(Error::Busy)), errno::EBUSY);
    }

    #[test]
    fn only_cancel_and_exit_unwind() {
        assert!(Error::Canceled.is_unwind());
        assert!(Error::Exited.is_unwind());
        assert!(!Error::TimedOut.is_unwind());
    }
}
