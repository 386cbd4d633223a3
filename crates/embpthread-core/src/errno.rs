//! Error number definitions.
//!
//! The POSIX numbers reported by [`crate::Error::errno`] and stored in the
//! per-thread errno word ([`crate::Runtime::errno`]).

pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const ESRCH: i32 = 3;
pub const EINTR: i32 = 4;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const ENOSPC: i32 = 28;
pub const EDEADLK: i32 = 35;
pub const ENOSYS: i32 = 38;
pub const ENOTSUP: i32 = 95;
pub const ETIMEDOUT: i32 = 110;
/// Internal code for "thread canceled"; never a POSIX return value.
pub const ECANCELED: i32 = 125;

/// Short symbolic name for an errno value, for logs and reports.
#[must_use]
pub const fn errno_name(value: i32) -> &'static str {
    match value {
        0 => "OK",
        EPERM => "EPERM",
        ENOENT => "ENOENT",
        ESRCH => "ESRCH",
        EINTR => "EINTR",
        EAGAIN => "EAGAIN",
        ENOMEM => "ENOMEM",
        EBUSY => "EBUSY",
        EINVAL => "EINVAL",
        ENOSPC => "ENOSPC",
        EDEADLK => "EDEADLK",
        ENOSYS => "ENOSYS",
        ENOTSUP => "ENOTSUP",
        ETIMEDOUT => "ETIMEDOUT",
        ECANCELED => "ECANCELED",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_names_cover_library_codes() {
        assert_eq!(errno_name(0), "OK");
        assert_eq!(errno_name(EBUSY), "EBUSY");
        assert_eq!(errno_name(ETIMEDOUT), "ETIMEDOUT");
        assert_eq!(errno_name(-7), "UNKNOWN");
    }
}
