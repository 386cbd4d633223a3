//! Deadline conversion.
//!
//! Timed operations take an absolute `SystemTime` deadline. The OSAL only
//! knows relative millisecond timeouts, so each wait converts its deadline
//! once, on entry.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NANOS_PER_MILLI: u128 = 1_000_000;

/// Milliseconds from now until `deadline`; `0` when it already passed.
#[must_use]
pub fn relative_millis(deadline: SystemTime) -> u32 {
    relative_millis_from(deadline, SystemTime::now())
}

/// Milliseconds from `now` until `deadline`.
///
/// The deadline is rounded half-up to a whole millisecond and `now` is
/// truncated. The result never equals `u32::MAX`, which some OS layers treat
/// as "wait forever".
#[must_use]
pub fn relative_millis_from(deadline: SystemTime, now: SystemTime) -> u32 {
    let deadline_ms = millis_since_epoch(deadline, true);
    let now_ms = millis_since_epoch(now, false);
    if deadline_ms <= now_ms {
        return 0;
    }
    let delta = deadline_ms - now_ms;
    u32::try_from(delta).unwrap_or(u32::MAX).min(u32::MAX - 1)
}

fn millis_since_epoch(at: SystemTime, round_half_up: bool) -> u128 {
    let since = at.duration_since(UNIX_EPOCH).unwrap_or_default();
    let nanos = since.as_nanos();
    if round_half_up {
        (nanos + NANOS_PER_MILLI / 2) / NANOS_PER_MILLI
    } else {
        nanos / NANOS_PER_MILLI
    }
}

/// Interval in whole milliseconds, sub-millisecond remainders rounded up.
#[must_use]
pub fn interval_millis(interval: Duration) -> u32 {
    let millis = interval.as_nanos().div_ceil(NANOS_PER_MILLI);
    u32::try_from(millis).unwrap_or(u32::MAX - 1).min(u32::MAX - 1)
}
