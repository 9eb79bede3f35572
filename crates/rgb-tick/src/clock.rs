//! Monotonic nanosecond timestamps.
//!
//! Deadlines are compared as signed nanoseconds relative to a process-wide
//! origin so they fit in atomics and skip-list keys.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

static ORIGIN: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Sentinel for "no deadline".
pub(crate) const DEADLINE_NOT_SET: i64 = i64::MIN;

pub(crate) fn now() -> i64 {
    to_nanos(Instant::now())
}

pub(crate) fn to_nanos(at: Instant) -> i64 {
    let origin = *ORIGIN;
    match at.checked_duration_since(origin) {
        Some(after) => after.as_nanos().min(i64::MAX as u128) as i64,
        None => -(origin.duration_since(at).as_nanos().min(i64::MAX as u128) as i64),
    }
}

pub(crate) fn from_nanos(nanos: i64) -> Instant {
    let origin = *ORIGIN;
    if nanos >= 0 {
        origin + Duration::from_nanos(nanos as u64)
    } else {
        origin
            .checked_sub(Duration::from_nanos(nanos.unsigned_abs()))
            .unwrap_or(origin)
    }
}

pub(crate) fn duration_nanos(duration: Duration) -> i64 {
    duration.as_nanos().min(i64::MAX as u128) as i64
}

/// Next deadline after `previous`, skipping any intervals already missed at `now`.
pub(crate) fn next_deadline(previous: i64, interval: i64, now: i64) -> i64 {
    let next = previous.saturating_add(interval);
    if next >= now || interval <= 0 {
        return next;
    }
    let missed = (now - next) / interval + 1;
    next.saturating_add(missed.saturating_mul(interval))
}
