//! Wall clock and backoff helpers.
//!
//! All timestamps in telemetryhub are UTC milliseconds since the Unix epoch.

use chrono::Utc;
use std::time::Duration;
use std::{cmp, thread};

/// The current wall clock time, in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a `Duration` into signed milliseconds, saturating at `i64::MAX`.
pub fn duration_ms(d: Duration) -> i64 {
    let ms = d
        .as_secs()
        .saturating_mul(1_000)
        .saturating_add(u64::from(d.subsec_millis()));
    if ms > i64::max_value() as u64 {
        i64::max_value()
    } else {
        ms as i64
    }
}

/// Sleep for a span determined by the number of empty polls so far.
///
/// Polling loops call this with a counter they bump on every empty poll and
/// reset on every productive one. The delay doubles per attempt and is
/// clamped to half a second.
#[inline]
pub fn delay(attempts: u32) {
    if attempts > 0 && attempts < 9 {
        let delay = cmp::min(500, 2u32.pow(attempts));
        thread::sleep(Duration::from_millis(u64::from(delay)));
    } else if attempts >= 9 {
        thread::sleep(Duration::from_millis(500));
    };
}

/// Exponential backoff: `base * 2^(attempt - 1)`, never more than `max`.
///
/// Attempt zero is the first try and gets no backoff at all.
pub fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::max_value());
    match base.checked_mul(factor) {
        Some(d) => cmp::min(d, max),
        None => max,
    }
}
