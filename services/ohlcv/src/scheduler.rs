//! Clock abstraction and minute-aligned refresh timing
//!
//! The refresh loop sleeps until the next wall-clock minute boundary,
//! recomputing the delay from the absolute clock on every iteration so that
//! processing time never accumulates as drift.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;

const NANOS_PER_MINUTE: i64 = 60 * 1_000_000_000;

/// Source of the current instant in Unix nanoseconds.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_nanos: i64) -> Self {
        Self {
            now: AtomicI64::new(now_nanos),
        }
    }

    pub fn set(&self, now_nanos: i64) {
        self.now.store(now_nanos, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let nanos = i64::try_from(by.as_nanos()).unwrap_or(i64::MAX);
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Time left until the next minute boundary strictly after `now_nanos`.
///
/// Exactly on a boundary the full minute is returned.
pub fn delay_until_next_minute(now_nanos: i64) -> Duration {
    let into_minute = now_nanos.rem_euclid(NANOS_PER_MINUTE);
    Duration::from_nanos((NANOS_PER_MINUTE - into_minute) as u64)
}
