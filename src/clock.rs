//! Wall-clock abstraction so schedules and deadlines can be driven by tests.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

/// Truncates `t` down to a multiple of `interval` since the Unix epoch.
pub fn truncate(t: OffsetDateTime, interval: Duration) -> OffsetDateTime {
    let step = interval.whole_nanoseconds();
    if step <= 0 {
        return t;
    }
    let nanos = t.unix_timestamp_nanos();
    let truncated = nanos - nanos.rem_euclid(step);
    OffsetDateTime::from_unix_timestamp_nanos(truncated).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(datetime!(2030-01-01 0:00 UTC));
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), datetime!(2030-01-01 0:05 UTC));
        let shared = clock.clone();
        shared.set(datetime!(2031-01-01 0:00 UTC));
        assert_eq!(clock.now(), datetime!(2031-01-01 0:00 UTC));
    }

    #[test]
    fn truncate_aligns_to_interval() {
        let t = datetime!(2030-01-01 10:07:31.5 UTC);
        assert_eq!(
            truncate(t, Duration::minutes(5)),
            datetime!(2030-01-01 10:05 UTC)
        );
        assert_eq!(truncate(t, Duration::minutes(1)), datetime!(2030-01-01 10:07 UTC));
        assert_eq!(truncate(t, Duration::ZERO), t);
    }
}
