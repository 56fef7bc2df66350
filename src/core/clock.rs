//! Injectable time source.
//!
//! Nothing in the crate reads the system time directly. Time-sensitive operations receive a
//! [`BusinessClock`], which pairs a [`Clock`] with the fixed business UTC offset.

use crate::core::deadline::{self, HourMinute};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex, PoisonError};

/// Source of the current instant.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used by tests and replay tooling.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// Creates a clock frozen at `now`.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A clock that reports business-local time.
#[derive(Clone)]
pub struct BusinessClock {
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl std::fmt::Debug for BusinessClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusinessClock")
            .field("offset", &self.offset)
            .field("now", &self.clock.now())
            .finish()
    }
}

impl BusinessClock {
    /// Wraps `clock`, reporting local time at `offset`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, offset: FixedOffset) -> Self {
        Self { clock, offset }
    }

    /// Business-local wall-clock time.
    #[must_use]
    pub fn now_local(&self) -> NaiveDateTime {
        self.clock.now().with_timezone(&self.offset).naive_local()
    }

    /// The current business date given the configured day close.
    #[must_use]
    pub fn business_date(&self, day_close: HourMinute) -> NaiveDate {
        deadline::resolve_business_date(self.now_local(), day_close)
    }

    /// Converts a business-local time into an absolute instant.
    #[must_use]
    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        self.offset
            .from_local_datetime(&local)
            .single()
            .map_or_else(|| local.and_utc(), |t| t.with_timezone(&Utc))
    }

    /// The fixed business offset.
    #[must_use]
    pub const fn offset(&self) -> FixedOffset {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_fixed_clock_set_and_advance() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::minutes(90));
        assert_eq!(clock.now(), start + chrono::Duration::minutes(90));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_business_clock_applies_offset() {
        let fixed = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 16, 30, 0).unwrap(),
        ));
        let clock = BusinessClock::new(fixed, FixedOffset::east_opt(9 * 3600).unwrap());

        let local = clock.now_local();
        assert_eq!(
            local,
            NaiveDate::from_ymd_opt(2024, 5, 2)
                .unwrap()
                .and_hms_opt(1, 30, 0)
                .unwrap()
        );
        // 01:30 on the 2nd is still the 1st's business day when the day closes at 26:00.
        assert_eq!(
            clock.business_date(HourMinute::new(26, 0)),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
        );
        assert_eq!(
            clock.to_utc(local),
            Utc.with_ymd_and_hms(2024, 5, 1, 16, 30, 0).unwrap()
        );
    }
}
