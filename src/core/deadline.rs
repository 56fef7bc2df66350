//! Deadline arithmetic for business dates.
//!
//! All functions here are pure. Times are business-local `NaiveDateTime`s; the fixed business
//! offset is applied once, in [`crate::core::clock::BusinessClock`].
//!
//! A deadline is a `(hour, minute)` pair relative to midnight at the start of a business date.
//! Hours may exceed 23: `27:00` on 2024-05-01 is 03:00 on 2024-05-02. This lets a business day
//! that closes after midnight be configured with the same shape as one that closes before it.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Time of day relative to the start of a business date; `hour` may be 24 or more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HourMinute {
    /// Hours since the start of the business date
    pub hour: u32,
    /// Minutes past the hour, `0..60`
    pub minute: u32,
}

impl HourMinute {
    /// Creates a new `HourMinute`.
    #[must_use]
    pub const fn new(hour: u32, minute: u32) -> Self {
        Self { hour, minute }
    }

    /// Minutes from the start of the business date.
    #[must_use]
    pub const fn total_minutes(self) -> i64 {
        self.hour as i64 * 60 + self.minute as i64
    }

    /// Adds minutes, carrying into hours.
    #[must_use]
    pub const fn plus_minutes(self, minutes: u32) -> Self {
        let total = self.hour * 60 + self.minute + minutes;
        Self {
            hour: total / 60,
            minute: total % 60,
        }
    }

    /// Whether this falls after midnight of the following calendar day.
    #[must_use]
    pub const fn crosses_midnight(self) -> bool {
        self.hour >= 24
    }

    /// Business-relative time of a local wall-clock instant on `business_date`.
    ///
    /// An instant on the following calendar day maps to an hour of 24 or more.
    #[must_use]
    pub fn of(business_date: NaiveDate, local: NaiveDateTime) -> Self {
        let minutes = (local - start_of(business_date)).num_minutes().max(0);
        let minutes = u32::try_from(minutes).unwrap_or(u32::MAX);
        Self {
            hour: minutes / 60,
            minute: minutes % 60,
        }
    }
}

impl fmt::Display for HourMinute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

fn start_of(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// Absolute business-local instant of `at` on `business_date`.
///
/// `deadline_at(2024-05-01, 27:00)` is `2024-05-02 03:00`.
#[must_use]
pub fn deadline_at(business_date: NaiveDate, at: HourMinute) -> NaiveDateTime {
    start_of(business_date) + Duration::minutes(at.total_minutes())
}

/// True once `now` has reached the deadline `at` on `business_date`.
#[must_use]
pub fn is_after(now: NaiveDateTime, business_date: NaiveDate, at: HourMinute) -> bool {
    now >= deadline_at(business_date, at)
}

/// The business date `now` belongs to.
///
/// When the business day closes after midnight (`day_close.hour >= 24`), instants between
/// midnight and the close still belong to the previous calendar date.
#[must_use]
pub fn resolve_business_date(now: NaiveDateTime, day_close: HourMinute) -> NaiveDate {
    let today = now.date();
    if !day_close.crosses_midnight() {
        return today;
    }
    let overflow_minutes = day_close.total_minutes() - 24 * 60;
    let minutes_into_day = i64::from(now.hour() * 60 + now.minute());
    if minutes_into_day < overflow_minutes {
        today.pred_opt().unwrap_or(today)
    } else {
        today
    }
}
