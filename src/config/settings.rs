//! Business rules loaded from `config.toml`.
//!
//! Every section and field has a default, so an empty file (or no file at all, via
//! [`Settings::default`]) yields a usable configuration. Values are checked by
//! [`Settings::validate`] before the engine starts.

use crate::core::deadline::HourMinute;
use crate::errors::{Error, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Time zone and business-day boundaries
    pub business: BusinessSettings,
    /// Reservation deadlines and no-show penalties
    pub reservation: ReservationSettings,
    /// Delivery window, pricing and distance limits
    pub delivery: DeliverySettings,
    /// Background job intervals
    pub scheduler: SchedulerSettings,
    /// Retry policy for batch jobs
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusinessSettings {
    /// Fixed offset of the business time zone, in hours east of UTC
    pub utc_offset_hours: i32,
    /// End of the business day; hours of 24 or more close after midnight
    pub day_close: HourMinute,
}

impl Default for BusinessSettings {
    fn default() -> Self {
        Self {
            utc_offset_hours: 9,
            day_close: HourMinute::new(26, 0),
        }
    }
}

impl BusinessSettings {
    /// The business offset as a `chrono` value.
    pub fn offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).ok_or_else(|| Error::Config {
            message: format!("Invalid utc_offset_hours: {}", self.utc_offset_hours),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReservationSettings {
    /// New reservations close at this time on the sell date
    pub deadline: HourMinute,
    /// Customers may cancel or reduce reservations until this time
    pub cancel_deadline: HourMinute,
    /// Pending reservations become no-show candidates after this time
    pub pickup_deadline: HourMinute,
    /// Grace period after the pickup deadline before the no-show job acts
    pub no_show_buffer_minutes: u32,
    /// Monthly no-shows that trigger a restriction
    pub warn_limit: i32,
    /// Length of a restriction in days
    pub restriction_days: i64,
}

impl Default for ReservationSettings {
    fn default() -> Self {
        Self {
            deadline: HourMinute::new(19, 30),
            cancel_deadline: HourMinute::new(19, 0),
            pickup_deadline: HourMinute::new(20, 0),
            no_show_buffer_minutes: 3,
            warn_limit: 3,
            restriction_days: 7,
        }
    }
}

impl ReservationSettings {
    /// The instant (relative to the business date) after which the no-show job may run.
    #[must_use]
    pub const fn no_show_after(&self) -> HourMinute {
        self.pickup_deadline.plus_minutes(self.no_show_buffer_minutes)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// First deliverable time of the business date
    pub start: HourMinute,
    /// Last deliverable time of the business date
    pub end: HourMinute,
    /// Scheduled slots must fall on multiples of this many minutes
    pub slot_granularity_minutes: u32,
    /// Minimum lead time for a scheduled slot, and the order cutoff before `end`
    pub lead_minutes: u32,
    /// Minimum total reservation amount in won
    pub min_order_amount: i64,
    pub store_latitude: f64,
    pub store_longitude: f64,
    /// Orders beyond this great-circle distance are refused
    pub max_distance_km: f64,
    /// Distance covered by the flat near fee
    pub near_distance_km: f64,
    /// Flat fee in won up to `near_distance_km`
    pub fee_near: i64,
    /// Additional fee in won per started 100 m beyond `near_distance_km`
    pub fee_per_100m: i64,
    /// Unpaid orders older than this fail
    pub payment_expiry_minutes: i64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            start: HourMinute::new(12, 0),
            end: HourMinute::new(20, 0),
            slot_granularity_minutes: 30,
            lead_minutes: 60,
            min_order_amount: 15_000,
            store_latitude: 37.5665,
            store_longitude: 126.9780,
            max_distance_km: 3.0,
            near_distance_km: 1.0,
            fee_near: 2_900,
            fee_per_100m: 100,
            payment_expiry_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub no_show_interval_secs: u64,
    pub payment_expiry_interval_secs: u64,
    pub aggregation_interval_secs: u64,
    pub outbox_interval_secs: u64,
    /// Claimed aggregation rows older than this without a finish are taken over
    pub stale_claim_minutes: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            no_show_interval_secs: 600,
            payment_expiry_interval_secs: 300,
            aggregation_interval_secs: 3600,
            outbox_interval_secs: 30,
            stale_claim_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetrySettings {
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn invalid(message: String) -> Error {
    Error::Config { message }
}

impl Settings {
    /// Checks cross-field constraints.
    ///
    /// # Errors
    /// Returns `Error::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        self.business.offset()?;

        let r = &self.reservation;
        for (name, hm) in [
            ("reservation.deadline", r.deadline),
            ("reservation.cancel_deadline", r.cancel_deadline),
            ("reservation.pickup_deadline", r.pickup_deadline),
            ("delivery.start", self.delivery.start),
            ("delivery.end", self.delivery.end),
            ("business.day_close", self.business.day_close),
        ] {
            if hm.minute >= 60 {
                return Err(invalid(format!("{name} has minute {} >= 60", hm.minute)));
            }
        }

        // The no-show job needs at least one tick between the guard and the day close,
        // otherwise that day's no-shows are never processed.
        let interval_minutes = self.scheduler.no_show_interval_secs.div_ceil(60);
        let interval_minutes = u32::try_from(interval_minutes).unwrap_or(u32::MAX);
        let latest_run = r.no_show_after().plus_minutes(interval_minutes);
        if self.business.day_close < latest_run {
            return Err(invalid(format!(
                "business.day_close {} must be at or after {latest_run} \
                 (pickup deadline + no-show buffer + one no-show interval)",
                self.business.day_close
            )));
        }

        if r.deadline > r.pickup_deadline || r.cancel_deadline > r.pickup_deadline {
            return Err(invalid(
                "reservation and cancellation deadlines must not be after the pickup deadline"
                    .to_string(),
            ));
        }

        if r.warn_limit <= 0 || r.restriction_days < 0 {
            return Err(invalid(
                "reservation.warn_limit must be positive and restriction_days non-negative"
                    .to_string(),
            ));
        }

        let d = &self.delivery;
        if d.end <= d.start {
            return Err(invalid(format!(
                "delivery.end {} must be after delivery.start {}",
                d.end, d.start
            )));
        }
        if d.slot_granularity_minutes == 0 || 60 % d.slot_granularity_minutes != 0 {
            return Err(invalid(format!(
                "delivery.slot_granularity_minutes {} must divide 60",
                d.slot_granularity_minutes
            )));
        }
        if d.max_distance_km <= 0.0
            || d.near_distance_km < 0.0
            || d.fee_near < 0
            || d.fee_per_100m < 0
        {
            return Err(invalid(
                "delivery distances and fees must be non-negative".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1".to_string()));
        }

        Ok(())
    }
}

/// Loads and validates settings from a TOML file.
///
/// # Errors
/// Returns an error if:
/// - The file cannot be read
/// - The TOML syntax is invalid
/// - The values fail [`Settings::validate`]
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let path_ref = path.as_ref();
    tracing::debug!("Loading settings from {:?}", path_ref);
    let contents = std::fs::read_to_string(path_ref).map_err(|e| Error::Config {
        message: format!("Failed to read config file {path_ref:?}: {e}"),
    })?;
    parse_settings(&contents)
}

/// Parses and validates settings from TOML text.
///
/// # Errors
/// Returns an error if the TOML is invalid or the values fail [`Settings::validate`].
pub fn parse_settings(contents: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(contents).map_err(|e| Error::Config {
        message: format!("Failed to parse config.toml: {e}"),
    })?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::float_cmp)]
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
            [business]
            day_close = { hour = 27, minute = 0 }

            [reservation]
            pickup_deadline = { hour = 21, minute = 30 }
            warn_limit = 2

            [delivery]
            min_order_amount = 20000
            max_distance_km = 5.0
        "#;

        let settings = parse_settings(toml_str).unwrap();
        assert_eq!(settings.business.day_close, HourMinute::new(27, 0));
        assert_eq!(settings.business.utc_offset_hours, 9);
        assert_eq!(settings.reservation.pickup_deadline, HourMinute::new(21, 30));
        assert_eq!(settings.reservation.deadline, HourMinute::new(19, 30));
        assert_eq!(settings.reservation.warn_limit, 2);
        assert_eq!(settings.delivery.min_order_amount, 20_000);
        assert_eq!(settings.delivery.max_distance_km, 5.0);
        assert_eq!(settings.scheduler.no_show_interval_secs, 600);
    }

    #[test]
    fn test_day_close_must_leave_room_for_no_show_job() {
        let toml_str = r#"
            [business]
            day_close = { hour = 20, minute = 5 }
        "#;
        let err = parse_settings(toml_str).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        // 20:00 + 3 min buffer + 10 min interval
        let toml_str = r#"
            [business]
            day_close = { hour = 20, minute = 13 }
        "#;
        parse_settings(toml_str).unwrap();
    }

    #[test]
    fn test_rejects_inverted_delivery_window() {
        let mut settings = Settings::default();
        settings.delivery.end = HourMinute::new(11, 0);
        assert!(matches!(settings.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_rejects_bad_granularity() {
        let mut settings = Settings::default();
        settings.delivery.slot_granularity_minutes = 7;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = load_settings("/nonexistent/sameday.toml").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
