//! Shared test utilities.
//!
//! This module provides common helpers for setting up test databases, pinning the clock and
//! creating users, products and reservation requests with sensible defaults.

#![allow(clippy::unwrap_used)]

use crate::{
    config::Settings,
    core::{
        clock::{BusinessClock, FixedClock},
        product::{self, NewProduct},
        reservation::{self, ReserveRequest},
        user,
    },
    entities,
    errors::Result,
};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Routes `tracing` output through the test harness so it shows up for failing tests.
/// Safe to call from every test; only the first call installs the subscriber.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Business offset used by every test clock (+09:00).
const TEST_OFFSET_SECS: i32 = 9 * 3600;

/// Creates an in-memory `SQLite` database with all tables initialized.
/// This is the standard setup for all integration tests.
///
/// The pool holds a single connection, so the whole test shares one database and concurrent
/// transactions queue for it.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Parses `"YYYY-MM-DD HH:MM"` as a business-local time.
pub fn local(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
}

/// Parses `"YYYY-MM-DD"`.
pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn instant(s: &str) -> DateTime<Utc> {
    FixedOffset::east_opt(TEST_OFFSET_SECS)
        .unwrap()
        .from_local_datetime(&local(s))
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

/// A frozen clock showing business-local time `s`, plus the handle to move it.
pub fn test_clock(s: &str) -> (Arc<FixedClock>, BusinessClock) {
    let fixed = Arc::new(FixedClock::new(instant(s)));
    let clock = BusinessClock::new(
        Arc::clone(&fixed) as Arc<dyn crate::core::clock::Clock>,
        FixedOffset::east_opt(TEST_OFFSET_SECS).unwrap(),
    );
    (fixed, clock)
}

/// Moves a test clock to business-local time `s`.
pub fn set_local(fixed: &FixedClock, s: &str) {
    fixed.set(instant(s));
}

/// Creates a user who has already set a name and may reserve.
pub async fn create_test_user(db: &DatabaseConnection, uid: &str) -> Result<entities::user::Model> {
    user::create_user(db, uid, "guest", local("2024-04-01 09:00")).await?;
    user::set_name(db, uid, &format!("User {uid}")).await
}

/// Product input with sensible defaults.
///
/// # Defaults
/// * `name`: `"Strawberry box"`
/// * `sell_time`: None (on sale all day)
/// * `visible`, `delivery_available`: true
pub fn sample_product(sell_date: NaiveDate, price: i64, stock: i32) -> NewProduct {
    NewProduct {
        name: "Strawberry box".to_string(),
        price,
        stock,
        sell_date,
        sell_time: None,
        visible: true,
        delivery_available: true,
    }
}

/// Creates a visible, deliverable product.
pub async fn create_test_product(
    db: &DatabaseConnection,
    sell_date: NaiveDate,
    price: i64,
    stock: i32,
) -> Result<entities::product::Model> {
    let new = sample_product(sell_date, price, stock);
    product::create_product(db, new, local("2024-04-01 09:00")).await
}

/// Reserves `quantity` units for `uid` under default settings.
pub async fn reserve_units(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    uid: &str,
    product_id: i64,
    quantity: i32,
) -> Result<entities::reservation::Model> {
    let request = reserve_request(uid, product_id, quantity);
    reservation::reserve(db, clock, &Settings::default(), &request).await
}

/// Reservation request for `quantity` units.
pub fn reserve_request(uid: &str, product_id: i64, quantity: i32) -> ReserveRequest {
    ReserveRequest {
        user_uid: uid.to_string(),
        product_id,
        quantity,
    }
}
