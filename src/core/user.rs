//! User business logic - order statistics, points, warnings and restrictions.
//!
//! Statistic updates are always applied to a row read under `lock_user` within the caller's
//! transaction, so concurrent reservations by the same user serialise on the user row.

use crate::{
    config::settings::ReservationSettings,
    core::{clock::BusinessClock, system_state},
    entities::{User, user},
    errors::{Error, Result},
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use sea_orm::{QuerySelect, Set, TransactionTrait, prelude::*};
use tracing::{info, warn};

const LAST_WARN_RESET_KEY: &str = "last_warn_reset_month";

/// Creates a user with zeroed statistics.
///
/// # Errors
/// Returns an error if the uid is empty or already exists.
pub async fn create_user(
    db: &DatabaseConnection,
    uid: &str,
    name: &str,
    now: NaiveDateTime,
) -> Result<user::Model> {
    if uid.trim().is_empty() {
        return Err(Error::validation("User id cannot be empty"));
    }
    let model = user::ActiveModel {
        uid: Set(uid.trim().to_string()),
        name: Set(name.trim().to_string()),
        change_name: Set(false),
        total_orders: Set(0),
        total_revenue: Set(0),
        point_balance: Set(0),
        monthly_warn_count: Set(0),
        total_warn_count: Set(0),
        restricted_until: Set(None),
        created_at: Set(now),
    };
    model.insert(db).await.map_err(Into::into)
}

/// Fetches a user, failing with `NotFound` if missing.
pub async fn get_user<C>(conn: &C, uid: &str) -> Result<user::Model>
where
    C: ConnectionTrait,
{
    User::find_by_id(uid.to_string())
        .one(conn)
        .await?
        .ok_or_else(|| Error::not_found("User", uid))
}

/// Fetches a user under an exclusive row lock.
pub async fn lock_user<C>(conn: &C, uid: &str) -> Result<user::Model>
where
    C: ConnectionTrait,
{
    User::find_by_id(uid.to_string())
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| Error::not_found("User", uid))
}

/// Sets the display name and opens the account for reservations.
pub async fn set_name(db: &DatabaseConnection, uid: &str, name: &str) -> Result<user::Model> {
    if name.trim().is_empty() {
        return Err(Error::validation("Name cannot be empty"));
    }
    let txn = db.begin().await?;
    let mut active: user::ActiveModel = lock_user(&txn, uid).await?.into();
    active.name = Set(name.trim().to_string());
    active.change_name = Set(true);
    let updated = active.update(&txn).await?;
    txn.commit().await?;
    Ok(updated)
}

/// Fails if the user is restricted on `business_date`.
pub fn ensure_not_restricted(user: &user::Model, business_date: NaiveDate) -> Result<()> {
    match user.restricted_until {
        Some(until) if until >= business_date => Err(Error::validation(format!(
            "User {} is restricted until {until}",
            user.uid
        ))),
        _ => Ok(()),
    }
}

fn clamp_add(current: i64, delta: i64) -> i64 {
    current.saturating_add(delta).max(0)
}

/// Adjusts order statistics by the given deltas, clamping each total at zero.
pub async fn apply_order_delta<C>(
    conn: &C,
    locked: user::Model,
    quantity_delta: i64,
    amount_delta: i64,
) -> Result<user::Model>
where
    C: ConnectionTrait,
{
    let orders = clamp_add(locked.total_orders, quantity_delta);
    let revenue = clamp_add(locked.total_revenue, amount_delta);
    if locked.total_orders + quantity_delta < 0 || locked.total_revenue + amount_delta < 0 {
        warn!(uid = %locked.uid, quantity_delta, amount_delta, "order totals clamped at zero");
    }
    let mut active: user::ActiveModel = locked.into();
    active.total_orders = Set(orders);
    active.total_revenue = Set(revenue);
    active.update(conn).await.map_err(Into::into)
}

/// Applies a no-show penalty: one warning, reversed totals, and a restriction once the monthly
/// warning count reaches the limit.
pub async fn record_no_show<C>(
    conn: &C,
    locked: user::Model,
    quantity: i64,
    amount: i64,
    business_date: NaiveDate,
    rules: &ReservationSettings,
) -> Result<user::Model>
where
    C: ConnectionTrait,
{
    let monthly = locked.monthly_warn_count + 1;
    let total = locked.total_warn_count + 1;
    let restricted_until = if monthly >= rules.warn_limit {
        let until = business_date + Duration::days(rules.restriction_days);
        info!(uid = %locked.uid, %until, monthly, "user restricted after repeated no-shows");
        Some(locked.restricted_until.map_or(until, |current| current.max(until)))
    } else {
        locked.restricted_until
    };

    let orders = clamp_add(locked.total_orders, -quantity);
    let revenue = clamp_add(locked.total_revenue, -amount);
    let mut active: user::ActiveModel = locked.into();
    active.monthly_warn_count = Set(monthly);
    active.total_warn_count = Set(total);
    active.restricted_until = Set(restricted_until);
    active.total_orders = Set(orders);
    active.total_revenue = Set(revenue);
    active.update(conn).await.map_err(Into::into)
}

/// Adds points to a user's balance.
pub async fn credit_points(db: &DatabaseConnection, uid: &str, points: i64) -> Result<user::Model> {
    if points <= 0 {
        return Err(Error::validation(format!("Point credit must be positive, got {points}")));
    }
    let txn = db.begin().await?;
    let locked = lock_user(&txn, uid).await?;
    let balance = locked.point_balance + points;
    let mut active: user::ActiveModel = locked.into();
    active.point_balance = Set(balance);
    let updated = active.update(&txn).await?;
    txn.commit().await?;
    Ok(updated)
}

/// Spends points, failing with `InsufficientPoints` if the balance does not cover them.
pub async fn debit_points(db: &DatabaseConnection, uid: &str, points: i64) -> Result<user::Model> {
    if points <= 0 {
        return Err(Error::validation(format!("Point debit must be positive, got {points}")));
    }
    let txn = db.begin().await?;
    let locked = lock_user(&txn, uid).await?;
    if locked.point_balance < points {
        return Err(Error::InsufficientPoints {
            balance: locked.point_balance,
            required: points,
        });
    }
    let balance = locked.point_balance - points;
    let mut active: user::ActiveModel = locked.into();
    active.point_balance = Set(balance);
    let updated = active.update(&txn).await?;
    txn.commit().await?;
    Ok(updated)
}

/// Resets every user's monthly warning count once per calendar month.
///
/// Returns `Ok(None)` when the reset already ran this month, otherwise the number of users
/// whose count was reset.
pub async fn reset_monthly_warn_counts(
    db: &DatabaseConnection,
    clock: &BusinessClock,
) -> Result<Option<u64>> {
    let now = clock.now_local();
    let month = now.format("%Y-%m").to_string();

    let txn = db.begin().await?;
    let last_reset = system_state::get_state(&txn, LAST_WARN_RESET_KEY).await?;
    if last_reset.as_deref() == Some(month.as_str()) {
        return Ok(None);
    }

    let reset = User::update_many()
        .set(user::ActiveModel {
            monthly_warn_count: Set(0),
            ..Default::default()
        })
        .filter(user::Column::MonthlyWarnCount.gt(0))
        .exec(&txn)
        .await?
        .rows_affected;
    system_state::set_state(&txn, LAST_WARN_RESET_KEY, &month, now).await?;
    txn.commit().await?;

    info!(%month, reset, "monthly warn counts reset");
    Ok(Some(reset))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::*;

    #[tokio::test]
    async fn test_create_user_validation() -> Result<()> {
        let db = setup_test_db().await?;
        let result = create_user(&db, "  ", "x", local("2024-05-01 09:00")).await;
        assert!(matches!(result, Err(Error::Validation { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_set_name_opens_account() -> Result<()> {
        let db = setup_test_db().await?;
        create_user(&db, "u1", "guest", local("2024-05-01 09:00")).await?;
        let updated = set_name(&db, "u1", " Kim ").await?;
        assert!(updated.change_name);
        assert_eq!(updated.name, "Kim");

        let missing = set_name(&db, "nobody", "x").await;
        assert!(matches!(missing, Err(Error::NotFound { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_order_delta_clamps_at_zero() -> Result<()> {
        let db = setup_test_db().await?;
        let user = create_test_user(&db, "u1").await?;
        let user = apply_order_delta(&db, user, 3, 3000).await?;
        assert_eq!((user.total_orders, user.total_revenue), (3, 3000));

        let user = apply_order_delta(&db, user, -5, -9000).await?;
        assert_eq!((user.total_orders, user.total_revenue), (0, 0));
        Ok(())
    }

    #[tokio::test]
    async fn test_points_debit_requires_balance() -> Result<()> {
        let db = setup_test_db().await?;
        create_test_user(&db, "u1").await?;
        credit_points(&db, "u1", 500).await?;

        let err = debit_points(&db, "u1", 800).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientPoints {
                balance: 500,
                required: 800
            }
        ));

        let user = debit_points(&db, "u1", 200).await?;
        assert_eq!(user.point_balance, 300);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_show_escalates_to_restriction() -> Result<()> {
        let db = setup_test_db().await?;
        let rules = ReservationSettings {
            warn_limit: 2,
            restriction_days: 7,
            ..Default::default()
        };
        let today = date("2024-05-01");
        let user = create_test_user(&db, "u1").await?;
        let user = apply_order_delta(&db, user, 4, 4000).await?;

        let user = record_no_show(&db, user, 1, 1000, today, &rules).await?;
        assert_eq!(user.monthly_warn_count, 1);
        assert!(user.restricted_until.is_none());
        assert_eq!((user.total_orders, user.total_revenue), (3, 3000));
        ensure_not_restricted(&user, today)?;

        let user = record_no_show(&db, user, 1, 1000, today, &rules).await?;
        assert_eq!(user.total_warn_count, 2);
        assert_eq!(user.restricted_until, Some(date("2024-05-08")));
        assert!(ensure_not_restricted(&user, date("2024-05-08")).is_err());
        ensure_not_restricted(&user, date("2024-05-09"))?;
        Ok(())
    }

    #[tokio::test]
    async fn test_monthly_reset_runs_once_per_month() -> Result<()> {
        let db = setup_test_db().await?;
        let (fixed, clock) = test_clock("2024-05-01 00:05");
        let rules = ReservationSettings::default();
        let user = create_test_user(&db, "u1").await?;
        record_no_show(&db, user, 1, 1000, date("2024-04-30"), &rules).await?;

        assert_eq!(reset_monthly_warn_counts(&db, &clock).await?, Some(1));
        assert_eq!(reset_monthly_warn_counts(&db, &clock).await?, None);
        assert_eq!(get_user(&db, "u1").await?.monthly_warn_count, 0);
        assert_eq!(get_user(&db, "u1").await?.total_warn_count, 1);

        set_local(&fixed, "2024-06-01 00:05");
        assert_eq!(reset_monthly_warn_counts(&db, &clock).await?, Some(0));
        Ok(())
    }
}
