//! No-show batch: closes out pending reservations once the pickup deadline has passed.
//!
//! The job is safe to run on any schedule. Before `pickup_deadline + buffer` on the current
//! business date it does nothing; afterwards a run moves every remaining `PENDING` reservation
//! of that date to `NO_SHOW` with one conditional bulk update, so a repeated run finds nothing
//! left to do.

use crate::{
    config::Settings,
    core::{
        clock::BusinessClock,
        deadline, delivery,
        notify::{self, templates},
        product as stock, user,
    },
    entities::{DeliveryStatus, Reservation, ReservationStatus, reservation},
    errors::{Error, Result},
};
use chrono::{NaiveDate, NaiveDateTime};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoShowOutcome {
    /// The guard instant has not been reached; nothing was read or written
    NotYet {
        business_date: NaiveDate,
        runs_after: NaiveDateTime,
    },
    /// The batch ran, possibly finding nothing to do
    Applied(NoShowReport),
}

/// Counts from one applied run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoShowReport {
    pub business_date: NaiveDate,
    /// Reservations moved to `NO_SHOW`
    pub reservations: u64,
    /// Users who received a warning
    pub users: usize,
    /// Unpaid delivery orders cancelled along with their reservations
    pub canceled_orders: usize,
}

#[derive(Default)]
struct Penalty {
    quantity: i64,
    amount: i64,
    codes: Vec<String>,
}

/// Moves the selected reservations to `NO_SHOW` in one conditional update.
///
/// # Errors
/// Returns a concurrency error if any of them left `PENDING` after it was selected.
async fn flip_to_no_show<C>(
    conn: &C,
    business_date: NaiveDate,
    ids: &[i64],
    now: NaiveDateTime,
) -> Result<u64>
where
    C: ConnectionTrait,
{
    let expected = u64::try_from(ids.len()).unwrap_or(u64::MAX);
    let updated = Reservation::update_many()
        .set(reservation::ActiveModel {
            status: Set(ReservationStatus::NoShow),
            status_changed_at: Set(now),
            ..Default::default()
        })
        .filter(reservation::Column::Id.is_in(ids.iter().copied()))
        .filter(reservation::Column::Status.eq(ReservationStatus::Pending))
        .exec(conn)
        .await?
        .rows_affected;
    if updated != expected {
        return Err(Error::concurrency(format!(
            "No-show batch for {business_date} selected {expected} reservations \
             but updated {updated}"
        )));
    }
    Ok(updated)
}

/// Runs the no-show batch for the current business date.
///
/// Reservations on a paid delivery order are skipped; delivery completes them. Each affected
/// user gets one warning per run, with their reversed totals summed over all their no-shows.
///
/// # Errors
/// Returns a concurrency error if a reservation changed between selection and the bulk update;
/// the transaction is rolled back and the run can be retried.
#[tracing::instrument(skip_all, name = "no_show_batch")]
pub async fn run_no_show_batch(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    settings: &Settings,
) -> Result<NoShowOutcome> {
    let now = clock.now_local();
    let business_date = clock.business_date(settings.business.day_close);
    let runs_after = deadline::deadline_at(business_date, settings.reservation.no_show_after());
    if now < runs_after {
        debug!(%business_date, %runs_after, "no-show batch not due yet");
        return Ok(NoShowOutcome::NotYet {
            business_date,
            runs_after,
        });
    }

    let txn = db.begin().await?;
    let pending = Reservation::find()
        .filter(reservation::Column::PickupDate.eq(business_date))
        .filter(reservation::Column::Status.eq(ReservationStatus::Pending))
        .order_by_asc(reservation::Column::Id)
        .all(&txn)
        .await?;
    let pending_ids: Vec<i64> = pending.iter().map(|r| r.id).collect();
    let linked = delivery::linked_active_orders(&txn, &pending_ids).await?;
    let delivered_by_courier: HashSet<i64> = linked
        .iter()
        .filter(|(_, order)| DeliveryStatus::SETTLED.contains(&order.status))
        .map(|(reservation_id, _)| *reservation_id)
        .collect();
    let candidates: Vec<reservation::Model> = pending
        .into_iter()
        .filter(|r| !delivered_by_courier.contains(&r.id))
        .collect();

    let mut report = NoShowReport {
        business_date,
        ..Default::default()
    };
    if candidates.is_empty() {
        txn.commit().await?;
        debug!(%business_date, "no pending reservations past the pickup deadline");
        return Ok(NoShowOutcome::Applied(report));
    }

    let mut penalties: BTreeMap<String, Penalty> = BTreeMap::new();
    let mut restocks: BTreeMap<i64, i32> = BTreeMap::new();
    for r in &candidates {
        let penalty = penalties.entry(r.user_uid.clone()).or_default();
        penalty.quantity += i64::from(r.quantity);
        penalty.amount += r.amount;
        penalty.codes.push(r.display_code.clone());
        *restocks.entry(r.product_id).or_default() += r.quantity;
    }

    // Users are locked before the reservation rows, in uid order.
    let mut locked_users = Vec::with_capacity(penalties.len());
    for uid in penalties.keys() {
        locked_users.push(user::lock_user(&txn, uid).await?);
    }

    let ids: Vec<i64> = candidates.iter().map(|r| r.id).collect();
    let updated = flip_to_no_show(&txn, business_date, &ids, now).await?;
    report.reservations = updated;

    for (product_id, quantity) in restocks {
        stock::restock(&txn, product_id, quantity).await?;
    }
    let candidate_ids: HashSet<i64> = ids.into_iter().collect();
    let mut unpaid_seen = HashSet::new();
    for (reservation_id, order) in &linked {
        if candidate_ids.contains(reservation_id) && unpaid_seen.insert(order.id) {
            delivery::cancel_unpaid_order(&txn, order, now).await?;
        }
    }
    report.canceled_orders = unpaid_seen.len();

    for locked in locked_users {
        let Some(penalty) = penalties.remove(&locked.uid) else {
            continue;
        };
        let uid = locked.uid.clone();
        user::record_no_show(
            &txn,
            locked,
            penalty.quantity,
            penalty.amount,
            business_date,
            &settings.reservation,
        )
        .await?;
        notify::enqueue(
            &txn,
            now,
            templates::NO_SHOW_WARNING,
            &uid,
            &json!({ "codes": penalty.codes, "pickup_date": business_date.to_string() }),
        )
        .await?;
        report.users += 1;
    }
    txn.commit().await?;

    info!(
        %business_date,
        reservations = report.reservations,
        users = report.users,
        canceled_orders = report.canceled_orders,
        "no-show batch applied"
    );
    Ok(NoShowOutcome::Applied(report))
}
