//! Daily aggregation: locks in a closed business date's sales and delivery totals exactly once.
//!
//! A run goes through five steps, each safe to repeat:
//!
//! 1. **Mark** - insert-ignore one `agg_applied` row per eligible reservation and phase.
//! 2. **Claim** - stamp every unclaimed (or stale) row of the date with a fresh batch id in one
//!    conditional update. Only the run that claimed a row may finish it.
//! 3. **Auto-complete** - paid orders of the date that were never confirmed become `DELIVERED`.
//! 4. **Upsert** - recompute the date's totals from all claimed rows and replace the aggregate
//!    rows, so a repeated upsert changes nothing.
//! 5. **Finish** - set `processed_at` on the batch; the count must match the claim.
//!
//! A second run on the same date claims nothing and returns early, which is how overlapping
//! runs stay harmless without a global lock.

use crate::{
    config::Settings,
    core::{clock::BusinessClock, delivery},
    entities::{
        AggApplied, AggPhase, DeliveryDailyAgg, DeliveryOrder, DeliveryOrderItem, DeliveryStatus,
        ProductDailyAgg, Reservation, ReservationStatus, agg_applied, delivery_daily_agg,
        delivery_order, delivery_order_item, product_daily_agg, reservation,
    },
    errors::{Error, Result},
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use sea_orm::{Condition, Set, TransactionTrait, prelude::*, sea_query::OnConflict};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Rows per insert or `IN (...)` list.
const CHUNK: usize = 200;

/// Counts from one aggregation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationReport {
    pub business_date: NaiveDate,
    /// Batch id of this run, `None` if it claimed nothing
    pub batch_uid: Option<String>,
    pub marked: u64,
    pub claimed: u64,
    pub auto_completed: u64,
    pub product_rows: usize,
    pub delivery_rows: usize,
    pub finished: u64,
}

/// Aggregates the business date before the current one.
pub async fn run_daily_aggregation(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    settings: &Settings,
) -> Result<AggregationReport> {
    let today = clock.business_date(settings.business.day_close);
    let target = today
        .pred_opt()
        .ok_or_else(|| Error::validation(format!("No business date before {today}")))?;
    aggregate_business_date(db, clock, settings, target).await
}

/// Aggregates one closed business date.
///
/// # Errors
/// Returns a consistency error if the number of rows finished differs from the number claimed.
/// On any failure after the claim, the run's writes are rolled back and its claim is released,
/// so the next attempt starts from the same rows.
#[tracing::instrument(skip(db, clock, settings), name = "aggregate")]
pub async fn aggregate_business_date(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    settings: &Settings,
    business_date: NaiveDate,
) -> Result<AggregationReport> {
    let now = clock.now_local();
    let mut report = AggregationReport {
        business_date,
        ..Default::default()
    };

    report.marked = mark_eligible(db, business_date, now).await?;

    let batch_uid = Uuid::new_v4().to_string();
    let stale_before = now - Duration::minutes(settings.scheduler.stale_claim_minutes);
    report.claimed = claim(db, business_date, &batch_uid, now, stale_before).await?;
    if report.claimed == 0 {
        debug!(%business_date, marked = report.marked, "nothing to aggregate");
        return Ok(report);
    }
    report.batch_uid = Some(batch_uid.clone());

    if let Err(err) = apply_batch(db, &batch_uid, now, &mut report).await {
        release_claim(db, &batch_uid).await;
        return Err(err);
    }

    info!(
        %business_date,
        batch_uid = %batch_uid,
        marked = report.marked,
        claimed = report.claimed,
        auto_completed = report.auto_completed,
        product_rows = report.product_rows,
        delivery_rows = report.delivery_rows,
        "daily aggregation finished"
    );
    Ok(report)
}

/// Auto-complete, upsert and finish for a claimed batch, in one transaction.
async fn apply_batch(
    db: &DatabaseConnection,
    batch_uid: &str,
    now: NaiveDateTime,
    report: &mut AggregationReport,
) -> Result<()> {
    let business_date = report.business_date;
    let txn = db.begin().await?;
    report.auto_completed =
        delivery::complete_open_orders_for_date(&txn, business_date, now).await?;
    report.product_rows = upsert_product_totals(&txn, business_date, now).await?;
    report.delivery_rows = upsert_delivery_totals(&txn, business_date, now).await?;

    report.finished = finish(&txn, batch_uid, now).await?;
    if report.finished != report.claimed {
        return Err(Error::consistency(format!(
            "Aggregation batch {batch_uid} for {business_date} claimed {} rows but finished {}",
            report.claimed, report.finished
        )));
    }
    txn.commit().await?;
    Ok(())
}

async fn finish<C>(conn: &C, batch_uid: &str, now: NaiveDateTime) -> Result<u64>
where
    C: ConnectionTrait,
{
    Ok(AggApplied::update_many()
        .set(agg_applied::ActiveModel {
            processed_at: Set(Some(now)),
            ..Default::default()
        })
        .filter(agg_applied::Column::BatchUid.eq(batch_uid))
        .filter(agg_applied::Column::ProcessedAt.is_null())
        .exec(conn)
        .await?
        .rows_affected)
}

/// Returns a failed batch's unfinished rows to the unclaimed pool.
async fn release_claim(db: &DatabaseConnection, batch_uid: &str) {
    let released = AggApplied::update_many()
        .set(agg_applied::ActiveModel {
            batch_uid: Set(None),
            claimed_at: Set(None),
            ..Default::default()
        })
        .filter(agg_applied::Column::BatchUid.eq(batch_uid))
        .filter(agg_applied::Column::ProcessedAt.is_null())
        .exec(db)
        .await;
    match released {
        Ok(result) => warn!(batch_uid, rows = result.rows_affected, "aggregation claim released"),
        // Rows stay claimed and are taken over once stale.
        Err(err) => error!(batch_uid, error = %err, "failed to release aggregation claim"),
    }
}

/// Reservations that count towards the date's sales, per phase.
///
/// Product sales: reservations picked up at the counter plus those on a paid delivery order.
/// Delivery: reservations on a paid delivery order scheduled for the date.
async fn eligible<C>(conn: &C, business_date: NaiveDate) -> Result<(Vec<i64>, Vec<i64>)>
where
    C: ConnectionTrait,
{
    let settled_orders: Vec<i64> = DeliveryOrder::find()
        .filter(delivery_order::Column::DeliveryDate.eq(business_date))
        .filter(delivery_order::Column::Status.is_in(DeliveryStatus::SETTLED))
        .all(conn)
        .await?
        .into_iter()
        .map(|order| order.id)
        .collect();

    let mut delivered = Vec::new();
    for chunk in settled_orders.chunks(CHUNK) {
        delivered.extend(
            DeliveryOrderItem::find()
                .filter(delivery_order_item::Column::DeliveryOrderId.is_in(chunk.iter().copied()))
                .all(conn)
                .await?
                .into_iter()
                .map(|item| item.reservation_id),
        );
    }
    delivered.sort_unstable();
    delivered.dedup();

    let mut sold: Vec<i64> = Reservation::find()
        .filter(reservation::Column::PickupDate.eq(business_date))
        .filter(reservation::Column::Status.eq(ReservationStatus::Picked))
        .all(conn)
        .await?
        .into_iter()
        .map(|r| r.id)
        .collect();
    sold.extend(delivered.iter().copied());
    sold.sort_unstable();
    sold.dedup();
    Ok((sold, delivered))
}

async fn mark_eligible(
    db: &DatabaseConnection,
    business_date: NaiveDate,
    now: NaiveDateTime,
) -> Result<u64> {
    let txn = db.begin().await?;
    let (sold, delivered) = eligible(&txn, business_date).await?;
    let mut marked = 0;
    for (phase, ids) in [(AggPhase::ProductSales, sold), (AggPhase::Delivery, delivered)] {
        for chunk in ids.chunks(CHUNK) {
            let rows = chunk.iter().map(|&reservation_id| agg_applied::ActiveModel {
                reservation_id: Set(reservation_id),
                phase: Set(phase),
                business_date: Set(business_date),
                batch_uid: Set(None),
                claimed_at: Set(None),
                processed_at: Set(None),
                created_at: Set(now),
                ..Default::default()
            });
            marked += AggApplied::insert_many(rows)
                .on_conflict(
                    OnConflict::columns([
                        agg_applied::Column::ReservationId,
                        agg_applied::Column::Phase,
                    ])
                    .do_nothing()
                    .to_owned(),
                )
                .exec_without_returning(&txn)
                .await?;
        }
    }
    txn.commit().await?;
    Ok(marked)
}

/// Assigns `batch_uid` to every unclaimed row of the date and to rows whose claim went stale.
async fn claim(
    db: &DatabaseConnection,
    business_date: NaiveDate,
    batch_uid: &str,
    now: NaiveDateTime,
    stale_before: NaiveDateTime,
) -> Result<u64> {
    let stale = AggApplied::find()
        .filter(agg_applied::Column::BusinessDate.eq(business_date))
        .filter(agg_applied::Column::ProcessedAt.is_null())
        .filter(agg_applied::Column::ClaimedAt.lt(stale_before))
        .all(db)
        .await?;
    if !stale.is_empty() {
        let batches: HashSet<&str> =
            stale.iter().filter_map(|row| row.batch_uid.as_deref()).collect();
        warn!(
            %business_date,
            rows = stale.len(),
            ?batches,
            "taking over stale aggregation claims"
        );
    }

    Ok(AggApplied::update_many()
        .set(agg_applied::ActiveModel {
            batch_uid: Set(Some(batch_uid.to_string())),
            claimed_at: Set(Some(now)),
            ..Default::default()
        })
        .filter(agg_applied::Column::BusinessDate.eq(business_date))
        .filter(agg_applied::Column::ProcessedAt.is_null())
        .filter(
            Condition::any()
                .add(agg_applied::Column::BatchUid.is_null())
                .add(agg_applied::Column::ClaimedAt.lt(stale_before)),
        )
        .exec(db)
        .await?
        .rows_affected)
}

/// Reservation ids of all claimed rows of the date in `phase`, finished or not.
async fn claimed_reservations<C>(
    conn: &C,
    business_date: NaiveDate,
    phase: AggPhase,
) -> Result<Vec<reservation::Model>>
where
    C: ConnectionTrait,
{
    let ids: Vec<i64> = AggApplied::find()
        .filter(agg_applied::Column::BusinessDate.eq(business_date))
        .filter(agg_applied::Column::Phase.eq(phase))
        .filter(agg_applied::Column::BatchUid.is_not_null())
        .all(conn)
        .await?
        .into_iter()
        .map(|row| row.reservation_id)
        .collect();

    let mut reservations = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(CHUNK) {
        reservations.extend(
            Reservation::find()
                .filter(reservation::Column::Id.is_in(chunk.iter().copied()))
                .all(conn)
                .await?,
        );
    }
    Ok(reservations)
}

async fn upsert_product_totals<C>(
    conn: &C,
    business_date: NaiveDate,
    now: NaiveDateTime,
) -> Result<usize>
where
    C: ConnectionTrait,
{
    let mut totals: BTreeMap<i64, (i64, i64)> = BTreeMap::new();
    for r in claimed_reservations(conn, business_date, AggPhase::ProductSales).await? {
        let entry = totals.entry(r.product_id).or_default();
        entry.0 += i64::from(r.quantity);
        entry.1 += r.amount;
    }

    for (&product_id, &(quantity, amount)) in &totals {
        let row = product_daily_agg::ActiveModel {
            product_id: Set(product_id),
            sell_date: Set(business_date),
            quantity: Set(quantity),
            amount: Set(amount),
            updated_at: Set(now),
            ..Default::default()
        };
        ProductDailyAgg::insert(row)
            .on_conflict(
                OnConflict::columns([
                    product_daily_agg::Column::ProductId,
                    product_daily_agg::Column::SellDate,
                ])
                .update_columns([
                    product_daily_agg::Column::Quantity,
                    product_daily_agg::Column::Amount,
                    product_daily_agg::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;
    }
    Ok(totals.len())
}

async fn upsert_delivery_totals<C>(
    conn: &C,
    business_date: NaiveDate,
    now: NaiveDateTime,
) -> Result<usize>
where
    C: ConnectionTrait,
{
    let reservations = claimed_reservations(conn, business_date, AggPhase::Delivery).await?;
    if reservations.is_empty() {
        return Ok(0);
    }
    let by_id: HashMap<i64, &reservation::Model> =
        reservations.iter().map(|r| (r.id, r)).collect();

    let mut items = Vec::new();
    let ids: Vec<i64> = by_id.keys().copied().collect();
    for chunk in ids.chunks(CHUNK) {
        items.extend(
            DeliveryOrderItem::find()
                .filter(delivery_order_item::Column::ReservationId.is_in(chunk.iter().copied()))
                .all(conn)
                .await?,
        );
    }
    let order_ids: HashSet<i64> = items.iter().map(|item| item.delivery_order_id).collect();
    let orders: HashMap<i64, delivery_order::Model> = DeliveryOrder::find()
        .filter(delivery_order::Column::Id.is_in(order_ids))
        .filter(delivery_order::Column::DeliveryDate.eq(business_date))
        .filter(delivery_order::Column::Status.is_in(DeliveryStatus::SETTLED))
        .all(conn)
        .await?
        .into_iter()
        .map(|order| (order.id, order))
        .collect();

    let (mut quantity, mut amount) = (0_i64, 0_i64);
    let mut counted = HashSet::new();
    for item in &items {
        if !orders.contains_key(&item.delivery_order_id) {
            continue;
        }
        if let Some(r) = by_id.get(&item.reservation_id) {
            if counted.insert(r.id) {
                quantity += i64::from(r.quantity);
                amount += r.amount;
            }
        }
    }
    let fee: i64 = orders.values().map(|order| order.delivery_fee).sum();

    let row = delivery_daily_agg::ActiveModel {
        sell_date: Set(business_date),
        order_count: Set(i64::try_from(orders.len()).unwrap_or(i64::MAX)),
        quantity: Set(quantity),
        amount: Set(amount),
        delivery_fee: Set(fee),
        updated_at: Set(now),
        ..Default::default()
    };
    DeliveryDailyAgg::insert(row)
        .on_conflict(
            OnConflict::column(delivery_daily_agg::Column::SellDate)
                .update_columns([
                    delivery_daily_agg::Column::OrderCount,
                    delivery_daily_agg::Column::Quantity,
                    delivery_daily_agg::Column::Amount,
                    delivery_daily_agg::Column::DeliveryFee,
                    delivery_daily_agg::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::core::{
        delivery::{
            PaymentCallback, ReadyRequest, apply_payment_result, complete_delivery, get_order,
            ready,
        },
        reservation::{self as lifecycle, Actor},
    };
    use crate::test_utils::*;

    fn ready_request(reservation_id: i64, key: &str) -> ReadyRequest {
        let rules = Settings::default().delivery;
        ReadyRequest {
            user_uid: "a".to_string(),
            reservation_ids: vec![reservation_id],
            idempotency_key: key.to_string(),
            slot: None,
            latitude: rules.store_latitude,
            longitude: rules.store_longitude,
        }
    }

    async fn pay(db: &DatabaseConnection, clock: &BusinessClock, order_id: i64) -> Result<()> {
        let callback = PaymentCallback {
            order_id,
            success: true,
            transaction_id: format!("tx-{order_id}"),
        };
        apply_payment_result(db, clock, &callback).await?;
        Ok(())
    }

    async fn product_rows(db: &DatabaseConnection) -> Result<Vec<product_daily_agg::Model>> {
        Ok(ProductDailyAgg::find().all(db).await?)
    }

    async fn delivery_row(
        db: &DatabaseConnection,
        day: NaiveDate,
    ) -> Result<delivery_daily_agg::Model> {
        Ok(DeliveryDailyAgg::find()
            .filter(delivery_daily_agg::Column::SellDate.eq(day))
            .one(db)
            .await?
            .unwrap())
    }

    /// Two delivery orders (2 and 3 units at 10 000 won), one counter pickup of 1 unit, and a
    /// cancelled reservation, all on 2024-05-01. The second order is paid but never confirmed.
    async fn seed_day(db: &DatabaseConnection) -> Result<(i64, i64)> {
        let (_fixed, clock) = test_clock("2024-05-01 13:00");
        let settings = Settings::default();
        create_test_user(db, "a").await?;
        let product = create_test_product(db, date("2024-05-01"), 10_000, 20).await?;

        let r1 = reserve_units(db, &clock, "a", product.id, 2).await?;
        let r2 = reserve_units(db, &clock, "a", product.id, 3).await?;
        let r3 = reserve_units(db, &clock, "a", product.id, 1).await?;
        let r4 = reserve_units(db, &clock, "a", product.id, 4).await?;

        let first = ready(db, &clock, &settings, &ready_request(r1.id, "k1")).await?;
        let second = ready(db, &clock, &settings, &ready_request(r2.id, "k2")).await?;
        pay(db, &clock, first.id).await?;
        pay(db, &clock, second.id).await?;
        crate::core::delivery::start_delivery(db, &clock, first.id, 15).await?;
        complete_delivery(db, &clock, first.id).await?;

        lifecycle::mark_picked(db, &clock, r3.id).await?;
        lifecycle::cancel(db, &clock, &settings, Actor::Customer("a"), r4.id).await?;
        Ok((product.id, second.id))
    }

    #[tokio::test]
    async fn test_aggregates_closed_day() -> Result<()> {
        let db = setup_test_db().await?;
        let (product_id, unconfirmed) = seed_day(&db).await?;
        let (_fixed, clock) = test_clock("2024-05-02 03:00");
        let settings = Settings::default();

        let report = run_daily_aggregation(&db, &clock, &settings).await?;
        assert_eq!(report.business_date, date("2024-05-01"));
        assert_eq!(report.claimed, 5);
        assert_eq!(report.finished, 5);
        assert_eq!(report.auto_completed, 1);
        assert_eq!(get_order(&db, unconfirmed).await?.status, DeliveryStatus::Delivered);

        let delivery = delivery_row(&db, date("2024-05-01")).await?;
        assert_eq!(delivery.order_count, 2);
        assert_eq!(delivery.quantity, 5);
        assert_eq!(delivery.amount, 50_000);
        assert_eq!(delivery.delivery_fee, 5_800);

        let products = product_rows(&db).await?;
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].product_id, product_id);
        assert_eq!((products[0].quantity, products[0].amount), (6, 60_000));
        Ok(())
    }

    #[tokio::test]
    async fn test_second_run_changes_nothing() -> Result<()> {
        let db = setup_test_db().await?;
        seed_day(&db).await?;
        let (fixed, clock) = test_clock("2024-05-02 03:00");
        let settings = Settings::default();

        run_daily_aggregation(&db, &clock, &settings).await?;
        let products = product_rows(&db).await?;
        let delivery = delivery_row(&db, date("2024-05-01")).await?;

        set_local(&fixed, "2024-05-02 04:00");
        let again = run_daily_aggregation(&db, &clock, &settings).await?;
        assert_eq!(again.marked, 0);
        assert_eq!(again.claimed, 0);
        assert!(again.batch_uid.is_none());
        assert_eq!(product_rows(&db).await?, products);
        assert_eq!(delivery_row(&db, date("2024-05-01")).await?, delivery);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_runs_claim_disjoint_rows() -> Result<()> {
        init_test_tracing();
        let db = setup_test_db().await?;
        seed_day(&db).await?;
        let (_fixed, clock) = test_clock("2024-05-02 03:00");
        let settings = Settings::default();
        let day = date("2024-05-01");

        let (a, b) = tokio::join!(
            aggregate_business_date(&db, &clock, &settings, day),
            aggregate_business_date(&db, &clock, &settings, day)
        );
        let (a, b) = (a?, b?);
        assert_eq!(a.claimed + b.claimed, 5);
        assert!(a.claimed == 0 || b.claimed == 0);
        assert_eq!(delivery_row(&db, day).await?.quantity, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_claim_is_taken_over() -> Result<()> {
        init_test_tracing();
        let db = setup_test_db().await?;
        let (_fixed, clock) = test_clock("2024-05-01 10:00");
        let settings = Settings::default();
        create_test_user(&db, "a").await?;
        let product = create_test_product(&db, date("2024-05-01"), 1_000, 5).await?;
        let picked = reserve_units(&db, &clock, "a", product.id, 2).await?;
        lifecycle::mark_picked(&db, &clock, picked.id).await?;

        // A run that claimed the row and died before finishing.
        agg_applied::ActiveModel {
            reservation_id: Set(picked.id),
            phase: Set(AggPhase::ProductSales),
            business_date: Set(date("2024-05-01")),
            batch_uid: Set(Some("crashed".to_string())),
            claimed_at: Set(Some(local("2024-05-02 02:50"))),
            processed_at: Set(None),
            created_at: Set(local("2024-05-02 02:50")),
            ..Default::default()
        }
        .insert(&db)
        .await?;

        let (fixed, clock) = test_clock("2024-05-02 03:00");
        let fresh = run_daily_aggregation(&db, &clock, &settings).await?;
        assert_eq!(fresh.claimed, 0);

        set_local(&fixed, "2024-05-02 03:30");
        let takeover = run_daily_aggregation(&db, &clock, &settings).await?;
        assert_eq!(takeover.claimed, 1);
        assert_eq!(takeover.finished, 1);
        let products = product_rows(&db).await?;
        assert_eq!((products[0].quantity, products[0].amount), (2, 2_000));

        let row = AggApplied::find().one(&db).await?.unwrap();
        assert_eq!(row.batch_uid, takeover.batch_uid);
        assert!(row.processed_at.is_some());
        Ok(())
    }

    /// Counter pickups on 2024-05-01, one reservation per quantity, at 1 000 won a unit.
    async fn seed_pickups(db: &DatabaseConnection, quantities: &[i32]) -> Result<Vec<i64>> {
        let (_fixed, clock) = test_clock("2024-05-01 10:00");
        let settings = Settings::default();
        create_test_user(db, "a").await?;
        let product = create_test_product(db, date("2024-05-01"), 1_000, 50).await?;
        let mut ids = Vec::new();
        for &qty in quantities {
            let request = reserve_request("a", product.id, qty);
            let r = lifecycle::reserve(db, &clock, &settings, &request).await?;
            lifecycle::mark_picked(db, &clock, r.id).await?;
            ids.push(r.id);
        }
        Ok(ids)
    }

    #[tokio::test]
    async fn test_failed_run_releases_claim_for_immediate_retry() -> Result<()> {
        init_test_tracing();
        let db = setup_test_db().await?;
        seed_pickups(&db, &[2]).await?;
        let (_fixed, clock) = test_clock("2024-05-02 03:00");
        let settings = Settings::default();

        db.execute_unprepared("ALTER TABLE product_daily_agg RENAME TO product_daily_agg_parked")
            .await?;
        let failed = run_daily_aggregation(&db, &clock, &settings).await;
        assert!(failed.is_err());
        db.execute_unprepared("ALTER TABLE product_daily_agg_parked RENAME TO product_daily_agg")
            .await?;

        let row = AggApplied::find().one(&db).await?.unwrap();
        assert!(row.batch_uid.is_none());
        assert!(row.claimed_at.is_none());
        assert!(row.processed_at.is_none());

        // Same instant: the claim must not look like it belongs to a live run.
        let retry = run_daily_aggregation(&db, &clock, &settings).await?;
        assert_eq!(retry.claimed, 1);
        assert_eq!(retry.finished, 1);
        let products = product_rows(&db).await?;
        assert_eq!(products.len(), 1);
        assert_eq!((products[0].quantity, products[0].amount), (2, 2_000));
        Ok(())
    }

    #[tokio::test]
    async fn test_finish_count_mismatch_is_consistency_error() -> Result<()> {
        let db = setup_test_db().await?;
        let ids = seed_pickups(&db, &[1, 3]).await?;
        let day = date("2024-05-01");
        let now = local("2024-05-02 03:00");

        assert_eq!(mark_eligible(&db, day, now).await?, 2);
        let claimed = claim(&db, day, "batch-a", now, now - Duration::minutes(30)).await?;
        assert_eq!(claimed, 2);

        // Another writer finishes one of the rows behind the batch's back.
        AggApplied::update_many()
            .set(agg_applied::ActiveModel {
                processed_at: Set(Some(now)),
                ..Default::default()
            })
            .filter(agg_applied::Column::ReservationId.eq(ids[0]))
            .exec(&db)
            .await?;

        let mut report = AggregationReport {
            business_date: day,
            batch_uid: Some("batch-a".to_string()),
            claimed,
            ..Default::default()
        };
        let err = apply_batch(&db, "batch-a", now, &mut report).await.unwrap_err();
        assert!(matches!(err, Error::Consistency { .. }));
        assert!(!err.is_retryable());
        assert_eq!(report.finished, 1);
        assert!(product_rows(&db).await?.is_empty(), "upserts must roll back");

        release_claim(&db, "batch-a").await;
        let rows = AggApplied::find().all(&db).await?;
        let open: Vec<_> = rows.iter().filter(|row| row.processed_at.is_none()).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].reservation_id, ids[1]);
        assert!(open[0].batch_uid.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_before_close_targets_previous_day() -> Result<()> {
        let db = setup_test_db().await?;
        seed_day(&db).await?;
        let (_fixed, clock) = test_clock("2024-05-02 01:30");

        let report = run_daily_aggregation(&db, &clock, &Settings::default()).await?;
        assert_eq!(report.business_date, date("2024-04-30"));
        assert_eq!(report.claimed, 0);
        assert!(product_rows(&db).await?.is_empty());
        Ok(())
    }
}
