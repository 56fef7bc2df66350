//! Delivery orders: grouping a customer's same-day reservations into one paid delivery.
//!
//! Allowed transitions live on [`DeliveryStatus::allowed_from`]. Every transition is a
//! conditional update on the status read under lock, so a stale writer gets a concurrency error
//! instead of overwriting a newer status.
//!
//! Reservations stay `PENDING` while their order is in flight. Completing the delivery marks
//! them `PICKED`; failing or cancelling it releases them for pickup or a fresh order.

use crate::{
    config::{Settings, settings::DeliverySettings},
    core::{
        clock::BusinessClock,
        code,
        deadline::HourMinute,
        notify::{self, templates},
        reservation::Actor,
        user,
    },
    entities::{
        DeliveryOrder, DeliveryOrderItem, DeliveryStatus, Product, Reservation, ReservationStatus,
        delivery_order, delivery_order_item, product, reservation,
    },
    errors::{Error, Result},
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use sea_orm::{ActiveEnum, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait, prelude::*};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two `(latitude, longitude)` points in degrees.
#[must_use]
pub fn distance_km(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lat2) = (from.0.to_radians(), to.0.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (to.1 - from.1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

/// Delivery fee in won for a distance.
///
/// Flat `fee_near` up to `near_distance_km`, then `fee_per_100m` for every started 100 m beyond.
/// Distances are rounded to whole meters first.
///
/// # Errors
/// Returns a validation error beyond `max_distance_km` or for a non-finite distance.
#[allow(clippy::cast_possible_truncation)]
pub fn delivery_fee(distance_km: f64, rules: &DeliverySettings) -> Result<i64> {
    if !distance_km.is_finite() || distance_km < 0.0 {
        return Err(Error::validation(format!("Invalid distance {distance_km}")));
    }
    if distance_km > rules.max_distance_km {
        return Err(Error::validation(format!(
            "Address is {distance_km:.2} km away; deliveries reach {} km",
            rules.max_distance_km
        )));
    }
    let meters = (distance_km * 1000.0).round() as i64;
    let near_meters = (rules.near_distance_km * 1000.0).round() as i64;
    if meters <= near_meters {
        return Ok(rules.fee_near);
    }
    let steps = (meters - near_meters + 99) / 100;
    Ok(rules.fee_near + steps * rules.fee_per_100m)
}

/// Validates the requested slot and returns the slot the order is booked for.
///
/// `None` asks for immediate delivery, which is booked at the current business-relative time
/// and must fall inside the delivery window. A scheduled slot must sit on the slot
/// granularity, between the hour after opening and closing, at least `lead_minutes` ahead, and
/// be requested before the cutoff `end - lead_minutes`.
pub fn validate_slot(
    now: NaiveDateTime,
    business_date: NaiveDate,
    requested: Option<HourMinute>,
    rules: &DeliverySettings,
) -> Result<HourMinute> {
    let current = HourMinute::of(business_date, now);
    let Some(slot) = requested else {
        if current < rules.start || current >= rules.end {
            return Err(Error::validation(format!(
                "Immediate delivery runs from {} to {}",
                rules.start, rules.end
            )));
        }
        return Ok(current);
    };

    let lead = i64::from(rules.lead_minutes);
    if slot.minute >= 60 || slot.minute % rules.slot_granularity_minutes != 0 {
        return Err(Error::validation(format!(
            "Slot {slot} is not on a {}-minute boundary",
            rules.slot_granularity_minutes
        )));
    }
    if slot.hour < rules.start.hour + 1 || slot.hour > rules.end.hour || slot > rules.end {
        return Err(Error::validation(format!(
            "Slot {slot} is outside {:02}:00-{}",
            rules.start.hour + 1,
            rules.end
        )));
    }
    if current.total_minutes() >= rules.end.total_minutes() - lead {
        return Err(Error::validation(format!(
            "Scheduled deliveries close {lead} minutes before {}",
            rules.end
        )));
    }
    if slot.total_minutes() - current.total_minutes() < lead {
        return Err(Error::validation(format!(
            "Slot {slot} must be at least {lead} minutes from now ({current})"
        )));
    }
    Ok(slot)
}

/// Input for [`ready`].
#[derive(Debug, Clone)]
pub struct ReadyRequest {
    pub user_uid: String,
    pub reservation_ids: Vec<i64>,
    /// Client token; a repeated request with the same token returns the first order
    pub idempotency_key: String,
    /// `None` for immediate delivery
    pub slot: Option<HourMinute>,
    pub latitude: f64,
    pub longitude: f64,
}

/// Payment gateway callback.
#[derive(Debug, Clone)]
pub struct PaymentCallback {
    pub order_id: i64,
    pub success: bool,
    pub transaction_id: String,
}

/// Retrieves a delivery order by id.
pub async fn get_order<C>(conn: &C, order_id: i64) -> Result<delivery_order::Model>
where
    C: ConnectionTrait,
{
    DeliveryOrder::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| Error::not_found("DeliveryOrder", order_id))
}

async fn lock_order<C>(conn: &C, order_id: i64) -> Result<delivery_order::Model>
where
    C: ConnectionTrait,
{
    DeliveryOrder::find_by_id(order_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| Error::not_found("DeliveryOrder", order_id))
}

async fn find_by_key<C>(conn: &C, uid: &str, key: &str) -> Result<Option<delivery_order::Model>>
where
    C: ConnectionTrait,
{
    DeliveryOrder::find()
        .filter(delivery_order::Column::UserUid.eq(uid))
        .filter(delivery_order::Column::IdempotencyKey.eq(key))
        .one(conn)
        .await
        .map_err(Into::into)
}

/// Reservation ids carried by an order.
pub async fn order_reservation_ids<C>(conn: &C, order_id: i64) -> Result<Vec<i64>>
where
    C: ConnectionTrait,
{
    Ok(DeliveryOrderItem::find()
        .filter(delivery_order_item::Column::DeliveryOrderId.eq(order_id))
        .order_by_asc(delivery_order_item::Column::ReservationId)
        .all(conn)
        .await?
        .into_iter()
        .map(|item| item.reservation_id)
        .collect())
}

/// Active orders carrying any of `reservation_ids`, as `(reservation_id, order)` pairs.
pub async fn linked_active_orders<C>(
    conn: &C,
    reservation_ids: &[i64],
) -> Result<Vec<(i64, delivery_order::Model)>>
where
    C: ConnectionTrait,
{
    if reservation_ids.is_empty() {
        return Ok(Vec::new());
    }
    let items = DeliveryOrderItem::find()
        .filter(delivery_order_item::Column::ReservationId.is_in(reservation_ids.iter().copied()))
        .all(conn)
        .await?;
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let order_ids: HashSet<i64> = items.iter().map(|item| item.delivery_order_id).collect();
    let orders: HashMap<i64, delivery_order::Model> = DeliveryOrder::find()
        .filter(delivery_order::Column::Id.is_in(order_ids))
        .filter(delivery_order::Column::Status.is_in(DeliveryStatus::ACTIVE))
        .all(conn)
        .await?
        .into_iter()
        .map(|order| (order.id, order))
        .collect();

    Ok(items
        .into_iter()
        .filter_map(|item| {
            orders
                .get(&item.delivery_order_id)
                .map(|order| (item.reservation_id, order.clone()))
        })
        .collect())
}

fn check_transition(order: &delivery_order::Model, to: DeliveryStatus) -> Result<()> {
    if order.status.can_transition_to(to) {
        return Ok(());
    }
    let required = to
        .allowed_from()
        .iter()
        .map(|status| status.to_value())
        .collect::<Vec<_>>();
    Err(Error::InvalidTransition {
        entity: "delivery order",
        from: order.status.to_value(),
        to: to.to_value(),
        required: if required.is_empty() {
            "nothing (creation only)".to_string()
        } else {
            required.join(" or ")
        },
    })
}

/// Moves `order` to `to`, applying `extra` column changes in the same statement.
async fn transition<C, F>(
    conn: &C,
    order: &delivery_order::Model,
    to: DeliveryStatus,
    now: NaiveDateTime,
    extra: F,
) -> Result<()>
where
    C: ConnectionTrait,
    F: FnOnce(&mut delivery_order::ActiveModel),
{
    check_transition(order, to)?;
    let mut changes = delivery_order::ActiveModel {
        status: Set(to),
        status_changed_at: Set(now),
        ..Default::default()
    };
    extra(&mut changes);
    let updated = DeliveryOrder::update_many()
        .set(changes)
        .filter(delivery_order::Column::Id.eq(order.id))
        .filter(delivery_order::Column::Status.eq(order.status))
        .exec(conn)
        .await?
        .rows_affected;
    if updated != 1 {
        return Err(Error::concurrency(format!(
            "Delivery order {} changed while moving to {}",
            order.display_code,
            to.to_value()
        )));
    }
    debug!(order = %order.display_code, from = ?order.status, ?to, "delivery order transition");
    Ok(())
}

/// Cancels an unpaid order as part of a reservation change in the caller's transaction.
pub(crate) async fn cancel_unpaid_order<C>(
    conn: &C,
    order: &delivery_order::Model,
    now: NaiveDateTime,
) -> Result<()>
where
    C: ConnectionTrait,
{
    if order.status != DeliveryStatus::PendingPayment {
        return Err(Error::validation(format!(
            "Delivery order {} is already {}",
            order.display_code,
            order.status.to_value()
        )));
    }
    transition(conn, order, DeliveryStatus::Canceled, now, |_| {}).await?;
    info!(order = %order.display_code, "unpaid delivery order canceled with its reservation");
    Ok(())
}

/// Creates a delivery order for a set of the caller's pending reservations.
///
/// Replaying a request with an idempotency key the user already used returns the existing
/// order unchanged, even if the rest of the request differs.
///
/// # Errors
/// Returns a validation error if the user is restricted; any reservation is missing, foreign,
/// not pending, not for today, not deliverable, or already on an active order; the slot is
/// invalid; the total is under the minimum amount; or the address is out of range.
pub async fn ready(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    settings: &Settings,
    request: &ReadyRequest,
) -> Result<delivery_order::Model> {
    let key = request.idempotency_key.trim();
    if key.is_empty() {
        return Err(Error::validation("Idempotency key cannot be empty"));
    }
    if let Some(existing) = find_by_key(db, &request.user_uid, key).await? {
        info!(order = %existing.display_code, key, "delivery request replayed");
        return Ok(existing);
    }
    let mut ids = request.reservation_ids.clone();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Err(Error::validation("A delivery needs at least one reservation"));
    }

    let rules = &settings.delivery;
    let now = clock.now_local();
    let business_date = clock.business_date(settings.business.day_close);

    let txn = db.begin().await?;
    let customer = user::lock_user(&txn, &request.user_uid).await?;
    user::ensure_not_restricted(&customer, business_date)?;
    if let Some(existing) = find_by_key(&txn, &customer.uid, key).await? {
        return Ok(existing);
    }

    let reservations = Reservation::find()
        .filter(reservation::Column::Id.is_in(ids.iter().copied()))
        .order_by_asc(reservation::Column::Id)
        .lock_exclusive()
        .all(&txn)
        .await?;
    if let Some(missing) = ids
        .iter()
        .find(|id| !reservations.iter().any(|r| r.id == **id))
    {
        return Err(Error::not_found("Reservation", missing));
    }
    for r in &reservations {
        if r.user_uid != customer.uid {
            return Err(Error::validation(format!(
                "Reservation {} does not belong to user {}",
                r.display_code, customer.uid
            )));
        }
        if r.status != ReservationStatus::Pending {
            return Err(Error::validation(format!(
                "Reservation {} is {}",
                r.display_code,
                r.status.to_value()
            )));
        }
        if r.pickup_date != business_date {
            return Err(Error::validation(format!(
                "Reservation {} is for {}, not today ({business_date})",
                r.display_code, r.pickup_date
            )));
        }
    }

    let product_ids: HashSet<i64> = reservations.iter().map(|r| r.product_id).collect();
    let undeliverable = Product::find()
        .filter(product::Column::Id.is_in(product_ids))
        .filter(product::Column::DeliveryAvailable.eq(false))
        .one(&txn)
        .await?;
    if let Some(p) = undeliverable {
        return Err(Error::validation(format!("{} cannot be delivered", p.name)));
    }
    if let Some((reservation_id, order)) = linked_active_orders(&txn, &ids).await?.first() {
        return Err(Error::validation(format!(
            "Reservation {reservation_id} is already on delivery order {}",
            order.display_code
        )));
    }

    let amount: i64 = reservations.iter().map(|r| r.amount).sum();
    if amount < rules.min_order_amount {
        return Err(Error::validation(format!(
            "Delivery needs at least {} won, got {amount}",
            rules.min_order_amount
        )));
    }
    let slot = validate_slot(now, business_date, request.slot, rules)?;
    let distance = distance_km(
        (rules.store_latitude, rules.store_longitude),
        (request.latitude, request.longitude),
    );
    let fee = delivery_fee(distance, rules)?;

    let order = delivery_order::ActiveModel {
        display_code: Set(code::unique_code::<DeliveryOrder, _>(
            &txn,
            delivery_order::Column::DisplayCode,
            code::DELIVERY_PREFIX,
            now,
        )
        .await?),
        user_uid: Set(customer.uid.clone()),
        status: Set(DeliveryStatus::PendingPayment),
        delivery_date: Set(business_date),
        delivery_hour: Set(i32::try_from(slot.hour).unwrap_or(i32::MAX)),
        delivery_minute: Set(i32::try_from(slot.minute).unwrap_or(0)),
        scheduled: Set(request.slot.is_some()),
        latitude: Set(request.latitude),
        longitude: Set(request.longitude),
        distance_km: Set(distance),
        delivery_fee: Set(fee),
        amount: Set(amount),
        idempotency_key: Set(key.to_string()),
        payment_tx_id: Set(None),
        accepted_at: Set(None),
        estimated_minutes: Set(None),
        status_changed_at: Set(now),
        created_at: Set(now),
        ..Default::default()
    };
    let created = match order.insert(&txn).await {
        Ok(created) => created,
        Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
            // Lost a race with the same key; the winner's order is the answer.
            drop(txn);
            return match find_by_key(db, &request.user_uid, key).await? {
                Some(existing) => Ok(existing),
                None => Err(err.into()),
            };
        }
        Err(err) => return Err(err.into()),
    };

    let items = reservations.iter().map(|r| delivery_order_item::ActiveModel {
        delivery_order_id: Set(created.id),
        reservation_id: Set(r.id),
        ..Default::default()
    });
    DeliveryOrderItem::insert_many(items)
        .exec_without_returning(&txn)
        .await?;
    txn.commit().await?;

    info!(
        order = %created.display_code,
        user = %created.user_uid,
        reservations = reservations.len(),
        amount,
        fee,
        distance_km = format_args!("{distance:.3}"),
        "delivery order created"
    );
    Ok(created)
}

/// Applies a payment gateway callback.
///
/// Idempotent by order id: a repeated callback for an order already in the resulting state
/// returns it unchanged.
pub async fn apply_payment_result(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    callback: &PaymentCallback,
) -> Result<delivery_order::Model> {
    let now = clock.now_local();
    let target = if callback.success {
        DeliveryStatus::Paid
    } else {
        DeliveryStatus::Failed
    };

    let txn = db.begin().await?;
    let order = lock_order(&txn, callback.order_id).await?;
    let already_applied = order.status == target
        || (callback.success && DeliveryStatus::SETTLED.contains(&order.status));
    if already_applied {
        if callback.success
            && order.payment_tx_id.as_deref() != Some(callback.transaction_id.as_str())
        {
            warn!(
                order = %order.display_code,
                recorded = ?order.payment_tx_id,
                received = %callback.transaction_id,
                "duplicate payment callback with a different transaction id"
            );
        }
        return Ok(order);
    }

    let tx_id = callback.transaction_id.clone();
    transition(&txn, &order, target, now, |changes| {
        if callback.success {
            changes.payment_tx_id = Set(Some(tx_id));
        }
    })
    .await?;
    if callback.success {
        notify::enqueue(
            &txn,
            now,
            templates::DELIVERY_PAID,
            &order.user_uid,
            &json!({
                "code": order.display_code,
                "amount": order.amount,
                "delivery_fee": order.delivery_fee,
            }),
        )
        .await?;
    }
    txn.commit().await?;

    info!(order = %order.display_code, success = callback.success, "payment result applied");
    get_order(db, callback.order_id).await
}

/// Hands a paid order to a courier.
pub async fn start_delivery(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    order_id: i64,
    estimated_minutes: i32,
) -> Result<delivery_order::Model> {
    if estimated_minutes <= 0 {
        return Err(Error::validation(format!(
            "Estimated minutes must be positive, got {estimated_minutes}"
        )));
    }
    let now = clock.now_local();
    let txn = db.begin().await?;
    let order = lock_order(&txn, order_id).await?;
    transition(&txn, &order, DeliveryStatus::OutForDelivery, now, |changes| {
        changes.accepted_at = Set(Some(now));
        changes.estimated_minutes = Set(Some(estimated_minutes));
    })
    .await?;
    notify::enqueue(
        &txn,
        now,
        templates::DELIVERY_STARTED,
        &order.user_uid,
        &json!({ "code": order.display_code, "estimated_minutes": estimated_minutes }),
    )
    .await?;
    txn.commit().await?;

    info!(order = %order.display_code, estimated_minutes, "delivery started");
    get_order(db, order_id).await
}

async fn pick_up_reservations<C>(
    conn: &C,
    reservation_ids: Vec<i64>,
    now: NaiveDateTime,
) -> Result<u64>
where
    C: ConnectionTrait,
{
    if reservation_ids.is_empty() {
        return Ok(0);
    }
    Ok(Reservation::update_many()
        .set(reservation::ActiveModel {
            status: Set(ReservationStatus::Picked),
            status_changed_at: Set(now),
            ..Default::default()
        })
        .filter(reservation::Column::Id.is_in(reservation_ids))
        .filter(reservation::Column::Status.eq(ReservationStatus::Pending))
        .exec(conn)
        .await?
        .rows_affected)
}

/// Confirms delivery; the carried reservations become `PICKED`.
pub async fn complete_delivery(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    order_id: i64,
) -> Result<delivery_order::Model> {
    let now = clock.now_local();
    let txn = db.begin().await?;
    let order = lock_order(&txn, order_id).await?;
    transition(&txn, &order, DeliveryStatus::Delivered, now, |_| {}).await?;
    let reservation_ids = order_reservation_ids(&txn, order.id).await?;
    let picked = pick_up_reservations(&txn, reservation_ids, now).await?;
    txn.commit().await?;

    info!(order = %order.display_code, picked, "delivery completed");
    get_order(db, order_id).await
}

/// Cancels a delivery order. The reservations stay pending and can be picked up or cancelled.
///
/// Customers may cancel their own orders until they leave the store; admins may also cancel
/// orders that are out for delivery.
pub async fn cancel_delivery(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    actor: Actor<'_>,
    order_id: i64,
) -> Result<delivery_order::Model> {
    let now = clock.now_local();
    let txn = db.begin().await?;
    let order = lock_order(&txn, order_id).await?;
    if let Actor::Customer(uid) = actor {
        if uid != order.user_uid {
            return Err(Error::validation(format!(
                "Delivery order {} does not belong to user {uid}",
                order.display_code
            )));
        }
        if order.status == DeliveryStatus::OutForDelivery {
            return Err(Error::validation(format!(
                "Delivery order {} is already on its way",
                order.display_code
            )));
        }
    }
    transition(&txn, &order, DeliveryStatus::Canceled, now, |_| {}).await?;
    txn.commit().await?;

    info!(order = %order.display_code, ?actor, "delivery order canceled");
    get_order(db, order_id).await
}

/// Fails unpaid orders older than the payment expiry window. Returns the number failed.
#[tracing::instrument(skip_all, name = "payment_expiry")]
pub async fn expire_pending_payments(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    settings: &Settings,
) -> Result<u64> {
    let now = clock.now_local();
    let cutoff = now - Duration::minutes(settings.delivery.payment_expiry_minutes);
    let expired = DeliveryOrder::update_many()
        .set(delivery_order::ActiveModel {
            status: Set(DeliveryStatus::Failed),
            status_changed_at: Set(now),
            ..Default::default()
        })
        .filter(delivery_order::Column::Status.eq(DeliveryStatus::PendingPayment))
        .filter(delivery_order::Column::CreatedAt.lt(cutoff))
        .exec(db)
        .await?
        .rows_affected;
    if expired > 0 {
        info!(expired, %cutoff, "unpaid delivery orders failed");
    }
    Ok(expired)
}

/// Forces paid orders of a closed business date to `DELIVERED` and marks their reservations
/// `PICKED`. Unpaid orders are left for the expiry sweep. Returns the number of orders
/// completed.
pub async fn complete_open_orders_for_date<C>(
    conn: &C,
    business_date: NaiveDate,
    now: NaiveDateTime,
) -> Result<u64>
where
    C: ConnectionTrait,
{
    let open = [DeliveryStatus::Paid, DeliveryStatus::OutForDelivery];
    let order_ids: Vec<i64> = DeliveryOrder::find()
        .filter(delivery_order::Column::DeliveryDate.eq(business_date))
        .filter(delivery_order::Column::Status.is_in(open))
        .all(conn)
        .await?
        .into_iter()
        .map(|order| order.id)
        .collect();
    if order_ids.is_empty() {
        return Ok(0);
    }

    let completed = DeliveryOrder::update_many()
        .set(delivery_order::ActiveModel {
            status: Set(DeliveryStatus::Delivered),
            status_changed_at: Set(now),
            ..Default::default()
        })
        .filter(delivery_order::Column::Id.is_in(order_ids.iter().copied()))
        .filter(delivery_order::Column::Status.is_in(open))
        .exec(conn)
        .await?
        .rows_affected;

    let reservation_ids: Vec<i64> = DeliveryOrderItem::find()
        .filter(delivery_order_item::Column::DeliveryOrderId.is_in(order_ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|item| item.reservation_id)
        .collect();
    let picked = pick_up_reservations(conn, reservation_ids, now).await?;

    info!(%business_date, completed, picked, "open delivery orders auto-completed");
    Ok(completed)
}
