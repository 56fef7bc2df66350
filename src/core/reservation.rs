//! Reservation lifecycle.
//!
//! `PENDING -> {CANCELED, PICKED, NO_SHOW}`; every state other than `PENDING` is terminal.
//! Each transition runs in one transaction together with its stock and user-statistics
//! effects. Rows are locked in a fixed order, user first, then reservation, then product, so
//! interactive operations and the no-show batch cannot deadlock against each other.
//!
//! Status changes are written with a conditional `UPDATE ... WHERE status = 'PENDING'`; losing
//! that race to another writer surfaces as a concurrency error instead of a double transition.

use crate::{
    config::Settings,
    core::{
        clock::BusinessClock,
        code, deadline, delivery,
        notify::{self, templates},
        product as stock, user,
    },
    entities::{DeliveryStatus, Reservation, ReservationStatus, reservation, user as user_entity},
    errors::{Error, Result},
};
use chrono::NaiveDateTime;
use sea_orm::{ActiveEnum, QuerySelect, Set, TransactionTrait, prelude::*};
use serde_json::json;
use tracing::info;

/// Who is asking for a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor<'a> {
    /// The customer with this uid; may only touch their own reservations
    Customer(&'a str),
    /// Staff; bypasses ownership checks but not deadlines
    Admin,
}

/// Input for [`reserve`].
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub user_uid: String,
    pub product_id: i64,
    pub quantity: i32,
}

/// Retrieves a reservation by id.
pub async fn get_reservation<C>(conn: &C, reservation_id: i64) -> Result<reservation::Model>
where
    C: ConnectionTrait,
{
    Reservation::find_by_id(reservation_id)
        .one(conn)
        .await?
        .ok_or_else(|| Error::not_found("Reservation", reservation_id))
}

async fn lock_reservation<C>(conn: &C, reservation_id: i64) -> Result<reservation::Model>
where
    C: ConnectionTrait,
{
    Reservation::find_by_id(reservation_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| Error::not_found("Reservation", reservation_id))
}

/// Locks the owning user and then the reservation, in that order.
async fn lock_with_owner<C>(
    conn: &C,
    reservation_id: i64,
) -> Result<(user_entity::Model, reservation::Model)>
where
    C: ConnectionTrait,
{
    let owner = get_reservation(conn, reservation_id).await?.user_uid;
    let customer = user::lock_user(conn, &owner).await?;
    let locked = lock_reservation(conn, reservation_id).await?;
    Ok((customer, locked))
}

fn ensure_owner(actor: Actor<'_>, r: &reservation::Model) -> Result<()> {
    match actor {
        Actor::Customer(uid) if uid != r.user_uid => Err(Error::validation(format!(
            "Reservation {} does not belong to user {uid}",
            r.display_code
        ))),
        _ => Ok(()),
    }
}

fn require_pending(r: &reservation::Model, to: ReservationStatus) -> Result<()> {
    if r.status == ReservationStatus::Pending {
        return Ok(());
    }
    Err(Error::InvalidTransition {
        entity: "reservation",
        from: r.status.to_value(),
        to: to.to_value(),
        required: ReservationStatus::Pending.to_value(),
    })
}

fn ensure_before_cancel_deadline(
    now: NaiveDateTime,
    r: &reservation::Model,
    settings: &Settings,
) -> Result<()> {
    let cutoff = settings.reservation.cancel_deadline;
    if deadline::is_after(now, r.pickup_date, cutoff) {
        return Err(Error::validation(format!(
            "Cancellation deadline {cutoff} on {} has passed",
            r.pickup_date
        )));
    }
    Ok(())
}

/// Moves a pending reservation to `to`, failing if another writer got there first.
async fn set_status<C>(
    conn: &C,
    r: &reservation::Model,
    to: ReservationStatus,
    now: NaiveDateTime,
) -> Result<()>
where
    C: ConnectionTrait,
{
    let updated = Reservation::update_many()
        .set(reservation::ActiveModel {
            status: Set(to),
            status_changed_at: Set(now),
            ..Default::default()
        })
        .filter(reservation::Column::Id.eq(r.id))
        .filter(reservation::Column::Status.eq(ReservationStatus::Pending))
        .exec(conn)
        .await?
        .rows_affected;
    if updated != 1 {
        return Err(Error::concurrency(format!(
            "Reservation {} changed while moving to {}",
            r.display_code,
            to.to_value()
        )));
    }
    Ok(())
}

/// Unpaid delivery orders carrying `r`. Fails if a paid order carries it, since those
/// reservations are handed over by delivery.
async fn unpaid_linked_orders<C>(
    conn: &C,
    r: &reservation::Model,
) -> Result<Vec<crate::entities::delivery_order::Model>>
where
    C: ConnectionTrait,
{
    let linked = delivery::linked_active_orders(conn, &[r.id]).await?;
    if let Some((_, order)) = linked
        .iter()
        .find(|(_, order)| DeliveryStatus::SETTLED.contains(&order.status))
    {
        return Err(Error::validation(format!(
            "Reservation {} is on delivery order {} ({}); cancel the delivery first",
            r.display_code,
            order.display_code,
            order.status.to_value()
        )));
    }
    Ok(linked.into_iter().map(|(_, order)| order).collect())
}

/// Reserves units of a product for its sell date.
///
/// # Errors
/// Returns a validation error if the quantity is not positive, the user has not set a name or
/// is restricted, the product is hidden or deleted, the reservation deadline has passed or
/// sales have not opened yet, or there is not enough stock.
pub async fn reserve(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    settings: &Settings,
    request: &ReserveRequest,
) -> Result<reservation::Model> {
    if request.quantity <= 0 {
        return Err(Error::validation(format!(
            "Quantity must be positive, got {}",
            request.quantity
        )));
    }
    let now = clock.now_local();
    let business_date = clock.business_date(settings.business.day_close);

    let txn = db.begin().await?;
    let customer = user::lock_user(&txn, &request.user_uid).await?;
    if !customer.change_name {
        return Err(Error::validation(
            "Set a display name before making the first reservation",
        ));
    }
    user::ensure_not_restricted(&customer, business_date)?;

    let product = stock::lock_product(&txn, request.product_id).await?;
    if product.is_deleted || !product.visible {
        return Err(Error::not_found("Product", request.product_id));
    }
    let cutoff = settings.reservation.deadline;
    if product.sell_date < business_date || deadline::is_after(now, product.sell_date, cutoff) {
        return Err(Error::validation(format!(
            "Reservations for {} closed at {cutoff} on {}",
            product.name, product.sell_date
        )));
    }
    if let Some(opens) = product.sell_time {
        if now < product.sell_date.and_time(opens) {
            return Err(Error::validation(format!(
                "Reservations for {} open at {opens}",
                product.name
            )));
        }
    }

    stock::reserve_stock(&txn, product.id, request.quantity).await?;

    let amount = i64::from(request.quantity) * product.price;
    let created = reservation::ActiveModel {
        display_code: Set(
            code::unique_code::<Reservation, _>(
                &txn,
                reservation::Column::DisplayCode,
                code::RESERVATION_PREFIX,
                now,
            )
            .await?,
        ),
        user_uid: Set(customer.uid.clone()),
        product_id: Set(product.id),
        quantity: Set(request.quantity),
        amount: Set(amount),
        sell_price: Set(product.price),
        pickup_date: Set(product.sell_date),
        status: Set(ReservationStatus::Pending),
        status_changed_at: Set(now),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    user::apply_order_delta(&txn, customer, i64::from(request.quantity), amount).await?;
    notify::enqueue(
        &txn,
        now,
        templates::RESERVATION_CREATED,
        &created.user_uid,
        &json!({
            "code": created.display_code,
            "product": product.name,
            "quantity": created.quantity,
            "amount": created.amount,
            "pickup_date": created.pickup_date.to_string(),
        }),
    )
    .await?;
    txn.commit().await?;

    info!(
        reservation = %created.display_code,
        user = %created.user_uid,
        product_id = created.product_id,
        quantity = created.quantity,
        "reservation created"
    );
    Ok(created)
}

/// Cancels a pending reservation, returning its units to stock and reversing user totals.
///
/// An unpaid delivery order carrying the reservation is cancelled with it; a paid one blocks
/// the cancellation.
pub async fn cancel(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    settings: &Settings,
    actor: Actor<'_>,
    reservation_id: i64,
) -> Result<reservation::Model> {
    let now = clock.now_local();
    let txn = db.begin().await?;
    let (customer, r) = lock_with_owner(&txn, reservation_id).await?;
    ensure_owner(actor, &r)?;
    require_pending(&r, ReservationStatus::Canceled)?;
    ensure_before_cancel_deadline(now, &r, settings)?;
    let unpaid = unpaid_linked_orders(&txn, &r).await?;

    set_status(&txn, &r, ReservationStatus::Canceled, now).await?;
    stock::restock(&txn, r.product_id, r.quantity).await?;
    user::apply_order_delta(&txn, customer, -i64::from(r.quantity), -r.amount).await?;
    for order in &unpaid {
        delivery::cancel_unpaid_order(&txn, order, now).await?;
    }
    notify::enqueue(
        &txn,
        now,
        templates::RESERVATION_CANCELED,
        &r.user_uid,
        &json!({ "code": r.display_code, "quantity": r.quantity }),
    )
    .await?;
    txn.commit().await?;

    info!(reservation = %r.display_code, ?actor, "reservation canceled");
    get_reservation(db, reservation_id).await
}

/// Cancels `delta` units of a pending reservation without changing its status.
///
/// # Errors
/// Returns a validation error unless `0 < delta < quantity`; removing every unit is a
/// cancellation. Reservations on an active delivery order cannot be reduced.
pub async fn minus_quantity(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    settings: &Settings,
    actor: Actor<'_>,
    reservation_id: i64,
    delta: i32,
) -> Result<reservation::Model> {
    let now = clock.now_local();
    let txn = db.begin().await?;
    let (customer, r) = lock_with_owner(&txn, reservation_id).await?;
    ensure_owner(actor, &r)?;
    require_pending(&r, ReservationStatus::Pending)?;
    if delta <= 0 || delta >= r.quantity {
        return Err(Error::validation(format!(
            "Can reduce reservation {} by 1 to {} units, got {delta}",
            r.display_code,
            r.quantity - 1
        )));
    }
    ensure_before_cancel_deadline(now, &r, settings)?;
    if !delivery::linked_active_orders(&txn, &[r.id]).await?.is_empty() {
        return Err(Error::validation(format!(
            "Reservation {} is on a delivery order and cannot be reduced",
            r.display_code
        )));
    }

    let quantity = r.quantity - delta;
    let amount = i64::from(quantity) * r.sell_price;
    let updated = Reservation::update_many()
        .set(reservation::ActiveModel {
            quantity: Set(quantity),
            amount: Set(amount),
            ..Default::default()
        })
        .filter(reservation::Column::Id.eq(r.id))
        .filter(reservation::Column::Status.eq(ReservationStatus::Pending))
        .filter(reservation::Column::Quantity.eq(r.quantity))
        .exec(&txn)
        .await?
        .rows_affected;
    if updated != 1 {
        return Err(Error::concurrency(format!(
            "Reservation {} changed while reducing quantity",
            r.display_code
        )));
    }
    stock::restock(&txn, r.product_id, delta).await?;
    user::apply_order_delta(
        &txn,
        customer,
        -i64::from(delta),
        -i64::from(delta) * r.sell_price,
    )
    .await?;
    txn.commit().await?;

    info!(reservation = %r.display_code, delta, quantity, "reservation reduced");
    get_reservation(db, reservation_id).await
}

/// Records that a pending reservation was handed over at the counter.
pub async fn mark_picked(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    reservation_id: i64,
) -> Result<reservation::Model> {
    let now = clock.now_local();
    let txn = db.begin().await?;
    let r = lock_reservation(&txn, reservation_id).await?;
    require_pending(&r, ReservationStatus::Picked)?;
    let unpaid = unpaid_linked_orders(&txn, &r).await?;

    set_status(&txn, &r, ReservationStatus::Picked, now).await?;
    for order in &unpaid {
        delivery::cancel_unpaid_order(&txn, order, now).await?;
    }
    txn.commit().await?;

    info!(reservation = %r.display_code, "reservation picked up");
    get_reservation(db, reservation_id).await
}

/// Marks one reservation as a no-show after its pickup deadline.
///
/// Returns the units to stock, reverses the owner's totals and applies a warning. The
/// scheduled batch in `core::no_show` does the same for a whole business date.
pub async fn mark_no_show(
    db: &DatabaseConnection,
    clock: &BusinessClock,
    settings: &Settings,
    reservation_id: i64,
) -> Result<reservation::Model> {
    let now = clock.now_local();
    let txn = db.begin().await?;
    let (customer, r) = lock_with_owner(&txn, reservation_id).await?;
    require_pending(&r, ReservationStatus::NoShow)?;
    let pickup = settings.reservation.pickup_deadline;
    if !deadline::is_after(now, r.pickup_date, pickup) {
        return Err(Error::validation(format!(
            "Pickup deadline {pickup} on {} has not passed",
            r.pickup_date
        )));
    }
    let unpaid = unpaid_linked_orders(&txn, &r).await?;

    set_status(&txn, &r, ReservationStatus::NoShow, now).await?;
    stock::restock(&txn, r.product_id, r.quantity).await?;
    user::record_no_show(
        &txn,
        customer,
        i64::from(r.quantity),
        r.amount,
        r.pickup_date,
        &settings.reservation,
    )
    .await?;
    for order in &unpaid {
        delivery::cancel_unpaid_order(&txn, order, now).await?;
    }
    notify::enqueue(
        &txn,
        now,
        templates::NO_SHOW_WARNING,
        &r.user_uid,
        &json!({ "codes": [r.display_code], "pickup_date": r.pickup_date.to_string() }),
    )
    .await?;
    txn.commit().await?;

    info!(reservation = %r.display_code, "reservation marked no-show");
    get_reservation(db, reservation_id).await
}
