//! Product business logic - catalogue management and the stock ledger.
//!
//! Stock is only changed through [`reserve_stock`] and [`restock`], both of which run inside the
//! caller's transaction. `reserve_stock` reads the product under an exclusive row lock and then
//! decrements with a conditional `UPDATE ... WHERE stock >= qty`, so two transactions can never
//! take the same unit even on a backend that ignores row locks.

use crate::{
    entities::{Product, product},
    errors::{Error, Result},
};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sea_orm::{QueryOrder, QuerySelect, Set, TransactionTrait, prelude::*, sea_query::Expr};
use tracing::{debug, info};

/// Input for [`create_product`].
#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub price: i64,
    pub stock: i32,
    pub sell_date: NaiveDate,
    pub sell_time: Option<NaiveTime>,
    pub visible: bool,
    pub delivery_available: bool,
}

/// Creates a product after validating its fields.
///
/// # Errors
/// Returns an error if:
/// - The name is empty or whitespace-only
/// - The price or stock is negative
/// - The database insert fails
pub async fn create_product(
    db: &DatabaseConnection,
    new: NewProduct,
    now: NaiveDateTime,
) -> Result<product::Model> {
    if new.name.trim().is_empty() {
        return Err(Error::validation("Product name cannot be empty"));
    }
    if new.price < 0 {
        return Err(Error::validation(format!("Price cannot be negative: {}", new.price)));
    }
    if new.stock < 0 {
        return Err(Error::validation(format!("Stock cannot be negative: {}", new.stock)));
    }

    let product = product::ActiveModel {
        name: Set(new.name.trim().to_string()),
        price: Set(new.price),
        stock: Set(new.stock),
        sell_date: Set(new.sell_date),
        sell_time: Set(new.sell_time),
        visible: Set(new.visible),
        delivery_available: Set(new.delivery_available),
        is_deleted: Set(false),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let created = product.insert(db).await?;
    info!(product_id = created.id, name = %created.name, stock = created.stock, "product created");
    Ok(created)
}

/// Retrieves a product by id, including soft-deleted ones.
pub async fn get_product<C>(conn: &C, product_id: i64) -> Result<product::Model>
where
    C: ConnectionTrait,
{
    Product::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| Error::not_found("Product", product_id))
}

/// Visible, non-deleted products on sale for `sell_date`, ordered by name.
pub async fn list_products_for_date(
    db: &DatabaseConnection,
    sell_date: NaiveDate,
) -> Result<Vec<product::Model>> {
    Product::find()
        .filter(product::Column::SellDate.eq(sell_date))
        .filter(product::Column::IsDeleted.eq(false))
        .filter(product::Column::Visible.eq(true))
        .order_by_asc(product::Column::Name)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Reads a product under an exclusive row lock.
pub async fn lock_product<C>(conn: &C, product_id: i64) -> Result<product::Model>
where
    C: ConnectionTrait,
{
    Product::find_by_id(product_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| Error::not_found("Product", product_id))
}

/// Takes `qty` units from stock.
///
/// # Errors
/// Returns `OutOfStock` if fewer than `qty` units remain.
pub async fn reserve_stock<C>(conn: &C, product_id: i64, qty: i32) -> Result<product::Model>
where
    C: ConnectionTrait,
{
    if qty <= 0 {
        return Err(Error::validation(format!("Quantity must be positive, got {qty}")));
    }
    let locked = lock_product(conn, product_id).await?;
    if locked.stock < qty {
        return Err(Error::OutOfStock {
            product_id,
            requested: qty,
            available: locked.stock,
        });
    }

    let updated = Product::update_many()
        .col_expr(product::Column::Stock, Expr::col(product::Column::Stock).sub(qty))
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::Stock.gte(qty))
        .exec(conn)
        .await?
        .rows_affected;
    if updated != 1 {
        let current = get_product(conn, product_id).await?;
        return Err(Error::OutOfStock {
            product_id,
            requested: qty,
            available: current.stock,
        });
    }

    debug!(product_id, qty, remaining = locked.stock - qty, "stock reserved");
    get_product(conn, product_id).await
}

/// Returns `qty` units to stock. The caller guarantees they came from a real reservation.
pub async fn restock<C>(conn: &C, product_id: i64, qty: i32) -> Result<()>
where
    C: ConnectionTrait,
{
    if qty <= 0 {
        return Err(Error::validation(format!("Restock quantity must be positive, got {qty}")));
    }
    let updated = Product::update_many()
        .col_expr(product::Column::Stock, Expr::col(product::Column::Stock).add(qty))
        .filter(product::Column::Id.eq(product_id))
        .exec(conn)
        .await?
        .rows_affected;
    if updated != 1 {
        return Err(Error::not_found("Product", product_id));
    }
    debug!(product_id, qty, "stock returned");
    Ok(())
}

async fn update_locked<F>(
    db: &DatabaseConnection,
    product_id: i64,
    now: NaiveDateTime,
    apply: F,
) -> Result<product::Model>
where
    F: FnOnce(&mut product::ActiveModel),
{
    let txn = db.begin().await?;
    let locked = lock_product(&txn, product_id).await?;
    if locked.is_deleted {
        return Err(Error::not_found("Product", product_id));
    }
    let mut active: product::ActiveModel = locked.into();
    apply(&mut active);
    active.updated_at = Set(now);
    let updated = active.update(&txn).await?;
    txn.commit().await?;
    Ok(updated)
}

/// Changes the price for future reservations; existing reservations keep their snapshot.
pub async fn update_price(
    db: &DatabaseConnection,
    product_id: i64,
    price: i64,
    now: NaiveDateTime,
) -> Result<product::Model> {
    if price < 0 {
        return Err(Error::validation(format!("Price cannot be negative: {price}")));
    }
    update_locked(db, product_id, now, |p| p.price = Set(price)).await
}

/// Sets the available stock after an admin count or delivery from the supplier.
pub async fn set_stock(
    db: &DatabaseConnection,
    product_id: i64,
    stock: i32,
    now: NaiveDateTime,
) -> Result<product::Model> {
    if stock < 0 {
        return Err(Error::validation(format!("Stock cannot be negative: {stock}")));
    }
    update_locked(db, product_id, now, |p| p.stock = Set(stock)).await
}

/// Shows or hides a product.
pub async fn set_visibility(
    db: &DatabaseConnection,
    product_id: i64,
    visible: bool,
    now: NaiveDateTime,
) -> Result<product::Model> {
    update_locked(db, product_id, now, |p| p.visible = Set(visible)).await
}

/// Soft deletes a product. Reservations keep referencing the row.
pub async fn delete_product(
    db: &DatabaseConnection,
    product_id: i64,
    now: NaiveDateTime,
) -> Result<product::Model> {
    update_locked(db, product_id, now, |p| {
        p.is_deleted = Set(true);
        p.visible = Set(false);
    })
    .await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::*;

    #[tokio::test]
    async fn test_create_product_validation() -> Result<()> {
        let db = setup_test_db().await?;
        let now = local("2024-05-01 09:00");

        let mut new = sample_product(date("2024-05-01"), 1000, 5);
        new.name = "   ".to_string();
        assert!(matches!(
            create_product(&db, new, now).await,
            Err(Error::Validation { .. })
        ));

        let new = sample_product(date("2024-05-01"), -1, 5);
        assert!(create_product(&db, new, now).await.is_err());

        let new = sample_product(date("2024-05-01"), 1000, -5);
        assert!(create_product(&db, new, now).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_reserve_and_restock() -> Result<()> {
        let db = setup_test_db().await?;
        let product = create_test_product(&db, date("2024-05-01"), 1000, 5).await?;

        let after = reserve_stock(&db, product.id, 3).await?;
        assert_eq!(after.stock, 2);

        let err = reserve_stock(&db, product.id, 3).await.unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfStock {
                requested: 3,
                available: 2,
                ..
            }
        ));

        restock(&db, product.id, 3).await?;
        assert_eq!(get_product(&db, product.id).await?.stock, 5);

        assert!(matches!(
            restock(&db, 9999, 1).await,
            Err(Error::NotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_admin_updates() -> Result<()> {
        let db = setup_test_db().await?;
        let now = local("2024-05-01 09:00");
        let product = create_test_product(&db, date("2024-05-01"), 1000, 5).await?;

        assert_eq!(update_price(&db, product.id, 1200, now).await?.price, 1200);
        assert_eq!(set_stock(&db, product.id, 9, now).await?.stock, 9);
        assert!(set_stock(&db, product.id, -1, now).await.is_err());
        assert!(!set_visibility(&db, product.id, false, now).await?.visible);
        assert!(list_products_for_date(&db, date("2024-05-01")).await?.is_empty());

        let deleted = delete_product(&db, product.id, now).await?;
        assert!(deleted.is_deleted);
        assert!(matches!(
            update_price(&db, product.id, 1, now).await,
            Err(Error::NotFound { .. })
        ));
        // Soft-deleted rows remain readable for reservation history.
        assert_eq!(get_product(&db, product.id).await?.id, product.id);
        Ok(())
    }
}
