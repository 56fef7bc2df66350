//! Database configuration module.
//!
//! Handles the database connection and table creation using `SeaORM`. Tables are generated from
//! the entity definitions with `Schema::create_table_from_entity`, so the schema always matches
//! the Rust structs. Composite unique keys, which entity attributes cannot express, are added
//! as separate indexes; the insert-ignore and upsert statements in `core` rely on them.

use crate::entities::{
    AggApplied, DeliveryDailyAgg, DeliveryOrder, DeliveryOrderItem, OutboxEvent, Product,
    ProductDailyAgg, Reservation, SystemState, User, agg_applied, delivery_order,
    delivery_order_item, product_daily_agg,
};
use crate::errors::Result;
use sea_orm::sea_query::{Index, IndexCreateStatement};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema};
use tracing::info;

const DEFAULT_DATABASE_URL: &str = "sqlite://data/sameday.sqlite?mode=rwc";

/// Gets the database URL from the environment or returns the default `SQLite` path.
#[must_use]
pub fn get_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string())
}

/// Establishes a connection to the database named by `DATABASE_URL`.
pub async fn create_connection() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new(get_database_url());
    options.sqlx_logging(false);
    Database::connect(options).await.map_err(Into::into)
}

fn unique_indexes() -> Vec<IndexCreateStatement> {
    vec![
        Index::create()
            .name("ux_agg_applied_reservation_phase")
            .table(AggApplied)
            .col(agg_applied::Column::ReservationId)
            .col(agg_applied::Column::Phase)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ux_product_daily_agg_product_date")
            .table(ProductDailyAgg)
            .col(product_daily_agg::Column::ProductId)
            .col(product_daily_agg::Column::SellDate)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ux_delivery_orders_user_key")
            .table(DeliveryOrder)
            .col(delivery_order::Column::UserUid)
            .col(delivery_order::Column::IdempotencyKey)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("ux_delivery_order_items_order_reservation")
            .table(DeliveryOrderItem)
            .col(delivery_order_item::Column::DeliveryOrderId)
            .col(delivery_order_item::Column::ReservationId)
            .unique()
            .if_not_exists()
            .to_owned(),
    ]
}

/// Creates all tables and unique indexes if they do not exist yet.
pub async fn create_tables<C>(db: &C) -> Result<()>
where
    C: ConnectionTrait,
{
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    // Parents before children so foreign keys resolve on every backend.
    let tables = [
        schema.create_table_from_entity(User).if_not_exists().to_owned(),
        schema.create_table_from_entity(Product).if_not_exists().to_owned(),
        schema.create_table_from_entity(Reservation).if_not_exists().to_owned(),
        schema.create_table_from_entity(DeliveryOrder).if_not_exists().to_owned(),
        schema.create_table_from_entity(DeliveryOrderItem).if_not_exists().to_owned(),
        schema.create_table_from_entity(AggApplied).if_not_exists().to_owned(),
        schema.create_table_from_entity(ProductDailyAgg).if_not_exists().to_owned(),
        schema.create_table_from_entity(DeliveryDailyAgg).if_not_exists().to_owned(),
        schema.create_table_from_entity(OutboxEvent).if_not_exists().to_owned(),
        schema.create_table_from_entity(SystemState).if_not_exists().to_owned(),
    ];
    for table in &tables {
        db.execute(builder.build(table)).await?;
    }

    for index in &unique_indexes() {
        db.execute(builder.build(index)).await?;
    }

    info!("Schema ready: {} tables", tables.len());
    Ok(())
}
