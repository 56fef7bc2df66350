//! Product entity - a limited-stock item sold on one business date.
//!
//! `stock` is the number of units still available for reservation. It is only ever mutated
//! inside a transaction that holds the product row lock (see `core::product`).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Product database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    /// Unique identifier for the product
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Display name
    pub name: String,
    /// Current unit price in won; reservations snapshot it at reservation time
    pub price: i64,
    /// Units still available, never negative
    pub stock: i32,
    /// Business date on which the product is sold and picked up
    pub sell_date: Date,
    /// Earliest time of day reservations open, if restricted
    pub sell_time: Option<Time>,
    /// Hidden products cannot be reserved
    pub visible: bool,
    /// Whether reservations of this product may be delivered
    pub delivery_available: bool,
    /// Soft delete flag; products are never hard-deleted while reservations reference them
    pub is_deleted: bool,
    /// When the product was created
    pub created_at: DateTime,
    /// When the product was last modified
    pub updated_at: DateTime,
}

/// Defines relationships between Product and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One product has many reservations
    #[sea_orm(has_many = "super::reservation::Entity")]
    Reservations,
}

impl Related<super::reservation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Reservations.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
