//! User entity - the subset of customer state the reservation lifecycle touches.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// User database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    /// External user identifier
    #[sea_orm(primary_key, auto_increment = false)]
    pub uid: String,
    /// Display name shown to staff at pickup
    pub name: String,
    /// Set once the user has chosen a real name; required before the first reservation
    pub change_name: bool,
    /// Net reserved quantity over all reservation events, clamped at zero
    pub total_orders: i64,
    /// Net reserved amount in won over all reservation events, clamped at zero
    pub total_revenue: i64,
    /// Spendable points
    pub point_balance: i64,
    /// No-shows in the current calendar month
    pub monthly_warn_count: i32,
    /// No-shows over the account lifetime
    pub total_warn_count: i32,
    /// Reservations and deliveries are refused through this business date
    pub restricted_until: Option<Date>,
    /// When the user was created
    pub created_at: DateTime,
}

/// Defines relationships between User and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One user has many reservations
    #[sea_orm(has_many = "super::reservation::Entity")]
    Reservations,
    /// One user has many delivery orders
    #[sea_orm(has_many = "super::delivery_order::Entity")]
    DeliveryOrders,
}

impl Related<super::reservation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Reservations.def()
    }
}

impl Related<super::delivery_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DeliveryOrders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
