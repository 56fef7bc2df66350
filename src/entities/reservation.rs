//! Reservation entity - a customer's hold on units of one product for one pickup date.
//!
//! `sell_price` is a snapshot of the product price at reservation time and never changes
//! afterwards; `amount` is always `quantity * sell_price`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Reservation lifecycle status. Every state other than `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ReservationStatus {
    /// Reserved, waiting for pickup or delivery
    #[sea_orm(string_value = "PENDING")]
    Pending,
    /// Handed over to the customer
    #[sea_orm(string_value = "PICKED")]
    Picked,
    /// Cancelled by the customer or an admin
    #[sea_orm(string_value = "CANCELED")]
    Canceled,
    /// Not picked up before the pickup deadline
    #[sea_orm(string_value = "NO_SHOW")]
    NoShow,
}

impl ReservationStatus {
    /// Terminal states accept no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Reservation database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "reservations")]
pub struct Model {
    /// Unique identifier for the reservation
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Human-facing code, `R-YYMMDDHHmm-XXXXX`
    #[sea_orm(unique)]
    pub display_code: String,
    /// Customer holding the reservation
    pub user_uid: String,
    /// Reserved product
    pub product_id: i64,
    /// Units held, always positive
    pub quantity: i32,
    /// `quantity * sell_price`
    pub amount: i64,
    /// Unit price snapshot taken when the reservation was created
    pub sell_price: i64,
    /// Business date the reservation is picked up on
    pub pickup_date: Date,
    /// Current lifecycle state
    pub status: ReservationStatus,
    /// When the status last changed
    pub status_changed_at: DateTime,
    /// When the reservation was created
    pub created_at: DateTime,
}

/// Defines relationships between Reservation and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each reservation belongs to one product
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
    /// Each reservation belongs to one user
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserUid",
        to = "super::user::Column::Uid"
    )]
    User,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
