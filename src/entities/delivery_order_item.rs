//! Link rows between a delivery order and the reservations it carries.
//!
//! Rows are kept after the order fails or is cancelled; "is this reservation linked to an
//! active order" is answered by joining on the order status.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Link row between a delivery order and one of its reservations
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "delivery_order_items")]
pub struct Model {
    /// Unique identifier for the link row
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Order the reservation is carried by
    pub delivery_order_id: i64,
    /// Reservation carried by the order
    pub reservation_id: i64,
}

/// Defines relationships between DeliveryOrderItem and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each link belongs to one order
    #[sea_orm(
        belongs_to = "super::delivery_order::Entity",
        from = "Column::DeliveryOrderId",
        to = "super::delivery_order::Column::Id"
    )]
    DeliveryOrder,
    /// Each link points at one reservation
    #[sea_orm(
        belongs_to = "super::reservation::Entity",
        from = "Column::ReservationId",
        to = "super::reservation::Column::Id"
    )]
    Reservation,
}

impl Related<super::delivery_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DeliveryOrder.def()
    }
}

impl Related<super::reservation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Reservation.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
