//! Delivery order entity - groups a user's same-day reservations into one paid delivery.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Delivery order status. `Delivered`, `Canceled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum DeliveryStatus {
    /// Created, waiting for the payment callback
    #[sea_orm(string_value = "PENDING_PAYMENT")]
    PendingPayment,
    /// Payment approved
    #[sea_orm(string_value = "PAID")]
    Paid,
    /// Handed to the courier
    #[sea_orm(string_value = "OUT_FOR_DELIVERY")]
    OutForDelivery,
    /// Delivered to the customer
    #[sea_orm(string_value = "DELIVERED")]
    Delivered,
    /// Cancelled by the customer or an admin
    #[sea_orm(string_value = "CANCELED")]
    Canceled,
    /// Payment failed or expired
    #[sea_orm(string_value = "FAILED")]
    Failed,
}

impl DeliveryStatus {
    /// Statuses that still hold their reservations (everything but `Canceled` and `Failed`).
    pub const ACTIVE: [Self; 4] = [
        Self::PendingPayment,
        Self::Paid,
        Self::OutForDelivery,
        Self::Delivered,
    ];

    /// Statuses for which payment has been taken; reservations linked to these orders are
    /// handed over by delivery rather than at the counter.
    pub const SETTLED: [Self; 3] = [Self::Paid, Self::OutForDelivery, Self::Delivered];

    /// Whether this order still holds its reservations.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Canceled | Self::Failed)
    }

    /// Statuses from which `self` may be entered.
    #[must_use]
    pub const fn allowed_from(self) -> &'static [Self] {
        match self {
            Self::PendingPayment => &[],
            Self::Paid => &[Self::PendingPayment],
            Self::OutForDelivery => &[Self::Paid],
            Self::Delivered => &[Self::OutForDelivery],
            Self::Canceled => &[Self::PendingPayment, Self::Paid, Self::OutForDelivery],
            Self::Failed => &[Self::PendingPayment],
        }
    }

    /// Whether the transition `self -> next` is in the allowed table.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        next.allowed_from().contains(&self)
    }
}

/// Delivery order database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "delivery_orders")]
pub struct Model {
    /// Unique identifier for the order
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Human-facing code, `D-YYMMDDHHmm-XXXXX`
    #[sea_orm(unique)]
    pub display_code: String,
    /// Customer who placed the order
    pub user_uid: String,
    /// Current lifecycle state
    pub status: DeliveryStatus,
    /// Business date of the delivery
    pub delivery_date: Date,
    /// Hour of the requested slot; may exceed 23 for after-midnight slots
    pub delivery_hour: i32,
    /// Minute of the requested slot
    pub delivery_minute: i32,
    /// True for a future slot, false for "as soon as possible"
    pub scheduled: bool,
    /// Delivery address latitude
    pub latitude: f64,
    /// Delivery address longitude
    pub longitude: f64,
    /// Great-circle distance from the store
    pub distance_km: f64,
    /// Fee in won charged for the distance
    pub delivery_fee: i64,
    /// Sum of the linked reservation amounts at creation time
    pub amount: i64,
    /// Caller-supplied token, unique per user
    pub idempotency_key: String,
    /// Payment provider transaction id, set on approval
    pub payment_tx_id: Option<String>,
    /// When the courier picked the order up
    pub accepted_at: Option<DateTime>,
    /// Courier's estimate at pickup
    pub estimated_minutes: Option<i32>,
    /// When the status last changed
    pub status_changed_at: DateTime,
    /// When the order was created
    pub created_at: DateTime,
}

/// Defines relationships between DeliveryOrder and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each order belongs to one user
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserUid",
        to = "super::user::Column::Uid"
    )]
    User,
    /// One order carries many reservations
    #[sea_orm(has_many = "super::delivery_order_item::Entity")]
    Items,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::delivery_order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Items.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
