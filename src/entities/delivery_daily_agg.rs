//! Pre-aggregated delivery totals per business date.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-day delivery totals database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "delivery_daily_agg")]
pub struct Model {
    /// Unique identifier for the aggregate row
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Business date the totals cover
    #[sea_orm(unique)]
    pub sell_date: Date,
    /// Delivered orders
    pub order_count: i64,
    /// Units delivered
    pub quantity: i64,
    /// Goods amount in won, fees excluded
    pub amount: i64,
    /// Delivery fees in won
    pub delivery_fee: i64,
    /// When the totals were last recomputed
    pub updated_at: DateTime,
}

/// Daily totals have no relations
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
