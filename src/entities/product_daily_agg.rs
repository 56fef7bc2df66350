//! Pre-aggregated sales per product and sell date, written by the daily aggregation.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-product daily sales database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "product_daily_agg")]
pub struct Model {
    /// Unique identifier for the aggregate row
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Product the totals cover
    pub product_id: i64,
    /// Business date the totals cover
    pub sell_date: Date,
    /// Units sold
    pub quantity: i64,
    /// Sales amount in won
    pub amount: i64,
    /// When the totals were last recomputed
    pub updated_at: DateTime,
}

/// Defines relationships between ProductDailyAgg and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each row belongs to one product
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
