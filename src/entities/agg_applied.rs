//! Aggregation marker - records, per reservation and phase, that a reservation has been
//! picked up by the daily aggregation.
//!
//! `(reservation_id, phase)` is unique, so marking is an insert-ignore and a reservation can be
//! counted at most once per phase. A row moves through three states:
//! marked (`batch_uid` is null), claimed (`batch_uid` set) and finished (`processed_at` set).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Which daily aggregate a marker feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum AggPhase {
    /// Per-product sold quantity and amount
    #[sea_orm(string_value = "PRODUCT_SALES")]
    ProductSales,
    /// Per-day delivery totals
    #[sea_orm(string_value = "DELIVERY")]
    Delivery,
}

/// Aggregation marker database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "agg_applied")]
pub struct Model {
    /// Unique identifier for the marker
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Reservation this marker counts
    pub reservation_id: i64,
    /// Aggregate the marker feeds
    pub phase: AggPhase,
    /// Business date the reservation belongs to
    pub business_date: Date,
    /// Run that owns this row, null until claimed
    pub batch_uid: Option<String>,
    /// When the owning run claimed the row
    pub claimed_at: Option<DateTime>,
    /// Set once the owning run has written its aggregates
    pub processed_at: Option<DateTime>,
    /// When the reservation was marked
    pub created_at: DateTime,
}

/// Markers reference reservations by id only, without a foreign key.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
