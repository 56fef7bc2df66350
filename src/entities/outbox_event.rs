//! Notification outbox. Rows are written in the same transaction as the state change they
//! announce and published later by `core::notify::dispatch_pending`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Pending or published notification database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "outbox_events")]
pub struct Model {
    /// Unique identifier; publish order follows it
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Message template identifier understood by the notification provider
    pub template_code: String,
    /// User uid the message is addressed to
    pub recipient: String,
    /// Template variables as a JSON object
    pub variables: String,
    /// Failed publish attempts so far
    pub attempts: i32,
    /// Publisher error from the last failed attempt
    pub last_error: Option<String>,
    /// When the event was enqueued
    pub created_at: DateTime,
    /// When the event was published, null while pending
    pub published_at: Option<DateTime>,
}

/// Outbox rows stand alone
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
