//! Key-value store for job bookkeeping, such as the month the warn counters were last reset.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// System state database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "system_state")]
pub struct Model {
    /// State key (e.g., `"last_warn_reset_month"`)
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,
    /// Stored value
    pub value: String,
    /// When the value was last written
    pub updated_at: DateTime,
}

/// System state has no relations
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
