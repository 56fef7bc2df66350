//! Key-value bookkeeping for scheduled jobs that must run at most once per period.

use crate::{
    entities::{SystemState, system_state},
    errors::Result,
};
use chrono::NaiveDateTime;
use sea_orm::{Set, prelude::*};

/// Reads the value stored under `key`.
pub async fn get_state<C>(conn: &C, key: &str) -> Result<Option<String>>
where
    C: ConnectionTrait,
{
    Ok(SystemState::find_by_id(key.to_string())
        .one(conn)
        .await?
        .map(|state| state.value))
}

/// Stores `value` under `key`, replacing any previous value.
pub async fn set_state<C>(conn: &C, key: &str, value: &str, now: NaiveDateTime) -> Result<()>
where
    C: ConnectionTrait,
{
    if let Some(state) = SystemState::find_by_id(key.to_string()).one(conn).await? {
        let mut active: system_state::ActiveModel = state.into();
        active.value = Set(value.to_string());
        active.updated_at = Set(now);
        active.update(conn).await?;
    } else {
        system_state::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.to_string()),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;
    }
    Ok(())
}
