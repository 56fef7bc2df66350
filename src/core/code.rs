//! Human-facing display codes, `P-YYMMDDHHmm-XXXXX`.
//!
//! Codes are random, not sequential. Callers check each candidate for existence and take the
//! first free one; the unique index on the code column remains the final guard, and a
//! collision there surfaces as a retryable concurrency error.

use crate::errors::{Error, Result};
use chrono::NaiveDateTime;
use rand::{Rng, distributions::Alphanumeric};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::warn;

/// Suffix lengths tried in order: two short codes, then one longer fallback.
const SUFFIX_LENGTHS: [usize; 3] = [5, 5, 6];

/// Prefix for reservation codes.
pub const RESERVATION_PREFIX: char = 'R';
/// Prefix for delivery order codes.
pub const DELIVERY_PREFIX: char = 'D';

fn random_suffix(rng: &mut impl Rng, len: usize) -> String {
    std::iter::repeat_with(|| char::from(rng.sample(Alphanumeric)).to_ascii_uppercase())
        .take(len)
        .collect()
}

/// Formats a code from its parts.
#[must_use]
pub fn format_code(prefix: char, at: NaiveDateTime, suffix: &str) -> String {
    format!("{prefix}-{}-{suffix}", at.format("%y%m%d%H%M"))
}

/// Candidate codes for an entity created at `at`, in the order they should be tried.
#[must_use]
pub fn candidates(rng: &mut impl Rng, prefix: char, at: NaiveDateTime) -> Vec<String> {
    SUFFIX_LENGTHS
        .iter()
        .map(|&len| format_code(prefix, at, &random_suffix(rng, len)))
        .collect()
}

/// First code from `codes` not yet present in `column` of entity `E`.
async fn first_free<E, C>(conn: &C, column: E::Column, codes: Vec<String>) -> Result<String>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    let mut last = None;
    for candidate in codes {
        let taken = E::find()
            .filter(column.eq(candidate.as_str()))
            .one(conn)
            .await?
            .is_some();
        if !taken {
            return Ok(candidate);
        }
        warn!(code = %candidate, "display code collision");
        last = Some(candidate);
    }
    Err(Error::concurrency(format!(
        "display code generation failed, last tried {}",
        last.unwrap_or_default()
    )))
}

/// First free random code for an entity created at `at`.
///
/// # Errors
/// Returns a concurrency error when every candidate is taken. Exhaustion is retryable on
/// purpose: a later attempt draws fresh suffixes and almost certainly succeeds.
pub async fn unique_code<E, C>(
    conn: &C,
    column: E::Column,
    prefix: char,
    at: NaiveDateTime,
) -> Result<String>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    let codes = candidates(&mut rand::thread_rng(), prefix, at);
    first_free::<E, C>(conn, column, codes).await
}
