//! One-shot nonce guard.
//!
//! Signed agent requests carry a nonce; inserting it into a unique-keyed
//! table accepts each nonce at most once across every node sharing the
//! store.

use anyhow::{Context, Result};
use chrono::Duration;
use sqlx::PgPool;
use tracing::Instrument;

/// Record a nonce, rejecting replays.
///
/// Returns false when the nonce was already presented.
///
/// # Errors
/// Returns an error on store failure.
pub async fn validate(pool: &PgPool, nonce: &str) -> Result<bool> {
    let query = r"
        INSERT INTO nonces (id, timestamp)
        VALUES ($1, NOW())
        ON CONFLICT (id) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(nonce)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to insert nonce")?;
    Ok(result.rows_affected() == 1)
}

/// Drop nonces old enough that their signatures can no longer be replayed.
///
/// # Errors
/// Returns an error on store failure.
pub async fn sweep(pool: &PgPool, ttl: Duration) -> Result<u64> {
    let query = "DELETE FROM nonces WHERE timestamp < NOW() - ($1 * INTERVAL '1 second')";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(ttl.num_seconds())
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to sweep nonces")?;
    Ok(result.rows_affected())
}
