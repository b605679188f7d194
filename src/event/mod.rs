//! Cross-node event bus backed by an append-only table.
//!
//! Publishers append `{channel, data}` rows with time-ordered ids;
//! subscribers tail the table from the current maximum id. The table is
//! capped by the background sweep.

pub mod listener;

pub use listener::{Event, Listener, subscribe_listener};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use sqlx::PgPool;
use tracing::Instrument;

/// Append an event with a payload.
///
/// # Errors
/// Returns an error on store failure.
pub async fn publish(pool: &PgPool, channel: &str, data: Value) -> Result<()> {
    let query = r"
        INSERT INTO events (channel, data, timestamp)
        VALUES ($1, $2::jsonb, NOW())
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(channel)
        .bind(data.to_string())
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to publish event")?;
    Ok(())
}

/// Append a bare change notification used for config/user invalidation.
///
/// # Errors
/// Returns an error on store failure.
pub async fn publish_dispatch(pool: &PgPool, channel: &str) -> Result<()> {
    publish(pool, channel, json!({})).await
}

/// Trim the event table down to the most recent `keep` rows.
///
/// # Errors
/// Returns an error on store failure.
pub async fn trim(pool: &PgPool, keep: i64) -> Result<u64> {
    let query = r"
        DELETE FROM events
        WHERE id < (SELECT COALESCE(MAX(id), 0) FROM events) - $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(keep)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to trim events")?;
    Ok(result.rows_affected())
}
