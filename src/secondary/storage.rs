//! Database helpers for secondary providers.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::SecondaryProvider;

/// Look up a secondary provider by id.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_provider(pool: &PgPool, provider_id: Uuid) -> Result<Option<SecondaryProvider>> {
    let query = r"
        SELECT id, kind, label, push_factor, phone_factor, passcode_factor, sms_factor
        FROM secondary_providers
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(provider_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup secondary provider")?;
    Ok(row.map(|row| SecondaryProvider {
        id: row.get("id"),
        kind: row.get("kind"),
        label: row.get("label"),
        push_factor: row.get("push_factor"),
        phone_factor: row.get("phone_factor"),
        passcode_factor: row.get("passcode_factor"),
        sms_factor: row.get("sms_factor"),
    }))
}
