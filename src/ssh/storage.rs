//! Database helpers for issuance records.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::Instrument;

use super::CertificateBundle;

/// Persist an issuance record.
///
/// # Errors
/// Returns an error on store failure.
pub async fn insert(pool: &PgPool, bundle: &CertificateBundle) -> Result<()> {
    let info = serde_json::to_string(&bundle.certificates_info)
        .context("failed to encode certificate info")?;
    let agent = serde_json::to_string(&bundle.agent).context("failed to encode agent")?;

    let query = r"
        INSERT INTO ssh_certificates
            (id, user_id, authority_ids, certificates_info, agent, timestamp)
        VALUES ($1, $2, $3, $4::jsonb, $5::jsonb, $6)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(bundle.id)
        .bind(bundle.user_id)
        .bind(&bundle.authority_ids)
        .bind(info)
        .bind(agent)
        .bind(bundle.timestamp)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to insert certificate record")?;
    Ok(())
}
