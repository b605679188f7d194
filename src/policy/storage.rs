//! Database helpers for policy selection.

use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{KeybaseMode, Policy, PolicyKind, PolicyRules};

const POLICY_COLUMNS: &str = "id, name, disabled, kind, roles, services, authorities, \
     admin_secondary, user_secondary, proxy_secondary, authority_secondary, \
     keybase_mode, rules::text AS rules";

fn row_to_policy(row: &PgRow) -> Result<Policy> {
    let kind: String = row.get("kind");
    let kind = PolicyKind::from_str(&kind)
        .with_context(|| format!("unknown policy kind in store: {kind}"))?;
    let keybase_mode: String = row.get("keybase_mode");
    let keybase_mode = KeybaseMode::from_str(&keybase_mode)
        .with_context(|| format!("unknown keybase mode in store: {keybase_mode}"))?;
    let rules: String = row.get("rules");
    let rules: PolicyRules = serde_json::from_str(&rules).context("invalid policy rules json")?;
    Ok(Policy {
        id: row.get("id"),
        name: row.get("name"),
        disabled: row.get("disabled"),
        kind,
        roles: row.get("roles"),
        services: row.get("services"),
        authorities: row.get("authorities"),
        admin_secondary: row.get("admin_secondary"),
        user_secondary: row.get("user_secondary"),
        proxy_secondary: row.get("proxy_secondary"),
        authority_secondary: row.get("authority_secondary"),
        keybase_mode,
        rules,
    })
}

/// Role-scoped policies whose role set intersects the user's roles,
/// ordered by id so secondary selection is stable.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_roles(pool: &PgPool, roles: &[String]) -> Result<Vec<Policy>> {
    let query = format!(
        "SELECT {POLICY_COLUMNS} FROM policies \
         WHERE kind = 'roles' AND roles && $1 ORDER BY id"
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let rows = sqlx::query(&query)
        .bind(roles)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to select role policies")?;
    rows.iter().map(row_to_policy).collect()
}

/// Service-scoped policies attached to the given service.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_service(pool: &PgPool, service_id: Uuid) -> Result<Vec<Policy>> {
    let query = format!(
        "SELECT {POLICY_COLUMNS} FROM policies \
         WHERE kind = 'service' AND $1 = ANY(services) ORDER BY id"
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let rows = sqlx::query(&query)
        .bind(service_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to select service policies")?;
    rows.iter().map(row_to_policy).collect()
}

/// Policies intersecting both the given authorities and the user's roles;
/// the selection the Keybase flow gates certificate issuance on.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_authorities_roles(
    pool: &PgPool,
    authority_ids: &[Uuid],
    roles: &[String],
) -> Result<Vec<Policy>> {
    let query = format!(
        "SELECT {POLICY_COLUMNS} FROM policies \
         WHERE authorities && $1 AND roles && $2 ORDER BY id"
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let rows = sqlx::query(&query)
        .bind(authority_ids)
        .bind(roles)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to select authority policies")?;
    rows.iter().map(row_to_policy).collect()
}
