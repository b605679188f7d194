//! SSO provider configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::user::UserKind;

/// How roles claimed by a provider reconcile with stored roles.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RoleManagement {
    Merge,
    Overwrite,
}

impl RoleManagement {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Overwrite => "overwrite",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "merge" => Some(Self::Merge),
            "overwrite" => Some(Self::Overwrite),
            _ => None,
        }
    }
}

/// An identity provider the gateway can hand logins to.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Provider {
    pub id: Uuid,
    pub kind: UserKind,
    pub label: String,
    /// Google: accepted account domain.
    pub domain: String,
    /// Azure: directory (tenant) id.
    pub tenant: String,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub default_roles: Vec<String>,
    pub auto_create: bool,
    pub role_management: RoleManagement,
}

fn row_to_provider(row: &PgRow) -> Result<Provider> {
    let kind: String = row.get("kind");
    let kind = UserKind::from_str(&kind)
        .with_context(|| format!("unknown provider kind in store: {kind}"))?;
    let role_management: String = row.get("role_management");
    let role_management = RoleManagement::from_str(&role_management)
        .with_context(|| format!("unknown role management mode: {role_management}"))?;
    Ok(Provider {
        id: row.get("id"),
        kind,
        label: row.get("label"),
        domain: row.get("domain"),
        tenant: row.get("tenant"),
        client_id: row.get("client_id"),
        client_secret: row.get("client_secret"),
        default_roles: row.get("default_roles"),
        auto_create: row.get("auto_create"),
        role_management,
    })
}

const PROVIDER_COLUMNS: &str = "id, kind, label, domain, tenant, client_id, client_secret, \
     default_roles, auto_create, role_management";

/// Look up a provider by id.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get(pool: &PgPool, provider_id: Uuid) -> Result<Option<Provider>> {
    let query = format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(provider_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup provider")?;
    row.as_ref().map(row_to_provider).transpose()
}

/// All configured providers in a stable order.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_all(pool: &PgPool) -> Result<Vec<Provider>> {
    let query = format!("SELECT {PROVIDER_COLUMNS} FROM providers ORDER BY label, id");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let rows = sqlx::query(&query)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list providers")?;
    rows.iter().map(row_to_provider).collect()
}

/// Find the Google provider configured for the given account domain.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_google_domain(pool: &PgPool, domain: &str) -> Result<Option<Provider>> {
    if domain.is_empty() {
        return Ok(None);
    }
    let query = format!(
        "SELECT {PROVIDER_COLUMNS} FROM providers WHERE kind = 'google' AND domain = $1"
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(domain)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup google provider")?;
    row.as_ref().map(row_to_provider).transpose()
}
