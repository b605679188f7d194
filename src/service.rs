//! Services fronted by the proxy data plane.
//!
//! The proxy itself is a collaborator; the gateway only needs the role set
//! a user must intersect to reach a service.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    pub roles: Vec<String>,
}

/// Look up a service by id.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get(pool: &PgPool, service_id: Uuid) -> Result<Option<Service>> {
    let query = "SELECT id, name, roles FROM services WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(service_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup service")?;
    Ok(row.map(|row| Service {
        id: row.get("id"),
        name: row.get("name"),
        roles: row.get("roles"),
    }))
}
