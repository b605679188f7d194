//! One-shot maintenance actions run against the store.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::audit;
use crate::authority;
use crate::db;
use crate::event;
use crate::settings;

async fn connect(dsn: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(dsn)
        .await
        .context("Failed to connect to database")?;
    db::migrate(&pool).await?;
    Ok(pool)
}

/// Write a settings override and notify running nodes.
///
/// # Errors
/// Returns an error on store failure.
pub async fn set(dsn: &str, group: &str, key: &str, value: &Value) -> Result<()> {
    let pool = connect(dsn).await?;
    settings::set(&pool, group, key, value).await?;
    event::publish_dispatch(&pool, "settings.change").await?;
    info!("Set {group}.{key}");
    Ok(())
}

/// Remove a settings override and notify running nodes.
///
/// # Errors
/// Returns an error on store failure.
pub async fn unset(dsn: &str, group: &str, key: &str) -> Result<()> {
    let pool = connect(dsn).await?;
    settings::unset(&pool, group, key).await?;
    event::publish_dispatch(&pool, "settings.change").await?;
    info!("Unset {group}.{key}");
    Ok(())
}

/// Assign this deployment a fresh node identifier.
///
/// # Errors
/// Returns an error on store failure.
pub async fn reset_id(dsn: &str) -> Result<()> {
    let pool = connect(dsn).await?;
    let node_id = Uuid::new_v4();
    settings::set(&pool, "system", "node_id", &json!(node_id.to_string())).await?;
    event::publish_dispatch(&pool, "settings.change").await?;
    info!("Node id reset to {node_id}");
    Ok(())
}

/// Remove all audit records.
///
/// # Errors
/// Returns an error on store failure.
pub async fn clear_logs(dsn: &str) -> Result<()> {
    let pool = connect(dsn).await?;
    let removed = audit::clear(&pool).await?;
    info!("Cleared {removed} audit records");
    Ok(())
}

/// Print the @cert-authority lines for every host-enabled authority.
///
/// # Errors
/// Returns an error on store failure.
pub async fn export_ssh(dsn: &str) -> Result<()> {
    let pool = connect(dsn).await?;
    let lines = authority::export_cert_authorities(&pool).await?;
    println!("{lines}");
    Ok(())
}
