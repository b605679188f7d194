//! Database helpers for authorities.
//!
//! Key rotation and host-token changes are full-row writes; in-flight
//! signings finish against the key they already read.

use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::Authority;

const AUTHORITY_COLUMNS: &str = "id, name, kind, key_alg, match_roles, roles, expire, \
     host_expire, private_key, public_key, host_domain, host_proxy, host_certificates, \
     strict_host_checking, host_tokens";

fn row_to_authority(row: &PgRow) -> Authority {
    Authority {
        id: row.get("id"),
        name: row.get("name"),
        kind: row.get("kind"),
        key_alg: row.get("key_alg"),
        match_roles: row.get("match_roles"),
        roles: row.get("roles"),
        expire: row.get("expire"),
        host_expire: row.get("host_expire"),
        private_key: row.get("private_key"),
        public_key: row.get("public_key"),
        host_domain: row.get("host_domain"),
        host_proxy: row.get("host_proxy"),
        host_certificates: row.get("host_certificates"),
        strict_host_checking: row.get("strict_host_checking"),
        host_tokens: row.get("host_tokens"),
    }
}

/// Look up an authority by id.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get(pool: &PgPool, authority_id: Uuid) -> Result<Option<Authority>> {
    let query = format!("SELECT {AUTHORITY_COLUMNS} FROM authorities WHERE id = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(authority_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup authority")?;
    Ok(row.map(|row| row_to_authority(&row)))
}

/// All authorities in a stable order.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_all(pool: &PgPool) -> Result<Vec<Authority>> {
    let query = format!("SELECT {AUTHORITY_COLUMNS} FROM authorities ORDER BY name, id");
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
        .context("failed to list authorities")?;
    Ok(rows.iter().map(row_to_authority).collect())
}

/// Insert a new authority.
///
/// # Errors
/// Returns an error on store failure.
pub async fn insert(pool: &PgPool, authority: &Authority) -> Result<()> {
    let query = r"
        INSERT INTO authorities
            (id, name, kind, key_alg, match_roles, roles, expire, host_expire,
             private_key, public_key, host_domain, host_proxy, host_certificates,
             strict_host_checking, host_tokens)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(authority.id)
        .bind(&authority.name)
        .bind(&authority.kind)
        .bind(&authority.key_alg)
        .bind(authority.match_roles)
        .bind(&authority.roles)
        .bind(authority.expire)
        .bind(authority.host_expire)
        .bind(&authority.private_key)
        .bind(&authority.public_key)
        .bind(&authority.host_domain)
        .bind(&authority.host_proxy)
        .bind(authority.host_certificates)
        .bind(authority.strict_host_checking)
        .bind(&authority.host_tokens)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to insert authority")?;
    Ok(())
}

/// Replace an authority document (copy-on-write for token lists and key
/// rotation).
///
/// # Errors
/// Returns an error on store failure.
pub async fn commit(pool: &PgPool, authority: &Authority) -> Result<()> {
    let query = r"
        UPDATE authorities SET
            name = $2, kind = $3, key_alg = $4, match_roles = $5, roles = $6,
            expire = $7, host_expire = $8, private_key = $9, public_key = $10,
            host_domain = $11, host_proxy = $12, host_certificates = $13,
            strict_host_checking = $14, host_tokens = $15
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(authority.id)
        .bind(&authority.name)
        .bind(&authority.kind)
        .bind(&authority.key_alg)
        .bind(authority.match_roles)
        .bind(&authority.roles)
        .bind(authority.expire)
        .bind(authority.host_expire)
        .bind(&authority.private_key)
        .bind(&authority.public_key)
        .bind(&authority.host_domain)
        .bind(&authority.host_proxy)
        .bind(authority.host_certificates)
        .bind(authority.strict_host_checking)
        .bind(&authority.host_tokens)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to commit authority")?;
    Ok(())
}
