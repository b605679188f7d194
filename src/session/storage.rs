//! Database helpers for sessions.

use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{SESSION_ID_LEN, Scope, Session};
use crate::agent::Agent;
use crate::utils::rand_str;

fn row_to_session(row: &PgRow) -> Result<Session> {
    let scope: String = row.get("scope");
    let scope =
        Scope::from_str(&scope).with_context(|| format!("unknown session scope: {scope}"))?;
    let agent: String = row.get("agent");
    let agent: Agent = serde_json::from_str(&agent).context("invalid session agent json")?;
    Ok(Session {
        id: row.get("id"),
        scope,
        user_id: row.get("user_id"),
        timestamp: row.get("timestamp"),
        last_active: row.get("last_active"),
        removed: row.get("removed"),
        agent,
    })
}

/// Mint and store a new session for a user.
///
/// # Errors
/// Returns an error on store failure.
pub async fn new(pool: &PgPool, user_id: Uuid, scope: Scope, agent: &Agent) -> Result<Session> {
    let id = rand_str(SESSION_ID_LEN);
    let agent_json = serde_json::to_string(agent).context("failed to encode session agent")?;

    let query = r"
        INSERT INTO sessions (id, scope, user_id, timestamp, last_active, removed, agent)
        VALUES ($1, $2, $3, NOW(), NOW(), FALSE, $4::jsonb)
        RETURNING id, scope, user_id, timestamp, last_active, removed, agent::text AS agent
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(&id)
        .bind(scope.as_str())
        .bind(user_id)
        .bind(agent_json)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to insert session")?;
    row_to_session(&row)
}

/// Look up a session by scope and id.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get(pool: &PgPool, scope: Scope, session_id: &str) -> Result<Option<Session>> {
    let query = r"
        SELECT id, scope, user_id, timestamp, last_active, removed, agent::text AS agent
        FROM sessions
        WHERE id = $1 AND scope = $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(session_id)
        .bind(scope.as_str())
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup session")?;
    row.as_ref().map(row_to_session).transpose()
}

/// Bump `last_active` in place. Idempotent; no event is emitted.
///
/// # Errors
/// Returns an error on store failure.
pub async fn touch(pool: &PgPool, session_id: &str) -> Result<()> {
    let query = "UPDATE sessions SET last_active = NOW() WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to touch session")?;
    Ok(())
}

/// Delete a session row (logout).
///
/// # Errors
/// Returns an error on store failure.
pub async fn remove(pool: &PgPool, session_id: &str) -> Result<()> {
    let query = "DELETE FROM sessions WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete session")?;
    Ok(())
}

/// Revoke every session belonging to a user.
///
/// # Errors
/// Returns an error on store failure.
pub async fn remove_user(pool: &PgPool, user_id: Uuid) -> Result<u64> {
    let query = "UPDATE sessions SET removed = TRUE WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to revoke user sessions")?;
    Ok(result.rows_affected())
}

/// Drop revoked sessions and sessions idle past the longest scope window.
///
/// # Errors
/// Returns an error on store failure.
pub async fn sweep(pool: &PgPool, max_idle_minutes: i64) -> Result<u64> {
    let query = r"
        DELETE FROM sessions
        WHERE removed OR last_active < NOW() - ($1 * INTERVAL '1 minute')
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(max_idle_minutes)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to sweep sessions")?;
    Ok(result.rows_affected())
}
