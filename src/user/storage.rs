//! Database helpers for user documents.

use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{User, UserKind};
use crate::errdata::ErrorData;

const USER_COLUMNS: &str = "id, kind, username, password_hash, token, secret, roles, \
     administrator, permissions, disabled, active_until, last_active, theme, keybase, keybase_id";

fn row_to_user(row: &PgRow) -> Result<User> {
    let kind: String = row.get("kind");
    let kind = UserKind::from_str(&kind)
        .with_context(|| format!("unknown user kind in store: {kind}"))?;
    Ok(User {
        id: row.get("id"),
        kind,
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        token: row.get("token"),
        secret: row.get("secret"),
        roles: row.get("roles"),
        administrator: row.get("administrator"),
        permissions: row.get("permissions"),
        disabled: row.get("disabled"),
        active_until: row.get("active_until"),
        last_active: row.get("last_active"),
        theme: row.get("theme"),
        keybase: row.get("keybase"),
        keybase_id: row.get("keybase_id"),
    })
}

/// Look up a user by id.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get(pool: &PgPool, user_id: Uuid) -> Result<Option<User>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user")?;
    row.as_ref().map(row_to_user).transpose()
}

/// Look up a user by id and bump `last_active` in the same round trip.
///
/// The bump is an idempotent timestamp write; no event is emitted for it.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_update(pool: &PgPool, user_id: Uuid) -> Result<Option<User>> {
    let query = format!(
        "UPDATE users SET last_active = NOW() WHERE id = $1 RETURNING {USER_COLUMNS}"
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user")?;
    row.as_ref().map(row_to_user).transpose()
}

/// Look up a user by (kind, username).
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_username(pool: &PgPool, kind: UserKind, username: &str) -> Result<Option<User>> {
    if username.is_empty() {
        return Ok(None);
    }
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE kind = $1 AND username = $2");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(kind.as_str())
        .bind(username)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user by username")?;
    row.as_ref().map(row_to_user).transpose()
}

/// Look up the user bound to a Keybase username.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_keybase(pool: &PgPool, keybase: &str) -> Result<Option<User>> {
    if keybase.is_empty() {
        return Ok(None);
    }
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE keybase = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(keybase)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user by keybase")?;
    row.as_ref().map(row_to_user).transpose()
}

/// Insert a new user document.
///
/// # Errors
/// Returns an error on store failure.
pub async fn insert(pool: &PgPool, usr: &User) -> Result<()> {
    let query = r"
        INSERT INTO users
            (id, kind, username, password_hash, token, secret, roles, administrator,
             permissions, disabled, active_until, last_active, theme, keybase, keybase_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(usr.id)
        .bind(usr.kind.as_str())
        .bind(&usr.username)
        .bind(&usr.password_hash)
        .bind(&usr.token)
        .bind(&usr.secret)
        .bind(&usr.roles)
        .bind(&usr.administrator)
        .bind(&usr.permissions)
        .bind(usr.disabled)
        .bind(usr.active_until)
        .bind(usr.last_active)
        .bind(&usr.theme)
        .bind(&usr.keybase)
        .bind(&usr.keybase_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to insert user")?;
    Ok(())
}

/// Persist only the `roles` field of an existing user.
///
/// Role reconciliation is last-wins on purpose; a lost update is corrected
/// on the next login from the same provider.
///
/// # Errors
/// Returns an error on store failure.
pub async fn commit_roles(pool: &PgPool, usr: &User) -> Result<()> {
    let query = "UPDATE users SET roles = $2 WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(usr.id)
        .bind(&usr.roles)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to commit user roles")?;
    Ok(())
}

/// Pin a user's Keybase identity (username and primary-key id).
///
/// # Errors
/// Returns an error on store failure.
pub async fn commit_keybase(
    pool: &PgPool,
    user_id: Uuid,
    keybase: &str,
    keybase_id: &str,
) -> Result<()> {
    let query = "UPDATE users SET keybase = $2, keybase_id = $3 WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(keybase)
        .bind(keybase_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to commit user keybase identity")?;
    Ok(())
}

/// Delete users and their sessions.
///
/// Refuses the whole batch if it would remove the last super administrator;
/// the count and the deletes run in one transaction so a concurrent delete
/// cannot slip below one.
///
/// # Errors
/// Returns an error on store failure.
pub async fn remove(pool: &PgPool, user_ids: &[Uuid]) -> Result<Option<ErrorData>> {
    let mut tx = pool.begin().await.context("begin user remove transaction")?;

    let query = r"
        SELECT COUNT(*) AS count FROM users
        WHERE administrator = 'super' AND NOT (id = ANY($1))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_ids)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await
        .context("failed to count remaining super administrators")?;
    let remaining: i64 = row.get("count");

    if remaining == 0 {
        tx.rollback().await.context("rollback user remove")?;
        return Ok(Some(ErrorData::user_remove_super()));
    }

    let query = "DELETE FROM sessions WHERE user_id = ANY($1)";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_ids)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to delete user sessions")?;

    let query = "DELETE FROM users WHERE id = ANY($1)";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_ids)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to delete users")?;

    tx.commit().await.context("commit user remove")?;
    Ok(None)
}

/// List users ordered by username.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_all(pool: &PgPool, page: i64, page_count: i64) -> Result<(Vec<User>, i64)> {
    let query = "SELECT COUNT(*) AS count FROM users";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to count users")?;
    let count: i64 = row.get("count");

    let skip = (page * page_count).min((count - page_count).max(0));

    let query = format!(
        "SELECT {USER_COLUMNS} FROM users ORDER BY username OFFSET $1 LIMIT $2"
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let rows = sqlx::query(&query)
        .bind(skip)
        .bind(page_count)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list users")?;

    let users = rows
        .iter()
        .map(row_to_user)
        .collect::<Result<Vec<_>>>()?;
    Ok((users, count))
}
