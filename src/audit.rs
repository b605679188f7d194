//! Audit records for authentication events.
//!
//! Records carry identifiers and provider ids only; never secrets,
//! passcodes or signatures.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent::Agent;

/// Audit event types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuditKind {
    AdminLogin,
    AdminLoginFailed,
    Login,
    LoginFailed,
    KeybaseAssociationApprove,
    KeybaseAssociationDeny,
}

impl AuditKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdminLogin => "admin_login",
            Self::AdminLoginFailed => "admin_login_failed",
            Self::Login => "login",
            Self::LoginFailed => "login_failed",
            Self::KeybaseAssociationApprove => "keybase_association_approve",
            Self::KeybaseAssociationDeny => "keybase_association_deny",
        }
    }
}

/// Append an audit record.
///
/// # Errors
/// Returns an error on store failure.
pub async fn new(
    pool: &PgPool,
    user_id: Uuid,
    agent: &Agent,
    kind: AuditKind,
    fields: Value,
) -> Result<()> {
    let agent = serde_json::to_string(agent).context("failed to encode audit agent")?;
    let query = r"
        INSERT INTO audits (id, user_id, kind, fields, agent, timestamp)
        VALUES ($1, $2, $3, $4::jsonb, $5::jsonb, NOW())
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(kind.as_str())
        .bind(fields.to_string())
        .bind(agent)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to insert audit record")?;
    Ok(())
}

/// Remove every audit record (operator `clear-logs` command).
///
/// # Errors
/// Returns an error on store failure.
pub async fn clear(pool: &PgPool) -> Result<u64> {
    let query = "DELETE FROM audits";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to clear audit records")?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::AuditKind;

    #[test]
    fn audit_kind_strings() {
        assert_eq!(AuditKind::AdminLogin.as_str(), "admin_login");
        assert_eq!(AuditKind::LoginFailed.as_str(), "login_failed");
        assert_eq!(
            AuditKind::KeybaseAssociationApprove.as_str(),
            "keybase_association_approve"
        );
    }
}
