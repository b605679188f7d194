//! Short-lived, single-use opaque tokens.
//!
//! All flow tokens (SSO state, Keybase challenges and associations, step-up
//! secondaries) live in one collection keyed by a random id with a kind
//! discriminator and a typed JSON payload. `consume` removes and returns in
//! one statement, so with concurrent presenters at most one observes the
//! token. Expiry is enforced on read and by the background sweep.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::Instrument;

/// Token type discriminator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenKind {
    SsoState,
    KeybaseChallenge,
    KeybaseAssociation,
    Secondary,
}

impl TokenKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SsoState => "sso-state",
            Self::KeybaseChallenge => "keybase-challenge",
            Self::KeybaseAssociation => "keybase-association",
            Self::Secondary => "secondary",
        }
    }
}

/// Stored token row.
#[derive(Clone, Debug)]
pub struct Token {
    pub id: String,
    pub kind: TokenKind,
    pub secret: String,
    pub timestamp: DateTime<Utc>,
    payload: serde_json::Value,
}

impl Token {
    /// Deserialize the typed payload carried by this token.
    ///
    /// # Errors
    /// Returns an error if the stored payload does not match the expected
    /// shape.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).context("invalid token payload")
    }
}

fn row_to_token(row: &PgRow, kind: TokenKind) -> Result<Token> {
    let payload: String = row.get("payload");
    Ok(Token {
        id: row.get("id"),
        kind,
        secret: row.get("secret"),
        timestamp: row.get("timestamp"),
        payload: serde_json::from_str(&payload).context("invalid token payload json")?,
    })
}

/// Store a token.
///
/// # Errors
/// Returns an error on store failure or if the payload cannot be encoded.
pub async fn put<T: Serialize>(
    pool: &PgPool,
    kind: TokenKind,
    id: &str,
    secret: &str,
    payload: &T,
) -> Result<()> {
    let payload = serde_json::to_string(payload).context("failed to encode token payload")?;
    let query = r"
        INSERT INTO tokens (id, kind, secret, timestamp, payload)
        VALUES ($1, $2, $3, NOW(), $4::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(id)
        .bind(kind.as_str())
        .bind(secret)
        .bind(payload)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to insert token")?;
    Ok(())
}

/// Fetch a token without consuming it. Expired tokens read as missing.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get(pool: &PgPool, kind: TokenKind, id: &str, ttl: Duration) -> Result<Option<Token>> {
    let query = r"
        SELECT id, secret, timestamp, payload::text AS payload
        FROM tokens
        WHERE id = $1 AND kind = $2 AND timestamp > NOW() - ($3 * INTERVAL '1 second')
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(id)
        .bind(kind.as_str())
        .bind(ttl.num_seconds())
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup token")?;
    row.map(|row| row_to_token(&row, kind)).transpose()
}

/// Atomically remove and return a token. At most one caller gets `Some`.
///
/// # Errors
/// Returns an error on store failure.
pub async fn consume(
    pool: &PgPool,
    kind: TokenKind,
    id: &str,
    ttl: Duration,
) -> Result<Option<Token>> {
    let query = r"
        DELETE FROM tokens
        WHERE id = $1 AND kind = $2 AND timestamp > NOW() - ($3 * INTERVAL '1 second')
        RETURNING id, secret, timestamp, payload::text AS payload
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(id)
        .bind(kind.as_str())
        .bind(ttl.num_seconds())
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to consume token")?;
    row.map(|row| row_to_token(&row, kind)).transpose()
}

/// Replace the payload of a live token.
///
/// # Errors
/// Returns an error on store failure.
pub async fn update_payload<T: Serialize>(
    pool: &PgPool,
    kind: TokenKind,
    id: &str,
    payload: &T,
) -> Result<()> {
    let payload = serde_json::to_string(payload).context("failed to encode token payload")?;
    let query = "UPDATE tokens SET payload = $3::jsonb WHERE id = $1 AND kind = $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(id)
        .bind(kind.as_str())
        .bind(payload)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update token payload")?;
    Ok(())
}

/// Compare-and-swap on the payload `state` field.
///
/// Returns true when this caller performed the transition.
///
/// # Errors
/// Returns an error on store failure.
pub async fn transition_state<T: Serialize>(
    pool: &PgPool,
    kind: TokenKind,
    id: &str,
    expected_state: &str,
    payload: &T,
) -> Result<bool> {
    let payload = serde_json::to_string(payload).context("failed to encode token payload")?;
    let query = r"
        UPDATE tokens SET payload = $4::jsonb
        WHERE id = $1 AND kind = $2 AND payload->>'state' = $3
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(id)
        .bind(kind.as_str())
        .bind(expected_state)
        .bind(payload)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to transition token state")?;
    Ok(result.rows_affected() == 1)
}

/// Remove a token unconditionally (terminal transitions).
///
/// # Errors
/// Returns an error on store failure.
pub async fn remove(pool: &PgPool, kind: TokenKind, id: &str) -> Result<()> {
    let query = "DELETE FROM tokens WHERE id = $1 AND kind = $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(id)
        .bind(kind.as_str())
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to remove token")?;
    Ok(())
}

/// Delete tokens of a kind older than the ttl. Returns the number removed.
///
/// # Errors
/// Returns an error on store failure.
pub async fn sweep(pool: &PgPool, kind: TokenKind, ttl: Duration) -> Result<u64> {
    let query = r"
        DELETE FROM tokens
        WHERE kind = $1 AND timestamp < NOW() - ($2 * INTERVAL '1 second')
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(kind.as_str())
        .bind(ttl.num_seconds())
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to sweep tokens")?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::{Token, TokenKind};
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(TokenKind::SsoState.as_str(), "sso-state");
        assert_eq!(TokenKind::KeybaseChallenge.as_str(), "keybase-challenge");
        assert_eq!(
            TokenKind::KeybaseAssociation.as_str(),
            "keybase-association"
        );
        assert_eq!(TokenKind::Secondary.as_str(), "secondary");
    }

    #[test]
    fn payload_decodes_typed() {
        #[derive(Deserialize)]
        struct Payload {
            state: String,
        }

        let token = Token {
            id: "t".to_string(),
            kind: TokenKind::KeybaseChallenge,
            secret: String::new(),
            timestamp: Utc::now(),
            payload: json!({"state": "approved"}),
        };
        let payload: Payload = token.payload().expect("decode");
        assert_eq!(payload.state, "approved");
    }

    #[test]
    fn payload_mismatch_is_an_error() {
        #[derive(Deserialize)]
        struct Payload {
            #[allow(dead_code)]
            count: u64,
        }

        let token = Token {
            id: "t".to_string(),
            kind: TokenKind::Secondary,
            secret: String::new(),
            timestamp: Utc::now(),
            payload: json!({"count": "not-a-number"}),
        };
        assert!(token.payload::<Payload>().is_err());
    }
}
