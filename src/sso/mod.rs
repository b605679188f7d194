//! SSO handshake.
//!
//! `request` originates a broker round trip bound to a single-use state
//! token; `callback` verifies the broker's HMAC-SHA512 signature over the
//! raw callback query, consumes the state token (single winner under
//! concurrency) and resolves the external identity to a user.

pub mod broker;
pub mod resolver;

pub use broker::BrokerClient;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errdata::ErrorData;
use crate::provider::{self, Provider};
use crate::settings::Settings;
use crate::token::{self, TokenKind};
use crate::user::{User, UserKind};
use crate::utils::{rand_str, secrets_equal};

const STATE_LEN: usize = 64;
const SECRET_LEN: usize = 64;

type HmacSha512 = Hmac<Sha512>;

/// Payload stored with an `sso-state` token.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatePayload {
    pub kind: UserKind,
    pub provider: Option<Uuid>,
    /// Original request query, replayed to the client after login.
    pub query: String,
}

/// Result of a callback attempt.
#[derive(Debug)]
pub enum CallbackOutcome {
    /// Identity resolved; `query` is the originating request query.
    Authenticated { user: User, query: String },
    Rejected(ErrorData),
    /// Missing, expired or already-consumed state token.
    UnknownState,
}

/// Originate an SSO login via the broker.
///
/// Stores the state token after the broker accepts the request, so an
/// unreachable broker leaves nothing behind.
///
/// # Errors
/// Returns an error on broker or store failure.
pub async fn request(
    pool: &PgPool,
    broker: &BrokerClient,
    kind: UserKind,
    prv: Option<&Provider>,
    location: &str,
    query: &str,
) -> Result<String> {
    let state = rand_str(STATE_LEN);
    let secret = rand_str(SECRET_LEN);
    let callback = format!("{location}/auth/callback");

    let redirect = broker.request(kind, prv, &callback, &state, &secret).await?;

    let payload = StatePayload {
        kind,
        provider: prv.map(|p| p.id),
        query: query.to_string(),
    };
    token::put(pool, TokenKind::SsoState, &state, &secret, &payload).await?;

    Ok(redirect)
}

/// Compute the URL-safe base64 HMAC-SHA512 signature of a raw query.
///
/// # Errors
/// Never fails for non-empty secrets; kept fallible for the HMAC API.
pub fn sign_query(secret: &str, raw_query: &str) -> Result<String> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|err| anyhow::anyhow!("invalid hmac key: {err}"))?;
    mac.update(raw_query.as_bytes());
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

/// Handle an SSO callback.
///
/// `raw_query` must be the callback query string with the `sig` parameter
/// already stripped; the signature covers every remaining byte, so any
/// mutation of the query invalidates the callback.
///
/// # Errors
/// Returns an error on store/broker failure.
pub async fn callback(
    pool: &PgPool,
    settings: &Settings,
    broker: &BrokerClient,
    sig: &str,
    raw_query: &str,
) -> Result<CallbackOutcome> {
    let params: Vec<(String, String)> = url::form_urlencoded::parse(raw_query.as_bytes())
        .into_owned()
        .collect();
    let param = |name: &str| {
        params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .unwrap_or_default()
    };

    let state = param("state");
    let Some(tokn) =
        token::get(pool, TokenKind::SsoState, state, settings.sso_state_ttl()).await?
    else {
        return Ok(CallbackOutcome::UnknownState);
    };
    let payload: StatePayload = tokn.payload()?;

    let expected = sign_query(&tokn.secret, raw_query)?;
    if !secrets_equal(sig, &expected) {
        return Ok(CallbackOutcome::Rejected(ErrorData::authentication_error()));
    }

    let mut username = param("username").to_string();
    if username.is_empty() {
        return Ok(CallbackOutcome::Rejected(ErrorData::invalid_username()));
    }

    // Google logins carry no provider id; the account domain picks it.
    let prv = if payload.kind == UserKind::Google {
        let domain = username.split_once('@').map(|(_, d)| d).unwrap_or_default();
        match provider::get_google_domain(pool, domain).await? {
            Some(prv) => prv,
            None => return Ok(CallbackOutcome::Rejected(ErrorData::unauthorized())),
        }
    } else {
        let Some(provider_id) = payload.provider else {
            return Ok(CallbackOutcome::UnknownState);
        };
        provider::get(pool, provider_id)
            .await?
            .context("auth provider not found")?
    };

    if prv.kind == UserKind::Azure {
        let Some((tenant, rest)) = username.split_once('/') else {
            return Ok(CallbackOutcome::Rejected(ErrorData::invalid_username()));
        };
        if tenant != prv.tenant {
            return Ok(CallbackOutcome::Rejected(ErrorData::invalid_tenant()));
        }
        username = rest.to_string();
    }

    // Single-winner gate: of two concurrent callbacks with the same state,
    // only the one that consumes the token proceeds.
    if token::consume(pool, TokenKind::SsoState, state, settings.sso_state_ttl())
        .await?
        .is_none()
    {
        return Ok(CallbackOutcome::UnknownState);
    }

    let mut roles: Vec<String> = prv.default_roles.clone();
    for role in param("roles").split(',') {
        if !role.is_empty() {
            roles.push(role.to_string());
        }
    }

    if prv.kind == UserKind::Google {
        roles.extend(broker.google_roles(&prv, &username).await?);
    }

    match resolver::external(pool, &prv, &username, roles).await? {
        resolver::ExternalOutcome::Resolved(user) => Ok(CallbackOutcome::Authenticated {
            user,
            query: payload.query,
        }),
        resolver::ExternalOutcome::Rejected(err_data) => Ok(CallbackOutcome::Rejected(err_data)),
    }
}

#[cfg(test)]
mod tests {
    use super::sign_query;
    use crate::utils::secrets_equal;

    #[test]
    fn signature_is_deterministic_urlsafe_base64() {
        let sig = sign_query("secret", "state=abc&username=alice").expect("sign");
        let again = sign_query("secret", "state=abc&username=alice").expect("sign");
        assert_eq!(sig, again);
        // SHA-512 output is 64 bytes, padded base64 of which is 88 chars.
        assert_eq!(sig.len(), 88);
        assert!(
            sig.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '=')
        );
    }

    #[test]
    fn tampered_query_breaks_signature() {
        let secret = "secret";
        let original = "state=abc&username=alice&roles=ops";
        let sig = sign_query(secret, original).expect("sign");

        let tampered = "state=abc&username=bob&roles=ops";
        let tampered_sig = sign_query(secret, tampered).expect("sign");
        assert!(!secrets_equal(&sig, &tampered_sig));
    }

    #[test]
    fn different_secrets_produce_different_signatures() {
        let query = "state=abc&username=alice";
        let a = sign_query("secret-a", query).expect("sign");
        let b = sign_query("secret-b", query).expect("sign");
        assert_ne!(a, b);
    }
}
