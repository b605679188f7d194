//! HTTP handlers for the three login surfaces.

pub mod admin;
pub mod health;
pub mod host;
pub mod keybase;
pub mod portal;
pub mod proxy;
pub mod users;

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errdata::ErrorData;

/// Scheme and host the request arrived on, for building callback URLs.
pub(crate) fn location(headers: &HeaderMap) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("https");
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    format!("{proto}://{host}")
}

/// 4xx response carrying a structured `ErrorData` body.
pub(crate) fn error_data(status: StatusCode, data: ErrorData) -> Response {
    (status, Json(data)).into_response()
}

/// Log-and-500 for store or upstream failures. Never leaks the error body.
pub(crate) fn internal_error(context: &str, err: &anyhow::Error) -> Response {
    tracing::error!("{context}: {err:#}");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

/// Local credential login request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct AuthData {
    pub username: String,
    pub password: String,
}

/// Secondary factor submission.
#[derive(Debug, Deserialize, ToSchema)]
pub struct FactorData {
    pub token: String,
    #[serde(default)]
    pub factor: String,
    #[serde(default)]
    pub passcode: String,
}

/// Outcome of originating an SSO request.
pub(crate) enum SsoRequest {
    Redirect(String),
    NotFound,
    Error(anyhow::Error),
}

/// Resolve a provider selector (`google` or a provider id) and originate
/// the broker round trip.
pub(crate) async fn sso_request(
    pool: &sqlx::PgPool,
    broker: &crate::sso::BrokerClient,
    id: &str,
    location: &str,
    query: &str,
) -> SsoRequest {
    use crate::user::UserKind;

    if id == "google" {
        return match crate::sso::request(pool, broker, UserKind::Google, None, location, query)
            .await
        {
            Ok(url) => SsoRequest::Redirect(url),
            Err(err) => SsoRequest::Error(err),
        };
    }

    let Ok(provider_id) = id.parse::<uuid::Uuid>() else {
        return SsoRequest::NotFound;
    };
    let prv = match crate::provider::get(pool, provider_id).await {
        Ok(Some(prv)) => prv,
        Ok(None) => return SsoRequest::NotFound,
        Err(err) => return SsoRequest::Error(err),
    };

    match crate::sso::request(pool, broker, prv.kind, Some(&prv), location, query).await {
        Ok(url) => SsoRequest::Redirect(url),
        Err(err) => SsoRequest::Error(err),
    }
}

/// Remove one parameter from a raw query string.
pub(crate) fn strip_param(raw_query: &str, name: &str) -> String {
    raw_query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or_default();
            !pair.is_empty() && key != name
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Split a callback query into (signed portion, sig value). The broker
/// appends `sig` last, so everything before it is the signed input.
pub(crate) fn split_sig(raw_query: &str) -> (&str, &str) {
    match raw_query.split_once("&sig=") {
        Some((query, sig)) => (query, sig),
        None => (raw_query, ""),
    }
}

/// Provider entry of the auth state endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct StateProvider {
    pub id: String,
    pub kind: String,
    pub label: String,
}

/// Login surface description served before authentication.
#[derive(Debug, Serialize, ToSchema)]
pub struct AuthState {
    pub providers: Vec<StateProvider>,
}

#[cfg(test)]
mod tests {
    use super::{location, split_sig, strip_param};
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn location_from_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("gw.example.com"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(location(&headers), "https://gw.example.com");
    }

    #[test]
    fn location_defaults_to_https() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("gw.example.com"));
        assert_eq!(location(&headers), "https://gw.example.com");
    }

    #[test]
    fn split_sig_takes_signed_prefix() {
        let (query, sig) = split_sig("state=abc&username=alice&sig=AAA=");
        assert_eq!(query, "state=abc&username=alice");
        assert_eq!(sig, "AAA=");

        let (query, sig) = split_sig("state=abc");
        assert_eq!(query, "state=abc");
        assert_eq!(sig, "");
    }

    #[test]
    fn strip_param_removes_only_named() {
        assert_eq!(strip_param("id=google&next=%2Fapp", "id"), "next=%2Fapp");
        assert_eq!(strip_param("", "id"), "");
        assert_eq!(strip_param("a=1&b=2", "c"), "a=1&b=2");
    }
}
