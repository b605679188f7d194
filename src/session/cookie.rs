//! Session cookies for the three surfaces.

use anyhow::Result;
use axum::http::header::{COOKIE, InvalidHeaderValue};
use axum::http::{HeaderMap, HeaderValue};
use chrono::Utc;
use sqlx::PgPool;

use super::{Scope, Session, storage};
use crate::settings::Settings;
use crate::user::{self, User};

/// Build the `Set-Cookie` value carrying a session id.
///
/// # Errors
/// Returns an error if the id contains bytes invalid in a header.
pub fn new_cookie(
    scope: Scope,
    session_id: &str,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let name = scope.cookie_name();
    let mut cookie = format!("{name}={session_id}; Path=/; HttpOnly; SameSite=Lax");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// Build the `Set-Cookie` value that clears a scope's cookie.
///
/// # Errors
/// Returns an error if the header value cannot be built.
pub fn clear_cookie(scope: Scope, secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    let name = scope.cookie_name();
    let mut cookie = format!("{name}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// Extract a scope's session id from the request cookies.
#[must_use]
pub fn session_id(headers: &HeaderMap, scope: Scope) -> Option<String> {
    let header = headers.get(COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == scope.cookie_name() && !val.is_empty() {
            return Some(val.to_string());
        }
    }
    None
}

/// Resolve the request's cookie into an active session and its user.
///
/// Inactive, removed or unknown sessions all read as `None`; resolving the
/// user bumps its `last_active` in the same round trip.
///
/// # Errors
/// Returns an error on store failure.
pub async fn authenticate(
    pool: &PgPool,
    settings: &Settings,
    headers: &HeaderMap,
    scope: Scope,
) -> Result<Option<(Session, User)>> {
    let Some(id) = session_id(headers, scope) else {
        return Ok(None);
    };

    let Some(session) = storage::get(pool, scope, &id).await? else {
        return Ok(None);
    };

    if !session.active(settings, Utc::now()) {
        return Ok(None);
    }

    let Some(usr) = user::storage::get_update(pool, session.user_id).await? else {
        return Ok(None);
    };

    storage::touch(pool, &session.id).await?;

    Ok(Some((session, usr)))
}

#[cfg(test)]
mod tests {
    use super::{clear_cookie, new_cookie, session_id};
    use crate::session::Scope;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn cookie_attributes() {
        let cookie = new_cookie(Scope::Admin, "abc123", true).expect("cookie");
        let value = cookie.to_str().expect("str");
        assert!(value.starts_with("admin=abc123"));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("SameSite=Lax"));
        assert!(value.contains("Path=/"));
        assert!(value.contains("Secure"));

        let insecure = new_cookie(Scope::Proxy, "abc123", false).expect("cookie");
        assert!(!insecure.to_str().expect("str").contains("Secure"));
    }

    #[test]
    fn clear_cookie_zeroes_value_and_age() {
        let cookie = clear_cookie(Scope::User, true).expect("cookie");
        let value = cookie.to_str().expect("str");
        assert!(value.starts_with("user=;"));
        assert!(value.contains("Max-Age=0"));
    }

    #[test]
    fn session_id_parses_matching_scope_only() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            HeaderValue::from_static("theme=dark; admin=sess-a; user=sess-u"),
        );
        assert_eq!(session_id(&headers, Scope::Admin).as_deref(), Some("sess-a"));
        assert_eq!(session_id(&headers, Scope::User).as_deref(), Some("sess-u"));
        assert_eq!(session_id(&headers, Scope::Proxy), None);
    }
}
