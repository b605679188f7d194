//! Management-console authentication endpoints.

use axum::Json;
use axum::extract::{Extension, Query, RawQuery};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    AuthData, AuthState, FactorData, SsoRequest, StateProvider, error_data, internal_error,
    location, split_sig, sso_request, strip_param,
};
use crate::agent::Agent;
use crate::audit::{self, AuditKind};
use crate::errdata::ErrorData;
use crate::provider;
use crate::secondary::{self, FactorClient, HandleOutcome, SecondaryScope};
use crate::session::{Scope, cookie, storage as session_storage};
use crate::settings::Settings;
use crate::sso::{self, BrokerClient, CallbackOutcome, resolver};
use crate::user::User;
use crate::validator::{self, Decision};

#[utoipa::path(
    get,
    path = "/admin/auth/state",
    responses(
        (status = 200, description = "Available login providers", body = AuthState)
    ),
    tag = "admin"
)]
pub async fn auth_state_get(pool: Extension<PgPool>) -> Response {
    match provider::get_all(&pool).await {
        Ok(providers) => {
            let providers = providers
                .into_iter()
                .map(|prv| StateProvider {
                    id: prv.id.to_string(),
                    kind: prv.kind.as_str().to_string(),
                    label: prv.label,
                })
                .collect();
            (StatusCode::OK, Json(AuthState { providers })).into_response()
        }
        Err(err) => internal_error("failed to list providers", &err),
    }
}

#[utoipa::path(
    post,
    path = "/admin/auth/session",
    request_body = AuthData,
    responses(
        (status = 200, description = "Session created"),
        (status = 201, description = "Secondary factor required", body = secondary::SecondaryData),
        (status = 401, description = "Authentication failed", body = ErrorData)
    ),
    tag = "admin"
)]
pub async fn session_post(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    Json(data): Json<AuthData>,
) -> Response {
    let agent = Agent::parse(&headers);

    let usr = match resolver::local(&pool, &data.username, &data.password).await {
        Ok(resolver::LocalOutcome::Authenticated(usr)) => usr,
        Ok(resolver::LocalOutcome::Rejected(err_data)) => {
            return error_data(StatusCode::UNAUTHORIZED, err_data);
        }
        Err(err) => return internal_error("local login failed", &err),
    };

    match validator::validate_admin(&pool, &usr, false).await {
        Ok(Decision::Denied(err_data)) => {
            login_failed(&pool, &usr, &agent, err_data).await
        }
        Ok(Decision::Allowed {
            secondary: Some(provider_id),
        }) => secondary_challenge(&pool, &usr, provider_id).await,
        Ok(Decision::Allowed { secondary: None }) => {
            complete_login(&pool, &settings, &usr, &agent, "local", None).await
        }
        Err(err) => internal_error("admin validation failed", &err),
    }
}

#[utoipa::path(
    post,
    path = "/admin/auth/secondary",
    request_body = FactorData,
    responses(
        (status = 200, description = "Session created"),
        (status = 201, description = "Awaiting more factor input"),
        (status = 401, description = "Factor rejected or expired", body = ErrorData)
    ),
    tag = "admin"
)]
pub async fn secondary_post(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    factor_client: Extension<Arc<dyn FactorClient>>,
    Json(data): Json<FactorData>,
) -> Response {
    let agent = Agent::parse(&headers);

    let mut secd =
        match secondary::get(&pool, &settings, &data.token, SecondaryScope::Admin).await {
            Ok(Some(secd)) => secd,
            Ok(None) => {
                return error_data(StatusCode::UNAUTHORIZED, ErrorData::secondary_expired());
            }
            Err(err) => return internal_error("secondary lookup failed", &err),
        };

    match secd
        .handle(&pool, factor_client.as_ref(), &data.factor, &data.passcode)
        .await
    {
        Ok(HandleOutcome::Incomplete) => StatusCode::CREATED.into_response(),
        Ok(HandleOutcome::Rejected(err_data)) => error_data(StatusCode::UNAUTHORIZED, err_data),
        Ok(HandleOutcome::Completed) => {
            let usr = match secd.get_user(&pool).await {
                Ok(usr) => usr,
                Err(err) => return internal_error("secondary user lookup failed", &err),
            };

            // The account may have changed mid-flow; gate again before the
            // session is minted.
            match validator::validate_admin(&pool, &usr, false).await {
                Ok(Decision::Denied(err_data)) => {
                    login_failed(&pool, &usr, &agent, err_data).await
                }
                Ok(Decision::Allowed { .. }) => {
                    complete_login(&pool, &settings, &usr, &agent, "secondary", None).await
                }
                Err(err) => internal_error("admin validation failed", &err),
            }
        }
        Err(err) => internal_error("secondary handling failed", &err),
    }
}

#[derive(Debug, Deserialize)]
pub struct RequestQuery {
    id: String,
}

#[utoipa::path(
    get,
    path = "/admin/auth/request",
    params(("id" = String, Query, description = "Provider id, or `google`")),
    responses(
        (status = 302, description = "Redirect to the identity broker"),
        (status = 404, description = "Unknown provider")
    ),
    tag = "admin"
)]
pub async fn request_get(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    broker: Extension<Arc<BrokerClient>>,
    Query(query): Query<RequestQuery>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let location = format!("{}/admin", location(&headers));
    // Forward the request query minus the provider selector.
    let forwarded = strip_param(raw_query.as_deref().unwrap_or_default(), "id");

    match sso_request(&pool, &broker, &query.id, &location, &forwarded).await {
        SsoRequest::Redirect(url) => Redirect::to(&url).into_response(),
        SsoRequest::NotFound => StatusCode::NOT_FOUND.into_response(),
        SsoRequest::Error(err) => internal_error("sso request failed", &err),
    }
}

#[utoipa::path(
    get,
    path = "/admin/auth/callback",
    responses(
        (status = 302, description = "Login continued or completed"),
        (status = 401, description = "Callback rejected", body = ErrorData)
    ),
    tag = "admin"
)]
pub async fn callback_get(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    broker: Extension<Arc<BrokerClient>>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let agent = Agent::parse(&headers);
    let raw_query = raw_query.unwrap_or_default();
    let (query, sig) = split_sig(&raw_query);

    let usr = match sso::callback(&pool, &settings, &broker, sig, query).await {
        Ok(CallbackOutcome::Authenticated { user, .. }) => user,
        Ok(CallbackOutcome::Rejected(err_data)) => {
            return error_data(StatusCode::UNAUTHORIZED, err_data);
        }
        Ok(CallbackOutcome::UnknownState) => return Redirect::to("/").into_response(),
        Err(err) => return internal_error("sso callback failed", &err),
    };

    match validator::validate_admin(&pool, &usr, false).await {
        Ok(Decision::Denied(err_data)) => login_failed(&pool, &usr, &agent, err_data).await,
        Ok(Decision::Allowed {
            secondary: Some(provider_id),
        }) => {
            let secd =
                match secondary::new(&pool, usr.id, SecondaryScope::Admin, provider_id).await {
                    Ok(secd) => secd,
                    Err(err) => return internal_error("secondary creation failed", &err),
                };
            match secd.get_query(&pool).await {
                Ok(query) => Redirect::to(&format!("/login?{query}")).into_response(),
                Err(err) => internal_error("secondary data lookup failed", &err),
            }
        }
        Ok(Decision::Allowed { secondary: None }) => {
            complete_login(&pool, &settings, &usr, &agent, "sso", Some("/")).await
        }
        Err(err) => internal_error("admin validation failed", &err),
    }
}

#[utoipa::path(
    get,
    path = "/admin/logout",
    responses(
        (status = 302, description = "Session cleared, redirect to login")
    ),
    tag = "admin"
)]
pub async fn logout_get(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
) -> Response {
    if let Some(session_id) = cookie::session_id(&headers, Scope::Admin) {
        if let Err(err) = session_storage::remove(&pool, &session_id).await {
            return internal_error("session removal failed", &err);
        }
    }

    // Always clear the cookie, even when no session row was found.
    let mut response = Redirect::to("/login").into_response();
    if let Ok(cleared) = cookie::clear_cookie(Scope::Admin, settings.cookie_secure()) {
        response.headers_mut().insert(SET_COOKIE, cleared);
    }
    response
}

/// Issue a step-up challenge response (201 with factor data).
async fn secondary_challenge(pool: &PgPool, usr: &User, provider_id: Uuid) -> Response {
    let secd = match secondary::new(pool, usr.id, SecondaryScope::Admin, provider_id).await {
        Ok(secd) => secd,
        Err(err) => return internal_error("secondary creation failed", &err),
    };
    match secd.get_data(pool).await {
        Ok(data) => (StatusCode::CREATED, Json(data)).into_response(),
        Err(err) => internal_error("secondary data lookup failed", &err),
    }
}

/// Audit the login and mint the admin session cookie; redirects instead of
/// returning 200 when `redirect` is set.
async fn complete_login(
    pool: &PgPool,
    settings: &Settings,
    usr: &User,
    agent: &Agent,
    method: &str,
    redirect: Option<&str>,
) -> Response {
    if let Err(err) = audit::new(
        pool,
        usr.id,
        agent,
        AuditKind::AdminLogin,
        json!({ "method": method }),
    )
    .await
    {
        return internal_error("audit write failed", &err);
    }

    let session = match session_storage::new(pool, usr.id, Scope::Admin, agent).await {
        Ok(session) => session,
        Err(err) => return internal_error("session creation failed", &err),
    };

    let Ok(cookie) = cookie::new_cookie(Scope::Admin, &session.id, settings.cookie_secure())
    else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let mut response = match redirect {
        Some(target) => Redirect::to(target).into_response(),
        None => StatusCode::OK.into_response(),
    };
    response.headers_mut().insert(SET_COOKIE, cookie);
    response
}

async fn login_failed(
    pool: &PgPool,
    usr: &User,
    agent: &Agent,
    err_data: ErrorData,
) -> Response {
    if let Err(err) = audit::new(
        pool,
        usr.id,
        agent,
        AuditKind::AdminLoginFailed,
        json!({ "error": err_data.error, "message": err_data.message }),
    )
    .await
    {
        return internal_error("audit write failed", &err);
    }
    error_data(StatusCode::UNAUTHORIZED, err_data)
}

