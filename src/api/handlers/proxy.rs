//! Proxy-surface authentication endpoints.
//!
//! The reverse-proxy data plane consults these endpoints per service; the
//! service is addressed in the path so callbacks stay bound to it.

use axum::Json;
use axum::extract::{Extension, Path, Query, RawQuery};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    AuthData, FactorData, SsoRequest, error_data, internal_error, location, split_sig,
    sso_request, strip_param,
};
use crate::agent::Agent;
use crate::audit::{self, AuditKind};
use crate::errdata::ErrorData;
use crate::secondary::{self, FactorClient, HandleOutcome, SecondaryScope};
use crate::service;
use crate::session::{Scope, cookie, storage as session_storage};
use crate::settings::Settings;
use crate::sso::{self, BrokerClient, CallbackOutcome, resolver};
use crate::user::User;
use crate::validator::{self, Decision};

#[utoipa::path(
    post,
    path = "/proxy/{service_id}/auth/session",
    request_body = AuthData,
    responses(
        (status = 200, description = "Session created"),
        (status = 201, description = "Secondary factor required", body = secondary::SecondaryData),
        (status = 401, description = "Authentication failed", body = ErrorData),
        (status = 404, description = "Unknown service")
    ),
    tag = "proxy"
)]
pub async fn session_post(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    Path(service_id): Path<Uuid>,
    Json(data): Json<AuthData>,
) -> Response {
    let agent = Agent::parse(&headers);

    let srvc = match service::get(&pool, service_id).await {
        Ok(Some(srvc)) => srvc,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return internal_error("service lookup failed", &err),
    };

    let usr = match resolver::local(&pool, &data.username, &data.password).await {
        Ok(resolver::LocalOutcome::Authenticated(usr)) => usr,
        Ok(resolver::LocalOutcome::Rejected(err_data)) => {
            return error_data(StatusCode::UNAUTHORIZED, err_data);
        }
        Err(err) => return internal_error("local login failed", &err),
    };

    match validator::validate_proxy(&pool, &usr, false, &srvc, &agent).await {
        Ok(Decision::Denied(err_data)) => login_failed(&pool, &usr, &agent, err_data).await,
        Ok(Decision::Allowed {
            secondary: Some(provider_id),
        }) => secondary_challenge(&pool, &usr, provider_id).await,
        Ok(Decision::Allowed { secondary: None }) => {
            complete_login(&pool, &settings, &usr, &agent, "local", None).await
        }
        Err(err) => internal_error("proxy validation failed", &err),
    }
}

#[utoipa::path(
    post,
    path = "/proxy/{service_id}/auth/secondary",
    request_body = FactorData,
    responses(
        (status = 200, description = "Session created"),
        (status = 201, description = "Awaiting more factor input"),
        (status = 401, description = "Factor rejected or expired", body = ErrorData),
        (status = 404, description = "Unknown service")
    ),
    tag = "proxy"
)]
pub async fn secondary_post(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    factor_client: Extension<Arc<dyn FactorClient>>,
    Path(service_id): Path<Uuid>,
    Json(data): Json<FactorData>,
) -> Response {
    let agent = Agent::parse(&headers);

    let srvc = match service::get(&pool, service_id).await {
        Ok(Some(srvc)) => srvc,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return internal_error("service lookup failed", &err),
    };

    let mut secd =
        match secondary::get(&pool, &settings, &data.token, SecondaryScope::Proxy).await {
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

            match validator::validate_proxy(&pool, &usr, false, &srvc, &agent).await {
                Ok(Decision::Denied(err_data)) => {
                    login_failed(&pool, &usr, &agent, err_data).await
                }
                Ok(Decision::Allowed { .. }) => {
                    complete_login(&pool, &settings, &usr, &agent, "secondary", None).await
                }
                Err(err) => internal_error("proxy validation failed", &err),
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
    path = "/proxy/{service_id}/auth/request",
    params(("id" = String, Query, description = "Provider id, or `google`")),
    responses(
        (status = 302, description = "Redirect to the identity broker"),
        (status = 404, description = "Unknown provider or service")
    ),
    tag = "proxy"
)]
pub async fn request_get(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    broker: Extension<Arc<BrokerClient>>,
    Path(service_id): Path<Uuid>,
    Query(query): Query<RequestQuery>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    match service::get(&pool, service_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return internal_error("service lookup failed", &err),
    }

    let location = format!("{}/proxy/{service_id}", location(&headers));
    let forwarded = strip_param(raw_query.as_deref().unwrap_or_default(), "id");

    match sso_request(&pool, &broker, &query.id, &location, &forwarded).await {
        SsoRequest::Redirect(url) => Redirect::to(&url).into_response(),
        SsoRequest::NotFound => StatusCode::NOT_FOUND.into_response(),
        SsoRequest::Error(err) => internal_error("sso request failed", &err),
    }
}

#[utoipa::path(
    get,
    path = "/proxy/{service_id}/auth/callback",
    responses(
        (status = 302, description = "Login continued or completed"),
        (status = 401, description = "Callback rejected", body = ErrorData),
        (status = 404, description = "Unknown service")
    ),
    tag = "proxy"
)]
pub async fn callback_get(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    broker: Extension<Arc<BrokerClient>>,
    Path(service_id): Path<Uuid>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let agent = Agent::parse(&headers);

    let srvc = match service::get(&pool, service_id).await {
        Ok(Some(srvc)) => srvc,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return internal_error("service lookup failed", &err),
    };

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

    match validator::validate_proxy(&pool, &usr, false, &srvc, &agent).await {
        Ok(Decision::Denied(err_data)) => login_failed(&pool, &usr, &agent, err_data).await,
        Ok(Decision::Allowed {
            secondary: Some(provider_id),
        }) => {
            // Step-up required: redirect to the login continuation and stop.
            // No session exists until the secondary resumes.
            let secd =
                match secondary::new(&pool, usr.id, SecondaryScope::Proxy, provider_id).await {
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
        Err(err) => internal_error("proxy validation failed", &err),
    }
}

#[utoipa::path(
    get,
    path = "/proxy/{service_id}/logout",
    responses(
        (status = 302, description = "Session cleared, redirect to login")
    ),
    tag = "proxy"
)]
pub async fn logout_get(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
) -> Response {
    if let Some(session_id) = cookie::session_id(&headers, Scope::Proxy) {
        if let Err(err) = session_storage::remove(&pool, &session_id).await {
            return internal_error("session removal failed", &err);
        }
    }

    let mut response = Redirect::to("/login").into_response();
    if let Ok(cleared) = cookie::clear_cookie(Scope::Proxy, settings.cookie_secure()) {
        response.headers_mut().insert(SET_COOKIE, cleared);
    }
    response
}

async fn secondary_challenge(pool: &PgPool, usr: &User, provider_id: Uuid) -> Response {
    let secd = match secondary::new(pool, usr.id, SecondaryScope::Proxy, provider_id).await {
        Ok(secd) => secd,
        Err(err) => return internal_error("secondary creation failed", &err),
    };
    match secd.get_data(pool).await {
        Ok(data) => (StatusCode::CREATED, Json(data)).into_response(),
        Err(err) => internal_error("secondary data lookup failed", &err),
    }
}

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
        AuditKind::Login,
        json!({ "method": method }),
    )
    .await
    {
        return internal_error("audit write failed", &err);
    }

    let session = match session_storage::new(pool, usr.id, Scope::Proxy, agent).await {
        Ok(session) => session,
        Err(err) => return internal_error("session creation failed", &err),
    };

    let Ok(cookie) = cookie::new_cookie(Scope::Proxy, &session.id, settings.cookie_secure())
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
        AuditKind::LoginFailed,
        json!({ "error": err_data.error, "message": err_data.message }),
    )
    .await
    {
        return internal_error("audit write failed", &err);
    }
    error_data(StatusCode::UNAUTHORIZED, err_data)
}

#[cfg(test)]
mod tests {
    use crate::service::Service;
    use crate::user::{User, UserKind};
    use uuid::Uuid;

    #[test]
    fn service_role_intersection_matches_validator_gate() {
        let srvc = Service {
            id: Uuid::new_v4(),
            name: "wiki".to_string(),
            roles: vec!["ops".to_string()],
        };
        let usr = User::new(UserKind::Local, "alice", vec!["db".to_string()]);
        assert!(!usr.roles_match(&srvc.roles));

        let usr = User::new(UserKind::Local, "alice", vec!["ops".to_string()]);
        assert!(usr.roles_match(&srvc.roles));
    }
}
