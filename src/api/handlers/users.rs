//! User management endpoints on the admin surface.

use axum::Json;
use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{error_data, internal_error};
use crate::errdata::ErrorData;
use crate::event;
use crate::session::{Scope, cookie};
use crate::settings::Settings;
use crate::user::{self, User};
use crate::validator::{self, Decision};

const PAGE_COUNT: i64 = 25;

#[derive(Debug, Deserialize, ToSchema)]
pub struct RemoveData {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserPage {
    pub users: Vec<User>,
    pub count: i64,
}

#[utoipa::path(
    get,
    path = "/admin/users",
    params(("page" = i64, Query, description = "Zero-based page")),
    responses(
        (status = 200, description = "Users", body = UserPage),
        (status = 401, description = "Not authorized")
    ),
    tag = "admin"
)]
pub async fn users_get(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    Query(query): Query<PageQuery>,
) -> Response {
    if let Some(response) = require_admin(&pool, &settings, &headers).await {
        return response;
    }

    match user::storage::get_all(&pool, query.page.max(0), PAGE_COUNT).await {
        Ok((users, count)) => {
            (StatusCode::OK, Json(UserPage { users, count })).into_response()
        }
        Err(err) => internal_error("user listing failed", &err),
    }
}

#[utoipa::path(
    delete,
    path = "/admin/users",
    request_body = RemoveData,
    responses(
        (status = 200, description = "Users removed"),
        (status = 400, description = "Would remove the last super administrator", body = ErrorData),
        (status = 401, description = "Not authorized")
    ),
    tag = "admin"
)]
pub async fn users_delete(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    Json(data): Json<RemoveData>,
) -> Response {
    if let Some(response) = require_admin(&pool, &settings, &headers).await {
        return response;
    }

    match user::storage::remove(&pool, &data.ids).await {
        Ok(Some(err_data)) => error_data(StatusCode::BAD_REQUEST, err_data),
        Ok(None) => {
            if let Err(err) = event::publish_dispatch(&pool, "user.change").await {
                return internal_error("event publish failed", &err);
            }
            StatusCode::OK.into_response()
        }
        Err(err) => internal_error("user removal failed", &err),
    }
}

/// Gate the request on an active admin session; `None` means proceed.
async fn require_admin(
    pool: &PgPool,
    settings: &Settings,
    headers: &HeaderMap,
) -> Option<Response> {
    let usr = match cookie::authenticate(pool, settings, headers, Scope::Admin).await {
        Ok(Some((_, usr))) => usr,
        Ok(None) => return Some(StatusCode::UNAUTHORIZED.into_response()),
        Err(err) => return Some(internal_error("session lookup failed", &err)),
    };

    match validator::validate_admin(pool, &usr, false).await {
        // Step-up already happened at login; an active admin session is
        // sufficient for management calls.
        Ok(Decision::Allowed { .. }) => None,
        Ok(Decision::Denied(err_data)) => {
            Some(error_data(StatusCode::UNAUTHORIZED, err_data))
        }
        Err(err) => Some(internal_error("admin validation failed", &err)),
    }
}
