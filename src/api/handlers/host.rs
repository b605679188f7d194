//! Host certificate issuance for node agents.
//!
//! Node agents authenticate with an authority host token and a one-shot
//! nonce; with strict host checking enabled the authority probes the
//! host's challenge endpoint before signing.

use axum::Json;
use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use utoipa::ToSchema;

use super::{error_data, internal_error};
use crate::authority;
use crate::errdata::ErrorData;
use crate::nonce;
use crate::settings::Settings;

#[derive(Debug, Deserialize, ToSchema)]
pub struct HostCertificateData {
    pub token: String,
    pub nonce: String,
    pub hostname: String,
    #[serde(default)]
    pub port: u16,
    pub public_key: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HostCertificateResponse {
    pub certificate: String,
}

#[utoipa::path(
    post,
    path = "/ssh/host",
    request_body = HostCertificateData,
    responses(
        (status = 200, description = "Host certificate issued", body = HostCertificateResponse),
        (status = 401, description = "Token, nonce or host validation failed", body = ErrorData),
        (status = 400, description = "Public key rejected", body = ErrorData)
    ),
    tag = "ssh"
)]
pub async fn host_post(
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    Json(data): Json<HostCertificateData>,
) -> Response {
    let public_key = data.public_key.trim();
    if public_key.len() > settings.ssh_pub_key_len() {
        return error_data(
            StatusCode::BAD_REQUEST,
            ErrorData::new("invalid_public_key", "SSH public key too long"),
        );
    }

    match nonce::validate(&pool, &data.nonce).await {
        Ok(true) => {}
        Ok(false) => {
            return error_data(StatusCode::UNAUTHORIZED, ErrorData::authentication_error());
        }
        Err(err) => return internal_error("nonce validation failed", &err),
    }

    let authority = match authority::get_token_authority(&pool, &data.token).await {
        Ok(Some(authority)) => authority,
        Ok(None) => {
            return error_data(StatusCode::UNAUTHORIZED, ErrorData::authentication_error());
        }
        Err(err) => return internal_error("authority lookup failed", &err),
    };

    if authority.strict_host_checking {
        let valid = authority
            .hostname_validate(
                &data.hostname,
                data.port,
                public_key,
                settings.ssh_pub_key_len(),
            )
            .await;
        if !valid {
            // The authority key is never touched on a failed probe.
            return error_data(StatusCode::UNAUTHORIZED, ErrorData::authentication_error());
        }
    }

    match authority.create_host_certificate(&data.hostname, public_key) {
        Ok(signed) => (
            StatusCode::OK,
            Json(HostCertificateResponse {
                certificate: signed.marshaled,
            }),
        )
            .into_response(),
        Err(err) => internal_error("host certificate signing failed", &err),
    }
}
