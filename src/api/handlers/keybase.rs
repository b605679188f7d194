//! Keybase login and association endpoints on the user-portal surface.

use axum::Json;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use utoipa::ToSchema;

use super::{FactorData, error_data, internal_error};
use crate::agent::Agent;
use crate::audit::{self, AuditKind};
use crate::errdata::ErrorData;
use crate::keybase::{
    self, KeybaseClient, Notifier, association, challenge,
};
use crate::secondary::{self, FactorClient, HandleOutcome, SecondaryScope};
use crate::session::{Scope, cookie};
use crate::settings::Settings;
use crate::ssh;
use crate::user::User;

/// Long-poll budget; kept under the reverse proxy's 30 s read timeout.
const WAIT_BUDGET: Duration = Duration::from_secs(29);
const WAIT_POLL: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChallengeData {
    pub username: String,
    pub public_key: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChallengeResponse {
    pub token: String,
    pub message: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ValidateData {
    pub token: String,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AssociateData {
    pub username: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CertificateData {
    pub token: String,
    pub certificates: Vec<String>,
    pub certificate_authorities: Vec<String>,
    pub hosts: Vec<ssh::Host>,
}

#[utoipa::path(
    post,
    path = "/user/keybase/challenge",
    request_body = ChallengeData,
    responses(
        (status = 200, description = "Challenge created", body = ChallengeResponse),
        (status = 400, description = "Public key rejected", body = ErrorData)
    ),
    tag = "keybase"
)]
pub async fn challenge_post(
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    Json(data): Json<ChallengeData>,
) -> Response {
    match challenge::new_challenge(&pool, &settings, &data.username, &data.public_key).await {
        Ok(challenge::NewChallengeOutcome::Created(chal)) => (
            StatusCode::OK,
            Json(ChallengeResponse {
                token: chal.id.clone(),
                message: chal.message(),
            }),
        )
            .into_response(),
        Ok(challenge::NewChallengeOutcome::Rejected(err_data)) => {
            error_data(StatusCode::BAD_REQUEST, err_data)
        }
        Err(err) => internal_error("challenge creation failed", &err),
    }
}

#[utoipa::path(
    put,
    path = "/user/keybase/challenge",
    request_body = ValidateData,
    responses(
        (status = 200, description = "Certificates issued", body = CertificateData),
        (status = 201, description = "Secondary factor required", body = secondary::SecondaryData),
        (status = 404, description = "Unknown challenge"),
        (status = 406, description = "Challenge rejected", body = ErrorData)
    ),
    tag = "keybase"
)]
pub async fn challenge_put(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    keybase_client: Extension<Arc<KeybaseClient>>,
    Json(data): Json<ValidateData>,
) -> Response {
    let agent = Agent::parse(&headers);

    let mut chal = match challenge::get_challenge(&pool, &settings, &data.token).await {
        Ok(Some(chal)) => chal,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return internal_error("challenge lookup failed", &err),
    };

    let secondary_provider =
        match chal.validate(&pool, &keybase_client, &data.signature).await {
            Ok(challenge::ValidateOutcome::Approved { secondary }) => secondary,
            Ok(challenge::ValidateOutcome::Rejected(err_data)) => {
                return error_data(StatusCode::NOT_ACCEPTABLE, err_data);
            }
            Err(err) => return internal_error("challenge validation failed", &err),
        };

    if let Some(provider_id) = secondary_provider {
        let usr = match chal.get_user(&pool).await {
            Ok(Some(usr)) => usr,
            Ok(None) => return StatusCode::NOT_FOUND.into_response(),
            Err(err) => return internal_error("challenge user lookup failed", &err),
        };

        let secd = match secondary::new_challenge(
            &pool,
            usr.id,
            SecondaryScope::Keybase,
            &chal.id,
            provider_id,
        )
        .await
        {
            Ok(secd) => secd,
            Err(err) => return internal_error("secondary creation failed", &err),
        };

        return match secd.get_data(&pool).await {
            Ok(data) => (StatusCode::CREATED, Json(data)).into_response(),
            Err(err) => internal_error("secondary data lookup failed", &err),
        };
    }

    issue_certificates(&pool, &mut chal, &agent).await
}

#[utoipa::path(
    put,
    path = "/user/keybase/secondary",
    request_body = FactorData,
    responses(
        (status = 200, description = "Certificates issued", body = CertificateData),
        (status = 201, description = "Awaiting more factor input"),
        (status = 401, description = "Factor rejected or expired", body = ErrorData),
        (status = 404, description = "Unknown challenge")
    ),
    tag = "keybase"
)]
pub async fn secondary_put(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    factor_client: Extension<Arc<dyn FactorClient>>,
    Json(data): Json<FactorData>,
) -> Response {
    let agent = Agent::parse(&headers);

    let mut secd =
        match secondary::get(&pool, &settings, &data.token, SecondaryScope::Keybase).await {
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
            let Some(challenge_id) = secd.challenge_id.clone() else {
                return StatusCode::NOT_FOUND.into_response();
            };
            let mut chal = match challenge::get_challenge(&pool, &settings, &challenge_id).await
            {
                Ok(Some(chal)) => chal,
                Ok(None) => return StatusCode::NOT_FOUND.into_response(),
                Err(err) => return internal_error("challenge lookup failed", &err),
            };
            issue_certificates(&pool, &mut chal, &agent).await
        }
        Err(err) => internal_error("secondary handling failed", &err),
    }
}

#[utoipa::path(
    post,
    path = "/user/keybase/associate",
    request_body = AssociateData,
    responses(
        (status = 200, description = "Association created", body = ChallengeResponse)
    ),
    tag = "keybase"
)]
pub async fn associate_post(
    pool: Extension<PgPool>,
    Json(data): Json<AssociateData>,
) -> Response {
    match association::new_association(&pool, &data.username).await {
        Ok(asc) => (
            StatusCode::OK,
            Json(ChallengeResponse {
                token: asc.id.clone(),
                message: asc.message(),
            }),
        )
            .into_response(),
        Err(err) => internal_error("association creation failed", &err),
    }
}

#[utoipa::path(
    get,
    path = "/user/keybase/associate/{token}",
    params(("token" = String, Path, description = "Association token")),
    responses(
        (status = 200, description = "Association approved"),
        (status = 205, description = "Still pending, poll again"),
        (status = 401, description = "Association denied"),
        (status = 404, description = "Unknown association")
    ),
    tag = "keybase"
)]
pub async fn associate_get(
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    notifier: Extension<Arc<Notifier>>,
    Path(token): Path<String>,
) -> Response {
    let asc = match association::get_association(&pool, &settings, &token).await {
        Ok(Some(asc)) => asc,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return internal_error("association lookup failed", &err),
    };

    if let Some(response) = association_state(&asc.state) {
        return response;
    }

    // Cooperative wait: a local approve wakes us through the notifier, a
    // remote one lands within a poll tick. Total wait stays under the
    // proxy read timeout.
    let deadline = Instant::now() + WAIT_BUDGET;
    let (listener_id, mut wake) = notifier.register(&token);
    let mut ticker = tokio::time::interval(WAIT_POLL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Consume the immediate first tick.
    ticker.tick().await;

    let response = loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                break StatusCode::RESET_CONTENT.into_response();
            }
            _ = ticker.tick() => {}
            _ = wake.recv() => {}
        }

        match association::get_association(&pool, &settings, &token).await {
            Ok(Some(asc)) => {
                if let Some(response) = association_state(&asc.state) {
                    break response;
                }
            }
            Ok(None) => break StatusCode::NOT_FOUND.into_response(),
            Err(err) => break internal_error("association lookup failed", &err),
        }
    };

    notifier.unregister(&token, listener_id);
    response
}

fn association_state(state: &str) -> Option<Response> {
    match state {
        ssh::APPROVED => Some(StatusCode::OK.into_response()),
        ssh::DENIED => Some(StatusCode::UNAUTHORIZED.into_response()),
        _ => None,
    }
}

#[utoipa::path(
    get,
    path = "/user/keybase/info/{token}",
    params(("token" = String, Path, description = "Association token")),
    responses(
        (status = 200, description = "Keybase profile", body = keybase::Info),
        (status = 404, description = "Unknown association")
    ),
    tag = "keybase"
)]
pub async fn info_get(
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    keybase_client: Extension<Arc<KeybaseClient>>,
    Path(token): Path<String>,
) -> Response {
    let asc = match association::get_association(&pool, &settings, &token).await {
        Ok(Some(asc)) => asc,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return internal_error("association lookup failed", &err),
    };

    match asc.get_info(&keybase_client).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(err) => internal_error("keybase lookup failed", &err),
    }
}

#[utoipa::path(
    put,
    path = "/user/keybase/check",
    request_body = ValidateData,
    responses(
        (status = 200, description = "Signature valid and account exists"),
        (status = 400, description = "Signature rejected", body = ErrorData),
        (status = 404, description = "Unknown association or account")
    ),
    tag = "keybase"
)]
pub async fn check_put(
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    keybase_client: Extension<Arc<KeybaseClient>>,
    Json(data): Json<ValidateData>,
) -> Response {
    let asc = match association::get_association(&pool, &settings, &data.token).await {
        Ok(Some(asc)) => asc,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return internal_error("association lookup failed", &err),
    };

    match asc.validate(&keybase_client, &data.signature).await {
        Ok(association::ValidateOutcome::Valid) => {}
        Ok(association::ValidateOutcome::Rejected(err_data)) => {
            return error_data(StatusCode::BAD_REQUEST, err_data);
        }
        Err(err) => return internal_error("association validation failed", &err),
    }

    match crate::user::storage::get_keybase(&pool, &asc.username).await {
        Ok(Some(_)) => StatusCode::OK.into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => internal_error("user lookup failed", &err),
    }
}

#[utoipa::path(
    put,
    path = "/user/keybase/validate",
    request_body = ValidateData,
    responses(
        (status = 200, description = "Association approved"),
        (status = 400, description = "Approval rejected", body = ErrorData),
        (status = 401, description = "Not signed in"),
        (status = 404, description = "Unknown association"),
        (status = 406, description = "Signature rejected", body = ErrorData)
    ),
    tag = "keybase"
)]
pub async fn validate_put(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    keybase_client: Extension<Arc<KeybaseClient>>,
    notifier: Extension<Arc<Notifier>>,
    Json(data): Json<ValidateData>,
) -> Response {
    let agent = Agent::parse(&headers);

    let usr = match portal_user(&pool, &settings, &headers).await {
        Ok(Some(usr)) => usr,
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(err) => return internal_error("session lookup failed", &err),
    };

    let mut asc = match association::get_association(&pool, &settings, &data.token).await {
        Ok(Some(asc)) => asc,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return internal_error("association lookup failed", &err),
    };

    match asc.validate(&keybase_client, &data.signature).await {
        Ok(association::ValidateOutcome::Valid) => {}
        Ok(association::ValidateOutcome::Rejected(err_data)) => {
            return error_data(StatusCode::NOT_ACCEPTABLE, err_data);
        }
        Err(err) => return internal_error("association validation failed", &err),
    }

    if let Err(err) = audit::new(
        &pool,
        usr.id,
        &agent,
        AuditKind::KeybaseAssociationApprove,
        json!({ "keybase_username": asc.username }),
    )
    .await
    {
        return internal_error("audit write failed", &err);
    }

    match asc.approve(&pool, &keybase_client, &usr).await {
        Ok(association::ApproveOutcome::Approved) => {}
        Ok(association::ApproveOutcome::Rejected(err_data)) => {
            return error_data(StatusCode::BAD_REQUEST, err_data);
        }
        Err(err) => return internal_error("association approval failed", &err),
    }

    if let Err(err) = association::publish_change(&pool, &notifier, &asc.id).await {
        return internal_error("association publish failed", &err);
    }

    StatusCode::OK.into_response()
}

#[utoipa::path(
    delete,
    path = "/user/keybase/validate",
    request_body = ValidateData,
    responses(
        (status = 200, description = "Association denied"),
        (status = 400, description = "Signature rejected", body = ErrorData),
        (status = 401, description = "Not signed in"),
        (status = 404, description = "Unknown association")
    ),
    tag = "keybase"
)]
pub async fn validate_delete(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    settings: Extension<Arc<Settings>>,
    keybase_client: Extension<Arc<KeybaseClient>>,
    notifier: Extension<Arc<Notifier>>,
    Json(data): Json<ValidateData>,
) -> Response {
    let agent = Agent::parse(&headers);

    let usr = match portal_user(&pool, &settings, &headers).await {
        Ok(Some(usr)) => usr,
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(err) => return internal_error("session lookup failed", &err),
    };

    let mut asc = match association::get_association(&pool, &settings, &data.token).await {
        Ok(Some(asc)) => asc,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => return internal_error("association lookup failed", &err),
    };

    match asc.validate(&keybase_client, &data.signature).await {
        Ok(association::ValidateOutcome::Valid) => {}
        Ok(association::ValidateOutcome::Rejected(err_data)) => {
            return error_data(StatusCode::BAD_REQUEST, err_data);
        }
        Err(err) => return internal_error("association validation failed", &err),
    }

    if let Err(err) = audit::new(
        &pool,
        usr.id,
        &agent,
        AuditKind::KeybaseAssociationDeny,
        json!({ "keybase_username": asc.username }),
    )
    .await
    {
        return internal_error("audit write failed", &err);
    }

    if let Err(err) = asc.deny(&pool).await {
        return internal_error("association denial failed", &err);
    }

    if let Err(err) = association::publish_change(&pool, &notifier, &asc.id).await {
        return internal_error("association publish failed", &err);
    }

    StatusCode::OK.into_response()
}

/// Resolve the portal session user, if any.
async fn portal_user(
    pool: &PgPool,
    settings: &Settings,
    headers: &HeaderMap,
) -> anyhow::Result<Option<User>> {
    let session = cookie::authenticate(pool, settings, headers, Scope::User).await?;
    Ok(session.map(|(_, usr)| usr))
}

/// Issue certificates for a validated challenge and shape the response.
async fn issue_certificates(
    pool: &PgPool,
    chal: &mut challenge::Challenge,
    agent: &Agent,
) -> Response {
    match chal.new_certificate(pool, agent).await {
        Ok(challenge::CertificateOutcome::Issued(bundle)) => (
            StatusCode::OK,
            Json(CertificateData {
                token: chal.id.clone(),
                certificates: bundle.certificates,
                certificate_authorities: bundle.certificate_authorities,
                hosts: bundle.hosts,
            }),
        )
            .into_response(),
        Ok(challenge::CertificateOutcome::Unavailable(err_data)) => {
            error_data(StatusCode::NOT_ACCEPTABLE, err_data)
        }
        Err(err) => internal_error("certificate issuance failed", &err),
    }
}
