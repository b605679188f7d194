//! Step-up (secondary) authentication tickets.
//!
//! Each gated login that requires a second factor gets a short-lived
//! `Secondary` ticket scoped to the surface it supports. The ticket walks
//! created → challenged → completed | failed | expired; terminal
//! transitions remove it from the store, expiry falls out of the token
//! TTL. Completion is reported to the caller, which then performs the
//! resume action the ticket was created for (mint a session, or issue a
//! certificate for the bound challenge).

pub mod factor;
pub mod storage;

pub use factor::{BrokerFactorClient, FactorClient, FactorStatus};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errdata::ErrorData;
use crate::settings::Settings;
use crate::token::{self, TokenKind};
use crate::user::{self, User};
use crate::utils::rand_str;

pub const TOKEN_LEN: usize = 48;

/// Surface a ticket belongs to; a ticket cannot resume another surface.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryScope {
    Admin,
    User,
    Proxy,
    Keybase,
}

impl SecondaryScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Proxy => "proxy",
            Self::Keybase => "keybase",
        }
    }
}

/// Factor kinds a provider may offer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    Push,
    Phone,
    Passcode,
    Sms,
}

impl Factor {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Phone => "phone",
            Self::Passcode => "passcode",
            Self::Sms => "sms",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "push" => Some(Self::Push),
            "phone" => Some(Self::Phone),
            "passcode" => Some(Self::Passcode),
            "sms" => Some(Self::Sms),
            _ => None,
        }
    }
}

/// Configured secondary provider.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct SecondaryProvider {
    pub id: Uuid,
    pub kind: String,
    pub label: String,
    pub push_factor: bool,
    pub phone_factor: bool,
    pub passcode_factor: bool,
    pub sms_factor: bool,
}

impl SecondaryProvider {
    #[must_use]
    pub fn factor_enabled(&self, factor: Factor) -> bool {
        match factor {
            Factor::Push => self.push_factor,
            Factor::Phone => self.phone_factor,
            Factor::Passcode => self.passcode_factor,
            Factor::Sms => self.sms_factor,
        }
    }
}

/// Ticket progression persisted in the token payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryState {
    Created,
    Challenged,
}

#[derive(Debug, Serialize, Deserialize)]
struct SecondaryPayload {
    user_id: Uuid,
    scope: SecondaryScope,
    provider_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge_id: Option<String>,
    state: SecondaryState,
}

/// Body of a 201 step-up response telling the client which factors it may
/// answer with.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SecondaryData {
    pub token: String,
    pub label: String,
    pub push: bool,
    pub phone: bool,
    pub passcode: bool,
    pub sms: bool,
}

/// Outcome of one `handle` call.
#[derive(Debug)]
pub enum HandleOutcome {
    /// Terminal success; caller performs the resume action.
    Completed,
    /// Await more client input; the ticket is retained.
    Incomplete,
    /// Terminal failure.
    Rejected(ErrorData),
}

/// A live step-up ticket.
#[derive(Debug)]
pub struct Secondary {
    pub id: String,
    pub user_id: Uuid,
    pub scope: SecondaryScope,
    pub provider_id: Uuid,
    pub challenge_id: Option<String>,
    pub state: SecondaryState,
}

/// Create a ticket for a session login.
///
/// # Errors
/// Returns an error on store failure.
pub async fn new(
    pool: &PgPool,
    user_id: Uuid,
    scope: SecondaryScope,
    provider_id: Uuid,
) -> Result<Secondary> {
    create(pool, user_id, scope, provider_id, None).await
}

/// Create a ticket bound to a Keybase challenge; issuance resumes against
/// the challenge once the ticket completes.
///
/// # Errors
/// Returns an error on store failure.
pub async fn new_challenge(
    pool: &PgPool,
    user_id: Uuid,
    scope: SecondaryScope,
    challenge_id: &str,
    provider_id: Uuid,
) -> Result<Secondary> {
    create(pool, user_id, scope, provider_id, Some(challenge_id.to_string())).await
}

async fn create(
    pool: &PgPool,
    user_id: Uuid,
    scope: SecondaryScope,
    provider_id: Uuid,
    challenge_id: Option<String>,
) -> Result<Secondary> {
    let id = rand_str(TOKEN_LEN);
    let payload = SecondaryPayload {
        user_id,
        scope,
        provider_id,
        challenge_id: challenge_id.clone(),
        state: SecondaryState::Created,
    };
    token::put(pool, TokenKind::Secondary, &id, "", &payload).await?;
    Ok(Secondary {
        id,
        user_id,
        scope,
        provider_id,
        challenge_id,
        state: SecondaryState::Created,
    })
}

/// Fetch a live ticket by token and scope.
///
/// Expired tickets and tickets from another scope read as missing, which
/// handlers surface as `secondary_expired`.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get(
    pool: &PgPool,
    settings: &Settings,
    id: &str,
    scope: SecondaryScope,
) -> Result<Option<Secondary>> {
    let Some(tokn) =
        token::get(pool, TokenKind::Secondary, id, settings.secondary_ttl()).await?
    else {
        return Ok(None);
    };
    let payload: SecondaryPayload = tokn.payload()?;
    if payload.scope != scope {
        return Ok(None);
    }
    Ok(Some(Secondary {
        id: tokn.id,
        user_id: payload.user_id,
        scope: payload.scope,
        provider_id: payload.provider_id,
        challenge_id: payload.challenge_id,
        state: payload.state,
    }))
}

/// What `handle` should do for a factor attempt. Pure so the transition
/// table is testable without a store.
fn next_step(provider: &SecondaryProvider, factor: Factor, has_passcode: bool) -> Step {
    if !provider.factor_enabled(factor) {
        return Step::NotEnabled;
    }
    match factor {
        Factor::Passcode if !has_passcode => Step::AwaitPasscode,
        // First SMS leg only queues the message; the passcode comes later.
        Factor::Sms if !has_passcode => Step::Challenge,
        _ => Step::Verify,
    }
}

#[derive(Debug, Eq, PartialEq)]
enum Step {
    NotEnabled,
    AwaitPasscode,
    Challenge,
    Verify,
}

impl Secondary {
    /// Resolve the user this ticket authenticates.
    ///
    /// # Errors
    /// Returns an error on store failure or if the user is gone.
    pub async fn get_user(&self, pool: &PgPool) -> Result<User> {
        user::storage::get(pool, self.user_id)
            .await?
            .context("secondary user not found")
    }

    /// Factor data for the 201 response.
    ///
    /// # Errors
    /// Returns an error on store failure or if the provider is gone.
    pub async fn get_data(&self, pool: &PgPool) -> Result<SecondaryData> {
        let provider = storage::get_provider(pool, self.provider_id)
            .await?
            .context("secondary provider not found")?;
        Ok(SecondaryData {
            token: self.id.clone(),
            label: provider.label.clone(),
            push: provider.push_factor,
            phone: provider.phone_factor,
            passcode: provider.passcode_factor,
            sms: provider.sms_factor,
        })
    }

    /// Login-continuation query for redirect-based flows.
    ///
    /// # Errors
    /// Returns an error on store failure or if the provider is gone.
    pub async fn get_query(&self, pool: &PgPool) -> Result<String> {
        let data = self.get_data(pool).await?;
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("secondary", &data.token)
            .append_pair("label", &data.label)
            .append_pair("push", &data.push.to_string())
            .append_pair("phone", &data.phone.to_string())
            .append_pair("passcode", &data.passcode.to_string())
            .append_pair("sms", &data.sms.to_string());
        Ok(query.finish())
    }

    /// Run one step of the factor exchange.
    ///
    /// `Incomplete` keeps the ticket; every other outcome is terminal and
    /// removes it.
    ///
    /// # Errors
    /// Returns an error on store or mechanism failure.
    pub async fn handle(
        &mut self,
        pool: &PgPool,
        client: &dyn FactorClient,
        factor: &str,
        passcode: &str,
    ) -> Result<HandleOutcome> {
        let Some(factor) = Factor::from_str(factor) else {
            self.remove(pool).await?;
            return Ok(HandleOutcome::Rejected(ErrorData::authentication_error()));
        };

        let provider = storage::get_provider(pool, self.provider_id)
            .await?
            .context("secondary provider not found")?;

        match next_step(&provider, factor, !passcode.is_empty()) {
            Step::NotEnabled => {
                self.remove(pool).await?;
                return Ok(HandleOutcome::Rejected(ErrorData::unauthorized()));
            }
            Step::AwaitPasscode => {
                self.set_state(pool, SecondaryState::Challenged).await?;
                return Ok(HandleOutcome::Incomplete);
            }
            Step::Challenge => {
                let usr = self.get_user(pool).await?;
                client
                    .authenticate(&provider, &usr, factor, None)
                    .await?;
                self.set_state(pool, SecondaryState::Challenged).await?;
                return Ok(HandleOutcome::Incomplete);
            }
            Step::Verify => {}
        }

        let usr = self.get_user(pool).await?;
        let passcode = (!passcode.is_empty()).then_some(passcode);
        match client.authenticate(&provider, &usr, factor, passcode).await? {
            FactorStatus::Approved => {
                self.remove(pool).await?;
                Ok(HandleOutcome::Completed)
            }
            FactorStatus::Denied => {
                self.remove(pool).await?;
                Ok(HandleOutcome::Rejected(ErrorData::authentication_error()))
            }
            FactorStatus::Pending => {
                self.set_state(pool, SecondaryState::Challenged).await?;
                Ok(HandleOutcome::Incomplete)
            }
        }
    }

    async fn set_state(&mut self, pool: &PgPool, state: SecondaryState) -> Result<()> {
        self.state = state;
        let payload = SecondaryPayload {
            user_id: self.user_id,
            scope: self.scope,
            provider_id: self.provider_id,
            challenge_id: self.challenge_id.clone(),
            state,
        };
        token::update_payload(pool, TokenKind::Secondary, &self.id, &payload).await
    }

    /// Remove the ticket (terminal transition).
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub async fn remove(&self, pool: &PgPool) -> Result<()> {
        token::remove(pool, TokenKind::Secondary, &self.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::{Factor, SecondaryProvider, SecondaryScope, Step, next_step};
    use uuid::Uuid;

    fn provider() -> SecondaryProvider {
        SecondaryProvider {
            id: Uuid::new_v4(),
            kind: "duo".to_string(),
            label: "Duo".to_string(),
            push_factor: true,
            phone_factor: false,
            passcode_factor: true,
            sms_factor: true,
        }
    }

    #[test]
    fn scope_strings() {
        assert_eq!(SecondaryScope::Admin.as_str(), "admin");
        assert_eq!(SecondaryScope::Keybase.as_str(), "keybase");
    }

    #[test]
    fn disabled_factor_is_rejected() {
        assert_eq!(next_step(&provider(), Factor::Phone, false), Step::NotEnabled);
    }

    #[test]
    fn passcode_without_code_waits() {
        assert_eq!(
            next_step(&provider(), Factor::Passcode, false),
            Step::AwaitPasscode
        );
        assert_eq!(next_step(&provider(), Factor::Passcode, true), Step::Verify);
    }

    #[test]
    fn sms_first_leg_challenges_then_verifies() {
        assert_eq!(next_step(&provider(), Factor::Sms, false), Step::Challenge);
        assert_eq!(next_step(&provider(), Factor::Sms, true), Step::Verify);
    }

    #[test]
    fn push_verifies_immediately() {
        assert_eq!(next_step(&provider(), Factor::Push, false), Step::Verify);
    }

    #[test]
    fn factor_round_trip() {
        for factor in [Factor::Push, Factor::Phone, Factor::Passcode, Factor::Sms] {
            assert_eq!(Factor::from_str(factor.as_str()), Some(factor));
        }
        assert_eq!(Factor::from_str("bogus"), None);
    }
}
