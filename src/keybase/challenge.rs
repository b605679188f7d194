//! Keybase certificate challenges.
//!
//! A client posts its Keybase username and SSH public key, receives a
//! structured challenge message, signs it with Keybase and presents the
//! signature. Validation pins the account's Keybase primary-key id and
//! runs the authority policies before any certificate is signed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::client::KeybaseClient;
use crate::agent::Agent;
use crate::authority;
use crate::errdata::{ErrorData, FlowError};
use crate::policy;
use crate::settings::Settings;
use crate::ssh::{self, CertificateBundle};
use crate::token::{self, TokenKind};
use crate::user::{self, User};
use crate::utils::rand_str;

pub const CHALLENGE_TOKEN_LEN: usize = 48;
/// Challenge type tag carried inside the signed message.
pub const CERTIFICATE_CHALLENGE: &str = "ssh_certificate";

#[derive(Debug, Serialize, Deserialize)]
struct ChallengePayload {
    kind: String,
    username: String,
    pub_key: String,
    state: String,
}

/// A stored challenge.
#[derive(Debug)]
pub struct Challenge {
    pub id: String,
    pub kind: String,
    pub username: String,
    pub pub_key: String,
    /// Empty until answered; then `approved` or `unavailable`.
    pub state: String,
}

/// Result of creating a challenge.
#[derive(Debug)]
pub enum NewChallengeOutcome {
    Created(Challenge),
    Rejected(ErrorData),
}

/// Result of validating a challenge signature.
#[derive(Debug)]
pub enum ValidateOutcome {
    /// Signature and policy accepted; step-up required when set.
    Approved { secondary: Option<Uuid> },
    Rejected(ErrorData),
}

/// Result of certificate issuance against a validated challenge.
#[derive(Debug)]
pub enum CertificateOutcome {
    Issued(CertificateBundle),
    /// Approved but no authority matched the user.
    Unavailable(ErrorData),
}

/// Create and store a challenge.
///
/// # Errors
/// Returns an error on store failure.
pub async fn new_challenge(
    pool: &PgPool,
    settings: &Settings,
    username: &str,
    pub_key: &str,
) -> Result<NewChallengeOutcome> {
    let pub_key = pub_key.trim();
    if pub_key.len() > settings.ssh_pub_key_len() {
        return Ok(NewChallengeOutcome::Rejected(ErrorData::new(
            "invalid_public_key",
            "SSH public key too long",
        )));
    }

    let challenge = Challenge {
        id: rand_str(CHALLENGE_TOKEN_LEN),
        kind: CERTIFICATE_CHALLENGE.to_string(),
        username: username.to_string(),
        pub_key: pub_key.to_string(),
        state: String::new(),
    };
    let payload = ChallengePayload {
        kind: challenge.kind.clone(),
        username: challenge.username.clone(),
        pub_key: challenge.pub_key.clone(),
        state: String::new(),
    };
    token::put(pool, TokenKind::KeybaseChallenge, &challenge.id, "", &payload).await?;

    Ok(NewChallengeOutcome::Created(challenge))
}

/// Fetch a live challenge.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_challenge(
    pool: &PgPool,
    settings: &Settings,
    challenge_id: &str,
) -> Result<Option<Challenge>> {
    let Some(tokn) = token::get(
        pool,
        TokenKind::KeybaseChallenge,
        challenge_id,
        settings.keybase_ttl(),
    )
    .await?
    else {
        return Ok(None);
    };
    let payload: ChallengePayload = tokn.payload()?;
    Ok(Some(Challenge {
        id: tokn.id,
        kind: payload.kind,
        username: payload.username,
        pub_key: payload.pub_key,
        state: payload.state,
    }))
}

impl Challenge {
    /// The ASCII message the client signs with Keybase.
    #[must_use]
    pub fn message(&self) -> String {
        format!(
            "{}&{}&{}&{}",
            self.id, self.kind, self.username, self.pub_key
        )
    }

    /// Resolve the gateway user bound to the challenge's Keybase username.
    ///
    /// # Errors
    /// Returns an error on store failure.
    pub async fn get_user(&self, pool: &PgPool) -> Result<Option<User>> {
        user::storage::get_keybase(pool, &self.username).await
    }

    /// Verify the signature, pin the Keybase key id and run policy.
    ///
    /// # Errors
    /// Returns an error on store/API failure or when the challenge was
    /// already answered.
    pub async fn validate(
        &self,
        pool: &PgPool,
        client: &KeybaseClient,
        signature: &str,
    ) -> Result<ValidateOutcome> {
        if !self.state.is_empty() {
            return Err(FlowError::ChallengeAnswered.into());
        }

        let valid = client
            .verify_sig(&self.message(), signature, &self.username)
            .await?;
        if !valid {
            return Ok(ValidateOutcome::Rejected(ErrorData::new(
                "invalid_signature",
                "Keybase signature is invalid",
            )));
        }

        let Some(usr) = self.get_user(pool).await? else {
            return Ok(ValidateOutcome::Rejected(ErrorData::new(
                "invalid_keybase",
                "Keybase username is invalid",
            )));
        };

        let info = client.lookup(&self.username).await?;
        if info.ukbid != usr.keybase_id {
            return Ok(ValidateOutcome::Rejected(ErrorData::new(
                "keybase_id_changed",
                "Keybase identity has changed, contact administrator to reset",
            )));
        }

        let authorities = authority::get_user_authorities(pool, &usr).await?;
        let authority_ids: Vec<Uuid> = authorities.iter().map(|a| a.id).collect();
        let policies =
            policy::storage::get_authorities_roles(pool, &authority_ids, &usr.roles).await?;

        if policy::keybase_mode(&policies) == policy::KeybaseMode::Disabled {
            return Ok(ValidateOutcome::Rejected(ErrorData::new(
                "keybase_disabled",
                "Keybase cannot be used with this user",
            )));
        }

        let secondary = policy::select_secondary(&policies, |p| p.authority_secondary);
        Ok(ValidateOutcome::Approved { secondary })
    }

    /// Issue certificates for the challenge and record the terminal state.
    ///
    /// The state transition is compare-and-set from the unanswered state,
    /// so a raced duplicate request cannot issue twice.
    ///
    /// # Errors
    /// Returns an error on store failure, a missing user, or a lost race.
    pub async fn new_certificate(
        &mut self,
        pool: &PgPool,
        agent: &Agent,
    ) -> Result<CertificateOutcome> {
        let usr = self
            .get_user(pool)
            .await?
            .context("keybase challenge user not found")?;
        let authorities = authority::get_user_authorities(pool, &usr).await?;

        let bundle = ssh::new_certificate(&authorities, &usr, agent, &self.pub_key)?;

        let state = if bundle.certificates.is_empty() {
            ssh::UNAVAILABLE
        } else {
            ssh::APPROVED
        };

        let payload = ChallengePayload {
            kind: self.kind.clone(),
            username: self.username.clone(),
            pub_key: self.pub_key.clone(),
            state: state.to_string(),
        };
        let transitioned =
            token::transition_state(pool, TokenKind::KeybaseChallenge, &self.id, "", &payload)
                .await?;
        if !transitioned {
            return Err(FlowError::ChallengeAnswered.into());
        }
        self.state = state.to_string();

        if bundle.certificates.is_empty() {
            return Ok(CertificateOutcome::Unavailable(ErrorData::new(
                "certificate_unavailable",
                "Certification was approved but no certificates are available",
            )));
        }

        ssh::storage::insert(pool, &bundle).await?;
        Ok(CertificateOutcome::Issued(bundle))
    }
}

#[cfg(test)]
mod tests {
    use super::{CERTIFICATE_CHALLENGE, Challenge};

    #[test]
    fn message_layout_is_ampersand_joined() {
        let challenge = Challenge {
            id: "tok123".to_string(),
            kind: CERTIFICATE_CHALLENGE.to_string(),
            username: "alice".to_string(),
            pub_key: "ssh-ed25519 AAAA alice@laptop".to_string(),
            state: String::new(),
        };
        assert_eq!(
            challenge.message(),
            "tok123&ssh_certificate&alice&ssh-ed25519 AAAA alice@laptop"
        );
    }
}
