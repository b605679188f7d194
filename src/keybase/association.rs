//! Keybase device associations.
//!
//! An unauthenticated device starts an association for a Keybase username
//! and long-polls its state; a logged-in portal user reviews the profile
//! and approves or denies it. Approval pins the account to the Keybase
//! username and its current primary-key id.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::client::{Info, KeybaseClient};
use super::notify::Notifier;
use crate::errdata::{ErrorData, FlowError};
use crate::event;
use crate::settings::Settings;
use crate::ssh;
use crate::token::{self, TokenKind};
use crate::user::{self, User};
use crate::utils::rand_str;

pub const ASSOCIATION_TOKEN_LEN: usize = 48;
pub const PENDING: &str = "pending";
/// Association type tag carried inside the signed message.
pub const ASSOCIATION_CHALLENGE: &str = "ssh_association";
/// Event channel shared by nodes so approvals wake remote long-polls.
pub const EVENT_CHANNEL: &str = "keybase_association";

#[derive(Debug, Serialize, Deserialize)]
struct AssociationPayload {
    username: String,
    state: String,
}

#[derive(Debug)]
pub struct Association {
    pub id: String,
    pub username: String,
    pub state: String,
}

/// Result of validating an association signature.
#[derive(Debug)]
pub enum ValidateOutcome {
    Valid,
    Rejected(ErrorData),
}

/// Result of approving an association.
#[derive(Debug)]
pub enum ApproveOutcome {
    Approved,
    Rejected(ErrorData),
}

/// Create and store an association in the pending state.
///
/// # Errors
/// Returns an error on store failure.
pub async fn new_association(pool: &PgPool, username: &str) -> Result<Association> {
    let association = Association {
        id: rand_str(ASSOCIATION_TOKEN_LEN),
        username: username.to_string(),
        state: PENDING.to_string(),
    };
    let payload = AssociationPayload {
        username: association.username.clone(),
        state: association.state.clone(),
    };
    token::put(
        pool,
        TokenKind::KeybaseAssociation,
        &association.id,
        "",
        &payload,
    )
    .await?;
    Ok(association)
}

/// Fetch a live association.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_association(
    pool: &PgPool,
    settings: &Settings,
    association_id: &str,
) -> Result<Option<Association>> {
    let Some(tokn) = token::get(
        pool,
        TokenKind::KeybaseAssociation,
        association_id,
        settings.keybase_ttl(),
    )
    .await?
    else {
        return Ok(None);
    };
    let payload: AssociationPayload = tokn.payload()?;
    Ok(Some(Association {
        id: tokn.id,
        username: payload.username,
        state: payload.state,
    }))
}

impl Association {
    /// The ASCII message the device signs with Keybase.
    #[must_use]
    pub fn message(&self) -> String {
        format!("{}&{}&{}", self.id, ASSOCIATION_CHALLENGE, self.username)
    }

    /// Fetch the Keybase profile shown to the approving user.
    ///
    /// # Errors
    /// Returns an error on API failure.
    pub async fn get_info(&self, client: &KeybaseClient) -> Result<Info> {
        client.lookup(&self.username).await
    }

    /// Verify the device's signature over the association message.
    ///
    /// # Errors
    /// Returns an error on API failure.
    pub async fn validate(
        &self,
        client: &KeybaseClient,
        signature: &str,
    ) -> Result<ValidateOutcome> {
        let valid = client
            .verify_sig(&self.message(), signature, &self.username)
            .await?;
        if valid {
            Ok(ValidateOutcome::Valid)
        } else {
            Ok(ValidateOutcome::Rejected(ErrorData::new(
                "invalid_signature",
                "Keybase signature is invalid",
            )))
        }
    }

    /// Approve: pin the approving user's account to the Keybase identity
    /// and mark the association approved.
    ///
    /// # Errors
    /// Returns an error on store/API failure or a lost race.
    pub async fn approve(
        &mut self,
        pool: &PgPool,
        client: &KeybaseClient,
        usr: &User,
    ) -> Result<ApproveOutcome> {
        let info = client.lookup(&self.username).await?;
        if info.ukbid.is_empty() {
            return Ok(ApproveOutcome::Rejected(ErrorData::new(
                "invalid_keybase",
                "Keybase username is invalid",
            )));
        }

        user::storage::commit_keybase(pool, usr.id, &self.username, &info.ukbid).await?;
        event::publish_dispatch(pool, "user.change").await?;

        self.transition(pool, ssh::APPROVED).await?;
        Ok(ApproveOutcome::Approved)
    }

    /// Deny the association.
    ///
    /// # Errors
    /// Returns an error on store failure or a lost race.
    pub async fn deny(&mut self, pool: &PgPool) -> Result<()> {
        self.transition(pool, ssh::DENIED).await
    }

    async fn transition(&mut self, pool: &PgPool, state: &str) -> Result<()> {
        let payload = AssociationPayload {
            username: self.username.clone(),
            state: state.to_string(),
        };
        let transitioned = token::transition_state(
            pool,
            TokenKind::KeybaseAssociation,
            &self.id,
            PENDING,
            &payload,
        )
        .await?;
        if !transitioned {
            return Err(FlowError::AssociationResolved.into());
        }
        self.state = state.to_string();
        Ok(())
    }
}

/// Publish the state change and wake local long-polls.
///
/// # Errors
/// Returns an error on store failure.
pub async fn publish_change(
    pool: &PgPool,
    notifier: &Notifier,
    association_id: &str,
) -> Result<()> {
    event::publish(
        pool,
        EVENT_CHANNEL,
        serde_json::json!({ "id": association_id }),
    )
    .await
    .context("failed to publish association change")?;
    notifier.notify(association_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ASSOCIATION_CHALLENGE, Association, PENDING};

    #[test]
    fn message_layout() {
        let association = Association {
            id: "tok".to_string(),
            username: "alice".to_string(),
            state: PENDING.to_string(),
        };
        assert_eq!(association.message(), "tok&ssh_association&alice");
        assert_eq!(ASSOCIATION_CHALLENGE, "ssh_association");
    }
}
