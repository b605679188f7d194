//! Identity resolution for local and external logins.

use anyhow::Result;
use sqlx::PgPool;

use crate::errdata::ErrorData;
use crate::event;
use crate::provider::{Provider, RoleManagement};
use crate::user::{self, User, UserKind};

/// Result of resolving an external identity to a user.
#[derive(Debug)]
pub enum ExternalOutcome {
    Resolved(User),
    Rejected(ErrorData),
}

/// Result of a local credential check.
#[derive(Debug)]
pub enum LocalOutcome {
    Authenticated(User),
    Rejected(ErrorData),
}

/// Verify local credentials.
///
/// An unknown username and a wrong password return the same denial, and
/// both paths run a full password verification so response time does not
/// disclose which one happened.
///
/// # Errors
/// Returns an error on store failure.
pub async fn local(pool: &PgPool, username: &str, password: &str) -> Result<LocalOutcome> {
    let usr = user::storage::get_username(pool, UserKind::Local, username).await?;

    let Some(usr) = usr else {
        // Burn a comparable verification against the dummy hash.
        let ghost = User::new(UserKind::Local, "missing", Vec::new());
        let _ = ghost.check_password(password);
        return Ok(LocalOutcome::Rejected(ErrorData::auth_invalid()));
    };

    if !usr.check_password(password) {
        return Ok(LocalOutcome::Rejected(ErrorData::auth_invalid()));
    }

    Ok(LocalOutcome::Authenticated(usr))
}

/// Map an external (provider, username) to a user.
///
/// Auto-provisions when the provider allows it, otherwise requires an
/// existing account. Existing accounts get their roles reconciled per the
/// provider's role-management mode; `user.change` is only published when
/// the role set actually changed.
///
/// # Errors
/// Returns an error on store failure.
pub async fn external(
    pool: &PgPool,
    prv: &Provider,
    username: &str,
    roles: Vec<String>,
) -> Result<ExternalOutcome> {
    let existing = user::storage::get_username(pool, prv.kind, username).await?;

    let Some(mut usr) = existing else {
        if !prv.auto_create {
            return Ok(ExternalOutcome::Rejected(ErrorData::unauthorized()));
        }

        let mut usr = User::new(prv.kind, username, roles);
        if let Some(err_data) = usr.validate() {
            return Ok(ExternalOutcome::Rejected(err_data));
        }
        user::storage::insert(pool, &usr).await?;
        event::publish_dispatch(pool, "user.change").await?;
        return Ok(ExternalOutcome::Resolved(usr));
    };

    let changed = match prv.role_management {
        RoleManagement::Merge => usr.roles_merge(&roles),
        RoleManagement::Overwrite => usr.roles_overwrite(&roles),
    };

    if changed {
        if let Some(err_data) = usr.validate() {
            return Ok(ExternalOutcome::Rejected(err_data));
        }
        user::storage::commit_roles(pool, &usr).await?;
        event::publish_dispatch(pool, "user.change").await?;
    }

    Ok(ExternalOutcome::Resolved(usr))
}
