//! Validator facade gating the three surfaces.
//!
//! Combines the disabled/administrator checks, the policy rules and the
//! secondary-factor selection into a single decision per request.

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::agent::Agent;
use crate::errdata::ErrorData;
use crate::policy::{self, Policy};
use crate::service::Service;
use crate::user::User;

/// Gate decision for a request.
#[derive(Debug)]
pub enum Decision {
    /// Proceed; step-up first when a secondary provider is set.
    Allowed { secondary: Option<Uuid> },
    Denied(ErrorData),
}

impl Decision {
    #[must_use]
    pub fn allowed() -> Self {
        Self::Allowed { secondary: None }
    }
}

/// Gate a management-console request. Only enabled super administrators
/// pass; API tokens skip the policy step-up.
///
/// # Errors
/// Returns an error on store failure.
pub async fn validate_admin(
    pool: &PgPool,
    usr: &User,
    is_api: bool,
) -> Result<Decision> {
    if usr.disabled || !usr.is_super() {
        return Ok(Decision::Denied(ErrorData::unauthorized()));
    }

    if is_api {
        return Ok(Decision::allowed());
    }

    let policies = policy::storage::get_roles(pool, &usr.roles).await?;
    let secondary = policy::select_secondary(&policies, |p| p.admin_secondary);
    Ok(Decision::Allowed { secondary })
}

/// Gate a user-portal request.
///
/// # Errors
/// Returns an error on store failure.
pub async fn validate_user(
    pool: &PgPool,
    usr: &User,
    is_api: bool,
    agent: &Agent,
) -> Result<Decision> {
    if usr.disabled {
        return Ok(Decision::Denied(ErrorData::unauthorized()));
    }

    if is_api {
        return Ok(Decision::allowed());
    }

    let policies = policy::storage::get_roles(pool, &usr.roles).await?;
    if let Some(denied) = run_rules(&policies, agent) {
        return Ok(Decision::Denied(denied));
    }

    let secondary = policy::select_secondary(&policies, |p| p.user_secondary);
    Ok(Decision::Allowed { secondary })
}

/// Gate a proxy request for a service.
///
/// The user must share a role with the service; then service-scoped
/// policies run ahead of role-scoped ones, and the first non-empty proxy
/// secondary across both (in that order) wins.
///
/// # Errors
/// Returns an error on store failure.
pub async fn validate_proxy(
    pool: &PgPool,
    usr: &User,
    is_api: bool,
    service: &Service,
    agent: &Agent,
) -> Result<Decision> {
    if usr.disabled {
        return Ok(Decision::Denied(ErrorData::unauthorized()));
    }

    if !usr.roles_match(&service.roles) {
        return Ok(Decision::Denied(ErrorData::service_unauthorized()));
    }

    if is_api {
        return Ok(Decision::allowed());
    }

    let mut policies = policy::storage::get_service(pool, service.id).await?;
    policies.extend(policy::storage::get_roles(pool, &usr.roles).await?);

    if let Some(denied) = run_rules(&policies, agent) {
        return Ok(Decision::Denied(denied));
    }

    let secondary = policy::select_secondary(&policies, |p| p.proxy_secondary);
    Ok(Decision::Allowed { secondary })
}

fn run_rules(policies: &[Policy], agent: &Agent) -> Option<ErrorData> {
    let now = Utc::now();
    policies
        .iter()
        .find_map(|policy| policy.validate_request(agent, now))
}

#[cfg(test)]
mod tests {
    use super::Decision;
    use crate::errdata::ErrorData;

    #[test]
    fn allowed_constructor_has_no_secondary() {
        match Decision::allowed() {
            Decision::Allowed { secondary } => assert!(secondary.is_none()),
            Decision::Denied(_) => panic!("expected allowed"),
        }
    }

    #[test]
    fn denied_carries_error_data() {
        let decision = Decision::Denied(ErrorData::unauthorized());
        match decision {
            Decision::Denied(err) => assert_eq!(err.error, "unauthorized"),
            Decision::Allowed { .. } => panic!("expected denied"),
        }
    }
}
