//! Structured wire errors shared by every authentication flow.
//!
//! Flows distinguish a hard failure (`anyhow::Error`) from a user-visible
//! denial (`ErrorData`, serialized as `{error, message}`). Progress and
//! redirect signals are expressed as outcome enum variants on the flow
//! functions themselves.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// User-visible denial, returned as a JSON body on 4xx responses.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ErrorData {
    pub error: String,
    pub message: String,
}

impl ErrorData {
    #[must_use]
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn auth_invalid() -> Self {
        Self::new("auth_invalid", "Authentication credentials are invalid")
    }

    #[must_use]
    pub fn unauthorized() -> Self {
        Self::new("unauthorized", "Not authorized")
    }

    #[must_use]
    pub fn invalid_username() -> Self {
        Self::new("invalid_username", "Invalid username")
    }

    #[must_use]
    pub fn invalid_tenant() -> Self {
        Self::new("invalid_tenant", "Invalid tenant")
    }

    #[must_use]
    pub fn authentication_error() -> Self {
        Self::new("authentication_error", "Authentication error occurred")
    }

    #[must_use]
    pub fn secondary_expired() -> Self {
        Self::new(
            "secondary_expired",
            "Two-factor authentication has expired, try again",
        )
    }

    #[must_use]
    pub fn service_unauthorized() -> Self {
        Self::new("service_unauthorized", "Not authorized for service")
    }

    #[must_use]
    pub fn user_remove_super() -> Self {
        Self::new(
            "user_remove_super",
            "Cannot remove all super administrators",
        )
    }

    #[must_use]
    pub fn host_domain_required() -> Self {
        Self::new(
            "host_domain_required",
            "Host domain must be set for host certificates",
        )
    }
}

/// Terminal-state conflicts raised when a single-use flow token is
/// answered twice; surfaced as plain errors, never as a denial the caller
/// could retry.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("keybase challenge has already been answered")]
    ChallengeAnswered,
    #[error("keybase association has already been resolved")]
    AssociationResolved,
}

#[cfg(test)]
mod tests {
    use super::ErrorData;

    #[test]
    fn error_data_serializes_to_wire_shape() {
        let data = ErrorData::auth_invalid();
        let json = serde_json::to_value(&data).expect("serialize");
        assert_eq!(json["error"], "auth_invalid");
        assert!(json["message"].as_str().is_some_and(|m| !m.is_empty()));
    }

    #[test]
    fn helpers_use_stable_error_codes() {
        assert_eq!(ErrorData::unauthorized().error, "unauthorized");
        assert_eq!(ErrorData::invalid_tenant().error, "invalid_tenant");
        assert_eq!(ErrorData::secondary_expired().error, "secondary_expired");
        assert_eq!(
            ErrorData::user_remove_super().error,
            "user_remove_super"
        );
    }
}
