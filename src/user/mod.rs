//! User accounts and role reconciliation.

pub mod storage;

use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errdata::ErrorData;

/// A fixed hash compared against when the username does not exist, so the
/// response time does not disclose whether the account is present.
const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$\
    c29tZXNhbHRzb21lc2FsdA$TYLpHgRFSuGFksVaJUtGXH9rwmrBdLoL8iQaarFDFVM";

/// Authentication source a user belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UserKind {
    Local,
    Google,
    Azure,
    Onelogin,
    Okta,
    Api,
    Keybase,
}

impl UserKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Google => "google",
            Self::Azure => "azure",
            Self::Onelogin => "onelogin",
            Self::Okta => "okta",
            Self::Api => "api",
            Self::Keybase => "keybase",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "google" => Some(Self::Google),
            "azure" => Some(Self::Azure),
            "onelogin" => Some(Self::Onelogin),
            "okta" => Some(Self::Okta),
            "api" => Some(Self::Api),
            "keybase" => Some(Self::Keybase),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub kind: UserKind,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub roles: Vec<String>,
    /// Empty string or `super`.
    pub administrator: String,
    pub permissions: Vec<String>,
    pub disabled: bool,
    pub active_until: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub theme: String,
    /// Keybase username bound to this account, empty if none.
    pub keybase: String,
    /// Keybase primary key id (`ukbid`) pinned at association time.
    pub keybase_id: String,
}

impl User {
    #[must_use]
    pub fn new(kind: UserKind, username: &str, roles: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            username: username.to_string(),
            password_hash: None,
            token: None,
            secret: None,
            roles,
            administrator: String::new(),
            permissions: Vec::new(),
            disabled: false,
            active_until: None,
            last_active: None,
            theme: String::new(),
            keybase: String::new(),
            keybase_id: String::new(),
        }
    }

    #[must_use]
    pub fn is_super(&self) -> bool {
        self.administrator == "super"
    }

    /// Union the given roles into the user's role set.
    ///
    /// Returns true when the set actually changed, so callers can skip the
    /// write and the `user.change` event otherwise.
    pub fn roles_merge(&mut self, roles: &[String]) -> bool {
        let mut changed = false;
        for role in roles {
            if !self.roles.contains(role) {
                self.roles.push(role.clone());
                changed = true;
            }
        }
        if changed {
            self.format_roles();
        }
        changed
    }

    /// Replace the user's role set.
    pub fn roles_overwrite(&mut self, roles: &[String]) -> bool {
        let mut next = roles.to_vec();
        next.sort();
        next.dedup();
        if next == self.roles {
            return false;
        }
        self.roles = next;
        true
    }

    /// Whether any of the given roles intersects the user's set.
    #[must_use]
    pub fn roles_match(&self, roles: &[String]) -> bool {
        roles.iter().any(|role| self.roles.contains(role))
    }

    fn format_roles(&mut self) {
        self.roles.sort();
        self.roles.dedup();
    }

    /// Hash and store a new password.
    ///
    /// # Errors
    /// Returns an error if hashing fails.
    pub fn set_password(&mut self, password: &str) -> anyhow::Result<()> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| anyhow::anyhow!("failed to hash password: {err}"))?;
        self.password_hash = Some(hash.to_string());
        Ok(())
    }

    /// Verify a password attempt.
    ///
    /// Users without a stored hash are compared against a fixed dummy hash
    /// so missing credentials take the same time as wrong ones.
    #[must_use]
    pub fn check_password(&self, password: &str) -> bool {
        let stored = self.password_hash.as_deref().unwrap_or(DUMMY_HASH);
        let has_hash = self.password_hash.is_some();
        let Ok(parsed) = PasswordHash::new(stored) else {
            return false;
        };
        let valid = Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();
        valid && has_hash
    }

    /// Normalize the document before a write.
    #[must_use]
    pub fn validate(&mut self) -> Option<ErrorData> {
        if self.username.is_empty() {
            return Some(ErrorData::invalid_username());
        }
        if self.administrator != "super" {
            self.administrator = String::new();
        }
        self.format_roles();
        self.permissions.sort();
        self.permissions.dedup();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{User, UserKind};

    fn user(roles: &[&str]) -> User {
        User::new(
            UserKind::Local,
            "alice",
            roles.iter().map(ToString::to_string).collect(),
        )
    }

    #[test]
    fn roles_merge_unions_and_reports_change() {
        let mut usr = user(&["ops"]);
        let changed = usr.roles_merge(&["db".to_string(), "ops".to_string()]);
        assert!(changed);
        assert_eq!(usr.roles, vec!["db", "ops"]);

        let changed = usr.roles_merge(&["ops".to_string()]);
        assert!(!changed);
    }

    #[test]
    fn roles_overwrite_replaces_and_reports_change() {
        let mut usr = user(&["ops", "db"]);
        assert!(usr.roles_overwrite(&["web".to_string()]));
        assert_eq!(usr.roles, vec!["web"]);
        assert!(!usr.roles_overwrite(&["web".to_string()]));
    }

    #[test]
    fn password_round_trip() {
        let mut usr = user(&[]);
        usr.set_password("correct horse").expect("hash");
        assert!(usr.check_password("correct horse"));
        assert!(!usr.check_password("wrong"));
    }

    #[test]
    fn missing_hash_never_verifies() {
        let usr = user(&[]);
        assert!(!usr.check_password("anything"));
    }

    #[test]
    fn validate_rejects_empty_username_and_normalizes() {
        let mut usr = user(&["b", "a", "b"]);
        usr.administrator = "weird".to_string();
        assert!(usr.validate().is_none());
        assert_eq!(usr.roles, vec!["a", "b"]);
        assert_eq!(usr.administrator, "");

        usr.username = String::new();
        let err = usr.validate().expect("error data");
        assert_eq!(err.error, "invalid_username");
    }
}
