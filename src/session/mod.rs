//! Scoped sessions.
//!
//! Admin, user-portal and proxy logins mint separate sessions with their
//! own cookies and lifetime rules. A session goes inactive when removed,
//! idle past the scope's expire window, or older than the scope's maximum
//! duration (zero disables either bound).

pub mod cookie;
pub mod storage;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::agent::Agent;
use crate::settings::Settings;

pub const SESSION_ID_LEN: usize = 64;

/// Which surface a session belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Admin,
    User,
    Proxy,
}

impl Scope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Proxy => "proxy",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "user" => Some(Self::User),
            "proxy" => Some(Self::Proxy),
            _ => None,
        }
    }

    /// Cookie carrying this scope's session id.
    #[must_use]
    pub fn cookie_name(self) -> &'static str {
        self.as_str()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Session {
    pub id: String,
    pub scope: Scope,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub removed: bool,
    pub agent: Agent,
}

impl Session {
    /// Whether the session is still usable under the scope's limits.
    #[must_use]
    pub fn active(&self, settings: &Settings, now: DateTime<Utc>) -> bool {
        if self.removed {
            return false;
        }

        let expire = settings.session_expire(self.scope);
        if !expire.is_zero() && now - self.last_active > expire {
            return false;
        }

        let max_duration = settings.session_max_duration(self.scope);
        if !max_duration.is_zero() && now - self.timestamp > max_duration {
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::{Scope, Session};
    use crate::agent::Agent;
    use crate::settings::Settings;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn session(scope: Scope) -> Session {
        let now = Utc::now();
        Session {
            id: "session".to_string(),
            scope,
            user_id: Uuid::new_v4(),
            timestamp: now,
            last_active: now,
            removed: false,
            agent: Agent::default(),
        }
    }

    #[test]
    fn fresh_session_is_active() {
        let settings = Settings::default();
        assert!(session(Scope::Admin).active(&settings, Utc::now()));
    }

    #[test]
    fn removed_session_is_inactive() {
        let settings = Settings::default();
        let mut s = session(Scope::User);
        s.removed = true;
        assert!(!s.active(&settings, Utc::now()));
    }

    #[test]
    fn idle_timeout_expires_session() {
        let settings = Settings::default();
        let mut s = session(Scope::Admin);
        // Default admin idle timeout is 1440 minutes.
        s.last_active = Utc::now() - Duration::minutes(1441);
        assert!(!s.active(&settings, Utc::now()));
    }

    #[test]
    fn zero_max_duration_means_unbounded() {
        let settings = Settings::default();
        let mut s = session(Scope::Admin);
        s.timestamp = Utc::now() - Duration::days(365);
        s.last_active = Utc::now();
        assert!(s.active(&settings, Utc::now()));
    }

    #[test]
    fn scope_cookie_names() {
        assert_eq!(Scope::Admin.cookie_name(), "admin");
        assert_eq!(Scope::User.cookie_name(), "user");
        assert_eq!(Scope::Proxy.cookie_name(), "proxy");
    }
}
