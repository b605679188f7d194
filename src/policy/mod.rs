//! Access policies.
//!
//! A policy selects either a role set or a service, carries per-surface
//! secondary-provider choices, a Keybase mode, and request validation rules
//! (time windows, geo and OS/browser allow/deny lists).

pub mod storage;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::agent::Agent;
use crate::errdata::ErrorData;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Roles,
    Service,
}

impl PolicyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Roles => "roles",
            Self::Service => "service",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "roles" => Some(Self::Roles),
            "service" => Some(Self::Service),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum KeybaseMode {
    Disabled,
    Optional,
    Required,
}

impl KeybaseMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Optional => "optional",
            Self::Required => "required",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "disabled" => Some(Self::Disabled),
            "optional" => Some(Self::Optional),
            "required" => Some(Self::Required),
            _ => None,
        }
    }
}

/// Allow/deny semantics for a rule list. `None` disables the rule.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ListMode {
    #[default]
    None,
    Allow,
    Deny,
}

/// A recurring login window, minutes from midnight UTC.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TimeWindow {
    /// Lowercase three-letter weekdays; empty means every day.
    pub days: Vec<String>,
    pub start_minute: u32,
    pub end_minute: u32,
}

impl TimeWindow {
    fn contains(&self, now: DateTime<Utc>) -> bool {
        if !self.days.is_empty() {
            let day = weekday_str(now.weekday());
            if !self.days.iter().any(|d| d == day) {
                return false;
            }
        }
        let minute = now.hour() * 60 + now.minute();
        if self.start_minute <= self.end_minute {
            minute >= self.start_minute && minute < self.end_minute
        } else {
            // Window wraps midnight.
            minute >= self.start_minute || minute < self.end_minute
        }
    }
}

fn weekday_str(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

/// Per-request validation rules.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct PolicyRules {
    pub time_windows: Vec<TimeWindow>,
    pub geo_mode: ListMode,
    pub geo: Vec<String>,
    pub os_mode: ListMode,
    pub operating_systems: Vec<String>,
    pub browser_mode: ListMode,
    pub browsers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Policy {
    pub id: Uuid,
    pub name: String,
    pub disabled: bool,
    pub kind: PolicyKind,
    pub roles: Vec<String>,
    pub services: Vec<Uuid>,
    pub authorities: Vec<Uuid>,
    pub admin_secondary: Option<Uuid>,
    pub user_secondary: Option<Uuid>,
    pub proxy_secondary: Option<Uuid>,
    pub authority_secondary: Option<Uuid>,
    pub keybase_mode: KeybaseMode,
    pub rules: PolicyRules,
}

impl Policy {
    /// Evaluate the per-request rules against the client snapshot.
    ///
    /// Returns the first denial encountered; a disabled policy contributes
    /// nothing.
    #[must_use]
    pub fn validate_request(&self, agent: &Agent, now: DateTime<Utc>) -> Option<ErrorData> {
        if self.disabled {
            return None;
        }

        if !self.rules.time_windows.is_empty()
            && !self.rules.time_windows.iter().any(|w| w.contains(now))
        {
            return Some(ErrorData::new(
                "unauthorized",
                "Not authorized at this time",
            ));
        }

        if let Some(denied) = check_list(
            self.rules.geo_mode,
            &self.rules.geo,
            &agent.country,
            "Not authorized from this location",
        ) {
            return Some(denied);
        }

        if let Some(denied) = check_list(
            self.rules.os_mode,
            &self.rules.operating_systems,
            &agent.operating_system,
            "Not authorized from this operating system",
        ) {
            return Some(denied);
        }

        check_list(
            self.rules.browser_mode,
            &self.rules.browsers,
            &agent.browser,
            "Not authorized from this browser",
        )
    }
}

fn check_list(mode: ListMode, list: &[String], value: &str, message: &str) -> Option<ErrorData> {
    let contained = list.iter().any(|entry| entry == value);
    let denied = match mode {
        ListMode::None => false,
        ListMode::Allow => !contained,
        ListMode::Deny => contained,
    };
    denied.then(|| ErrorData::new("unauthorized", message))
}

/// Effective Keybase mode across the selected policies.
///
/// Disabled anywhere wins; otherwise required wins over optional.
#[must_use]
pub fn keybase_mode(policies: &[Policy]) -> KeybaseMode {
    let mut mode = KeybaseMode::Optional;
    for policy in policies {
        if policy.disabled {
            continue;
        }
        match policy.keybase_mode {
            KeybaseMode::Disabled => return KeybaseMode::Disabled,
            KeybaseMode::Required => mode = KeybaseMode::Required,
            KeybaseMode::Optional => {}
        }
    }
    mode
}

/// First non-empty secondary provider across the policies, in their stable
/// order. Avoids ambiguity when several policies demand step-up.
#[must_use]
pub fn select_secondary(
    policies: &[Policy],
    field: impl Fn(&Policy) -> Option<Uuid>,
) -> Option<Uuid> {
    policies
        .iter()
        .filter(|policy| !policy.disabled)
        .find_map(field)
}

#[cfg(test)]
mod tests {
    use super::{
        KeybaseMode, ListMode, Policy, PolicyKind, PolicyRules, TimeWindow, keybase_mode,
        select_secondary,
    };
    use crate::agent::Agent;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn policy() -> Policy {
        Policy {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            disabled: false,
            kind: PolicyKind::Roles,
            roles: vec!["ops".to_string()],
            services: Vec::new(),
            authorities: Vec::new(),
            admin_secondary: None,
            user_secondary: None,
            proxy_secondary: None,
            authority_secondary: None,
            keybase_mode: KeybaseMode::Optional,
            rules: PolicyRules::default(),
        }
    }

    fn agent() -> Agent {
        Agent {
            ip: "203.0.113.7".to_string(),
            operating_system: "linux".to_string(),
            browser: "firefox".to_string(),
            country: "DE".to_string(),
        }
    }

    #[test]
    fn empty_rules_allow_everything() {
        assert!(policy().validate_request(&agent(), Utc::now()).is_none());
    }

    #[test]
    fn time_window_denies_outside() {
        let mut p = policy();
        p.rules.time_windows = vec![TimeWindow {
            days: vec!["mon".to_string()],
            start_minute: 9 * 60,
            end_minute: 17 * 60,
        }];

        // Monday 2026-01-05 10:00 UTC is inside.
        let inside = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        assert!(p.validate_request(&agent(), inside).is_none());

        // Monday 18:00 is outside; Tuesday 10:00 is the wrong day.
        let late = Utc.with_ymd_and_hms(2026, 1, 5, 18, 0, 0).unwrap();
        assert!(p.validate_request(&agent(), late).is_some());
        let tuesday = Utc.with_ymd_and_hms(2026, 1, 6, 10, 0, 0).unwrap();
        assert!(p.validate_request(&agent(), tuesday).is_some());
    }

    #[test]
    fn wrapping_window_spans_midnight() {
        let window = TimeWindow {
            days: Vec::new(),
            start_minute: 22 * 60,
            end_minute: 6 * 60,
        };
        let late = Utc.with_ymd_and_hms(2026, 1, 5, 23, 0, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2026, 1, 5, 5, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        assert!(window.contains(late));
        assert!(window.contains(early));
        assert!(!window.contains(noon));
    }

    #[test]
    fn geo_allow_and_deny_lists() {
        let mut p = policy();
        p.rules.geo_mode = ListMode::Allow;
        p.rules.geo = vec!["DE".to_string()];
        assert!(p.validate_request(&agent(), Utc::now()).is_none());

        p.rules.geo_mode = ListMode::Deny;
        let denied = p.validate_request(&agent(), Utc::now()).expect("denied");
        assert_eq!(denied.error, "unauthorized");
    }

    #[test]
    fn os_and_browser_lists() {
        let mut p = policy();
        p.rules.os_mode = ListMode::Allow;
        p.rules.operating_systems = vec!["macos".to_string()];
        assert!(p.validate_request(&agent(), Utc::now()).is_some());

        p.rules.os_mode = ListMode::None;
        p.rules.browser_mode = ListMode::Deny;
        p.rules.browsers = vec!["firefox".to_string()];
        assert!(p.validate_request(&agent(), Utc::now()).is_some());
    }

    #[test]
    fn disabled_policy_is_inert() {
        let mut p = policy();
        p.disabled = true;
        p.rules.geo_mode = ListMode::Deny;
        p.rules.geo = vec!["DE".to_string()];
        assert!(p.validate_request(&agent(), Utc::now()).is_none());
    }

    #[test]
    fn keybase_mode_disabled_wins() {
        let mut a = policy();
        a.keybase_mode = KeybaseMode::Required;
        let mut b = policy();
        b.keybase_mode = KeybaseMode::Disabled;
        assert_eq!(keybase_mode(&[a.clone(), b]), KeybaseMode::Disabled);
        assert_eq!(keybase_mode(&[a]), KeybaseMode::Required);
        assert_eq!(keybase_mode(&[]), KeybaseMode::Optional);
    }

    #[test]
    fn select_secondary_takes_first_non_empty() {
        let first = policy();
        let mut second = policy();
        second.user_secondary = Some(Uuid::new_v4());
        let mut third = policy();
        third.user_secondary = Some(Uuid::new_v4());

        let picked = select_secondary(&[first, second.clone(), third], |p| p.user_secondary);
        assert_eq!(picked, second.user_secondary);
    }

    #[test]
    fn select_secondary_skips_disabled() {
        let mut first = policy();
        first.disabled = true;
        first.user_secondary = Some(Uuid::new_v4());
        let mut second = policy();
        second.user_secondary = Some(Uuid::new_v4());

        let picked = select_secondary(&[first, second.clone()], |p| p.user_secondary);
        assert_eq!(picked, second.user_secondary);
    }
}
