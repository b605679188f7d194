//! System settings with database overrides.
//!
//! Defaults are compiled in; operators override single keys through the
//! `set`/`unset` CLI commands which write rows into the `settings` table and
//! publish a `settings.change` event so running nodes reload.

use anyhow::{Context, Result};
use chrono::Duration;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::Instrument;

const DEFAULT_SSH_PUB_KEY_LEN: usize = 8192;
const DEFAULT_AUTH_SERVER: &str = "https://auth.gardisto.dev";
const DEFAULT_SECONDARY_TTL_SECONDS: i64 = 180;
const DEFAULT_SSO_STATE_TTL_SECONDS: i64 = 300;
const DEFAULT_KEYBASE_TTL_SECONDS: i64 = 300;
const DEFAULT_NONCE_TTL_SECONDS: i64 = 3600;
const DEFAULT_ADMIN_EXPIRE_MINUTES: i64 = 1440;
const DEFAULT_USER_EXPIRE_MINUTES: i64 = 4320;
const DEFAULT_PROXY_EXPIRE_MINUTES: i64 = 4320;

/// Immutable snapshot of system configuration.
///
/// Session limits are minutes; zero means unbounded, matching the session
/// activity checks.
#[derive(Clone, Debug)]
pub struct Settings {
    ssh_pub_key_len: usize,
    auth_server: String,
    license: String,
    cookie_secure: bool,
    admin_expire_minutes: i64,
    admin_max_duration_minutes: i64,
    user_expire_minutes: i64,
    user_max_duration_minutes: i64,
    proxy_expire_minutes: i64,
    proxy_max_duration_minutes: i64,
    secondary_ttl_seconds: i64,
    sso_state_ttl_seconds: i64,
    keybase_ttl_seconds: i64,
    nonce_ttl_seconds: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssh_pub_key_len: DEFAULT_SSH_PUB_KEY_LEN,
            auth_server: DEFAULT_AUTH_SERVER.to_string(),
            license: String::new(),
            cookie_secure: true,
            admin_expire_minutes: DEFAULT_ADMIN_EXPIRE_MINUTES,
            admin_max_duration_minutes: 0,
            user_expire_minutes: DEFAULT_USER_EXPIRE_MINUTES,
            user_max_duration_minutes: 0,
            proxy_expire_minutes: DEFAULT_PROXY_EXPIRE_MINUTES,
            proxy_max_duration_minutes: 0,
            secondary_ttl_seconds: DEFAULT_SECONDARY_TTL_SECONDS,
            sso_state_ttl_seconds: DEFAULT_SSO_STATE_TTL_SECONDS,
            keybase_ttl_seconds: DEFAULT_KEYBASE_TTL_SECONDS,
            nonce_ttl_seconds: DEFAULT_NONCE_TTL_SECONDS,
        }
    }
}

impl Settings {
    /// Load defaults and apply any overrides stored in the `settings` table.
    ///
    /// # Errors
    /// Returns an error if the settings table cannot be read.
    pub async fn load(pool: &PgPool) -> Result<Self> {
        let mut settings = Self::default();

        let query = "SELECT grp, key, value::text AS value FROM settings";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .fetch_all(pool)
            .instrument(span)
            .await
            .context("failed to load settings")?;

        for row in rows {
            let grp: String = row.get("grp");
            let key: String = row.get("key");
            let value: String = row.get("value");
            let value: Value = serde_json::from_str(&value)
                .with_context(|| format!("invalid settings value for {grp}.{key}"))?;
            settings.apply(&grp, &key, &value);
        }

        Ok(settings)
    }

    fn apply(&mut self, grp: &str, key: &str, value: &Value) {
        match (grp, key) {
            ("system", "ssh_pub_key_len") => {
                if let Some(len) = value.as_u64() {
                    self.ssh_pub_key_len = usize::try_from(len).unwrap_or(DEFAULT_SSH_PUB_KEY_LEN);
                }
            }
            ("system", "license") => {
                if let Some(license) = value.as_str() {
                    self.license = license.to_string();
                }
            }
            ("system", "cookie_secure") => {
                if let Some(secure) = value.as_bool() {
                    self.cookie_secure = secure;
                }
            }
            ("auth", "server") => {
                if let Some(server) = value.as_str() {
                    self.auth_server = server.trim_end_matches('/').to_string();
                }
            }
            ("auth", "secondary_ttl_seconds") => {
                if let Some(ttl) = value.as_i64() {
                    self.secondary_ttl_seconds = ttl;
                }
            }
            ("auth", "sso_state_ttl_seconds") => {
                if let Some(ttl) = value.as_i64() {
                    self.sso_state_ttl_seconds = ttl;
                }
            }
            ("auth", "keybase_ttl_seconds") => {
                if let Some(ttl) = value.as_i64() {
                    self.keybase_ttl_seconds = ttl;
                }
            }
            ("auth", "nonce_ttl_seconds") => {
                if let Some(ttl) = value.as_i64() {
                    self.nonce_ttl_seconds = ttl;
                }
            }
            ("session", "admin_expire_minutes") => {
                if let Some(minutes) = value.as_i64() {
                    self.admin_expire_minutes = minutes;
                }
            }
            ("session", "admin_max_duration_minutes") => {
                if let Some(minutes) = value.as_i64() {
                    self.admin_max_duration_minutes = minutes;
                }
            }
            ("session", "user_expire_minutes") => {
                if let Some(minutes) = value.as_i64() {
                    self.user_expire_minutes = minutes;
                }
            }
            ("session", "user_max_duration_minutes") => {
                if let Some(minutes) = value.as_i64() {
                    self.user_max_duration_minutes = minutes;
                }
            }
            ("session", "proxy_expire_minutes") => {
                if let Some(minutes) = value.as_i64() {
                    self.proxy_expire_minutes = minutes;
                }
            }
            ("session", "proxy_max_duration_minutes") => {
                if let Some(minutes) = value.as_i64() {
                    self.proxy_max_duration_minutes = minutes;
                }
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn ssh_pub_key_len(&self) -> usize {
        self.ssh_pub_key_len
    }

    #[must_use]
    pub fn auth_server(&self) -> &str {
        &self.auth_server
    }

    #[must_use]
    pub fn license(&self) -> &str {
        &self.license
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }

    #[must_use]
    pub fn secondary_ttl(&self) -> Duration {
        Duration::seconds(self.secondary_ttl_seconds)
    }

    #[must_use]
    pub fn sso_state_ttl(&self) -> Duration {
        Duration::seconds(self.sso_state_ttl_seconds)
    }

    #[must_use]
    pub fn keybase_ttl(&self) -> Duration {
        Duration::seconds(self.keybase_ttl_seconds)
    }

    #[must_use]
    pub fn nonce_ttl(&self) -> Duration {
        Duration::seconds(self.nonce_ttl_seconds)
    }

    /// Idle timeout for a session scope; zero duration means unbounded.
    #[must_use]
    pub fn session_expire(&self, scope: crate::session::Scope) -> Duration {
        let minutes = match scope {
            crate::session::Scope::Admin => self.admin_expire_minutes,
            crate::session::Scope::User => self.user_expire_minutes,
            crate::session::Scope::Proxy => self.proxy_expire_minutes,
        };
        Duration::minutes(minutes)
    }

    /// Absolute lifetime for a session scope; zero duration means unbounded.
    #[must_use]
    pub fn session_max_duration(&self, scope: crate::session::Scope) -> Duration {
        let minutes = match scope {
            crate::session::Scope::Admin => self.admin_max_duration_minutes,
            crate::session::Scope::User => self.user_max_duration_minutes,
            crate::session::Scope::Proxy => self.proxy_max_duration_minutes,
        };
        Duration::minutes(minutes)
    }
}

/// Write a single settings override.
///
/// # Errors
/// Returns an error if the row cannot be written.
pub async fn set(pool: &PgPool, grp: &str, key: &str, value: &Value) -> Result<()> {
    let query = r"
        INSERT INTO settings (grp, key, value)
        VALUES ($1, $2, $3::jsonb)
        ON CONFLICT (grp, key) DO UPDATE SET value = EXCLUDED.value
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(grp)
        .bind(key)
        .bind(value.to_string())
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to write setting")?;
    Ok(())
}

/// Remove a settings override, reverting to the compiled default.
///
/// # Errors
/// Returns an error if the row cannot be deleted.
pub async fn unset(pool: &PgPool, grp: &str, key: &str) -> Result<()> {
    let query = "DELETE FROM settings WHERE grp = $1 AND key = $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(grp)
        .bind(key)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete setting")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Settings;
    use crate::session::Scope;
    use serde_json::json;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.ssh_pub_key_len(), 8192);
        assert_eq!(settings.secondary_ttl().num_seconds(), 180);
        assert_eq!(settings.session_max_duration(Scope::Admin).num_minutes(), 0);
    }

    #[test]
    fn apply_overrides_known_keys() {
        let mut settings = Settings::default();
        settings.apply("auth", "server", &json!("https://broker.test/"));
        settings.apply("session", "admin_expire_minutes", &json!(60));
        settings.apply("system", "cookie_secure", &json!(false));

        assert_eq!(settings.auth_server(), "https://broker.test");
        assert_eq!(settings.session_expire(Scope::Admin).num_minutes(), 60);
        assert!(!settings.cookie_secure());
    }

    #[test]
    fn apply_ignores_unknown_keys_and_bad_types() {
        let mut settings = Settings::default();
        settings.apply("nope", "nothing", &json!(1));
        settings.apply("system", "ssh_pub_key_len", &json!("not-a-number"));
        assert_eq!(settings.ssh_pub_key_len(), 8192);
    }
}
