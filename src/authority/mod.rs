//! SSH certificate authorities.
//!
//! Each authority owns a keypair, validity bounds for the certificates it
//! signs, an optional role-match gate, and host-certificate settings
//! (domain, strict checking, bearer tokens for node agents).

pub mod certificate;
pub mod keys;
pub mod storage;

use anyhow::Result;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errdata::ErrorData;
use crate::user::User;
use crate::utils::rand_str;

pub const DEFAULT_EXPIRE_MINUTES: i32 = 600;
pub const MIN_EXPIRE_MINUTES: i32 = 1;
pub const MIN_HOST_EXPIRE_MINUTES: i32 = 15;
pub const MAX_EXPIRE_MINUTES: i32 = 1440;
pub const HOST_TOKEN_LEN: usize = 48;
const DEFAULT_CHALLENGE_PORT: u16 = 9748;

// Process-wide probe client; host challenges are latency-bound.
static PROBE_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .user_agent(crate::APP_USER_AGENT)
        .build()
        .unwrap_or_default()
});

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    public_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Authority {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub key_alg: String,
    pub match_roles: bool,
    pub roles: Vec<String>,
    /// User certificate lifetime in minutes, clamped to `[1, 1440]`.
    pub expire: i32,
    /// Host certificate lifetime in minutes, clamped to `[15, 1440]`.
    pub host_expire: i32,
    #[serde(skip_serializing)]
    pub private_key: String,
    pub public_key: String,
    pub host_domain: String,
    pub host_proxy: String,
    pub host_certificates: bool,
    pub strict_host_checking: bool,
    pub host_tokens: Vec<String>,
}

impl Authority {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind: "local".to_string(),
            key_alg: String::new(),
            match_roles: false,
            roles: Vec::new(),
            expire: DEFAULT_EXPIRE_MINUTES,
            host_expire: DEFAULT_EXPIRE_MINUTES,
            private_key: String::new(),
            public_key: String::new(),
            host_domain: String::new(),
            host_proxy: String::new(),
            host_certificates: false,
            strict_host_checking: false,
            host_tokens: Vec::new(),
        }
    }

    /// Fully qualified domain a hostname resolves under this authority.
    #[must_use]
    pub fn get_domain(&self, hostname: &str) -> String {
        format!("{hostname}.{}", self.host_domain)
    }

    /// SSH client `Host` pattern covering this authority's domain,
    /// excluding the bastion itself when a host proxy is set.
    #[must_use]
    pub fn get_host_domain(&self) -> String {
        if self.host_domain.is_empty() {
            return String::new();
        }
        let mut domain = format!("*.{}", self.host_domain);
        if !self.host_proxy.is_empty() {
            let proxy_host = self
                .host_proxy
                .rsplit_once('@')
                .map_or(self.host_proxy.as_str(), |(_, host)| host);
            domain.push_str(" !");
            domain.push_str(proxy_host);
        }
        domain
    }

    /// `known_hosts` @cert-authority line for this authority.
    #[must_use]
    pub fn get_cert_authority(&self) -> String {
        if self.host_domain.is_empty() {
            return String::new();
        }
        format!(
            "@cert-authority *.{} {}",
            self.host_domain, self.public_key
        )
    }

    /// Whether a user may request certificates from this authority.
    #[must_use]
    pub fn user_has_access(&self, usr: &User) -> bool {
        if !self.match_roles {
            return true;
        }
        usr.roles_match(&self.roles)
    }

    /// Generate RSA-4096 key material (the default algorithm).
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn generate_rsa_private_key(&mut self) -> Result<()> {
        let pair = keys::generate_rsa()?;
        self.key_alg = pair.key_alg.to_string();
        self.private_key = pair.private_pem;
        self.public_key = pair.public_line;
        Ok(())
    }

    /// Generate EC P-384 key material.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn generate_ec_private_key(&mut self) -> Result<()> {
        let pair = keys::generate_ec()?;
        self.key_alg = pair.key_alg.to_string();
        self.private_key = pair.private_pem;
        self.public_key = pair.public_line;
        Ok(())
    }

    /// Normalize the document before a write: generate missing keys, clamp
    /// validity bounds and enforce the host-domain invariants.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn validate(&mut self) -> Result<Option<ErrorData>> {
        if self.kind.is_empty() {
            self.kind = "local".to_string();
        }

        if !self.match_roles {
            self.roles = Vec::new();
        }

        if self.private_key.is_empty() {
            self.generate_rsa_private_key()?;
        }

        if self.expire < MIN_EXPIRE_MINUTES {
            self.expire = DEFAULT_EXPIRE_MINUTES;
        } else if self.expire > MAX_EXPIRE_MINUTES {
            self.expire = MAX_EXPIRE_MINUTES;
        }

        if self.host_expire < MIN_EXPIRE_MINUTES {
            self.host_expire = DEFAULT_EXPIRE_MINUTES;
        } else if self.host_expire > MAX_EXPIRE_MINUTES {
            self.host_expire = MAX_EXPIRE_MINUTES;
        } else if self.host_expire < MIN_HOST_EXPIRE_MINUTES {
            self.host_expire = MIN_HOST_EXPIRE_MINUTES;
        }

        if self.host_certificates && self.host_domain.is_empty() {
            return Ok(Some(ErrorData::host_domain_required()));
        }

        if self.host_domain.is_empty() {
            self.host_certificates = false;
            self.strict_host_checking = false;
            self.host_proxy = String::new();
        }

        if !self.host_certificates {
            self.host_tokens = Vec::new();
        }

        self.format();
        Ok(None)
    }

    fn format(&mut self) {
        self.roles.sort();
        self.roles.dedup();
        self.host_tokens.sort();
    }

    /// Add a bearer token for node agents.
    pub fn token_new(&mut self) -> String {
        let token = rand_str(HOST_TOKEN_LEN);
        self.host_tokens.push(token.clone());
        self.format();
        token
    }

    /// Remove a bearer token.
    pub fn token_delete(&mut self, token: &str) {
        self.host_tokens.retain(|t| t != token);
    }

    /// Whether a presented host token belongs to this authority.
    #[must_use]
    pub fn token_valid(&self, token: &str) -> bool {
        // Compare against every stored token so timing does not reveal
        // which prefix matched.
        let mut valid = false;
        for stored in &self.host_tokens {
            valid |= bool::from(stored.as_bytes().ct_eq(token.as_bytes()));
        }
        valid
    }

    /// Verify a host's self-reported public key against its DNS-derived
    /// challenge endpoint before issuing a host certificate.
    ///
    /// Resolves `hostname.host_domain` to IPv4 addresses and probes
    /// `http://<ip>:<port>/challenge` until one answers; the response key
    /// is length-checked and compared in constant time. Any mismatch,
    /// transport error or bad status on every address fails validation.
    pub async fn hostname_validate(
        &self,
        hostname: &str,
        port: u16,
        pub_key: &str,
        max_key_len: usize,
    ) -> bool {
        let domain = self.get_domain(hostname);
        let port = if port == 0 { DEFAULT_CHALLENGE_PORT } else { port };

        let resolved = match tokio::net::lookup_host(format!("{domain}:{port}")).await {
            Ok(addrs) => addrs,
            Err(err) => {
                error!("host validation dns lookup failed for {domain}: {err}");
                return false;
            }
        };

        let ips: Vec<IpAddr> = resolved
            .filter(|addr| addr.is_ipv4())
            .map(|addr| addr.ip())
            .collect();
        if ips.is_empty() {
            error!("no ipv4 addresses found for {domain}");
            return false;
        }

        for ip in ips {
            let url = format!("http://{ip}:{port}/challenge");
            let resp = match PROBE_CLIENT.get(&url).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    error!("host validation request failed for {url}: {err}");
                    continue;
                }
            };

            if resp.status() != reqwest::StatusCode::OK {
                error!(
                    "host validation bad status {} for {url}",
                    resp.status()
                );
                continue;
            }

            let data: ChallengeResponse = match resp.json().await {
                Ok(data) => data,
                Err(err) => {
                    error!("host validation parse failed for {url}: {err}");
                    return false;
                }
            };

            let host_pub_key = data.public_key.trim();
            if host_pub_key.len() > max_key_len {
                error!("host validation public key too long for {domain}");
                return false;
            }

            if !bool::from(pub_key.as_bytes().ct_eq(host_pub_key.as_bytes())) {
                error!("host validation public key mismatch for {domain}");
                return false;
            }

            return true;
        }

        false
    }
}

/// Resolve the authorities a user has access to.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_user_authorities(pool: &sqlx::PgPool, usr: &User) -> Result<Vec<Authority>> {
    let all = storage::get_all(pool).await?;
    Ok(all
        .into_iter()
        .filter(|authority| authority.user_has_access(usr))
        .collect())
}

/// Find the authority accepting a presented host token.
///
/// # Errors
/// Returns an error on store failure.
pub async fn get_token_authority(
    pool: &sqlx::PgPool,
    token: &str,
) -> Result<Option<Authority>> {
    let all = storage::get_all(pool).await?;
    Ok(all
        .into_iter()
        .find(|authority| authority.host_certificates && authority.token_valid(token)))
}

/// Export the @cert-authority lines of every host-enabled authority.
///
/// # Errors
/// Returns an error on store failure.
pub async fn export_cert_authorities(pool: &sqlx::PgPool) -> Result<String> {
    let all = storage::get_all(pool).await?;
    let lines: Vec<String> = all
        .iter()
        .filter(|authority| !authority.host_domain.is_empty())
        .map(Authority::get_cert_authority)
        .collect();
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::Authority;
    use crate::user::{User, UserKind};

    fn authority() -> Authority {
        let mut authority = Authority::new("bastion");
        // Avoid RSA keygen in validate().
        authority.private_key = "test".to_string();
        authority
    }

    #[test]
    fn validate_clamps_expire_bounds() {
        let mut a = authority();
        a.expire = 0;
        a.host_expire = 0;
        assert!(a.validate().expect("validate").is_none());
        assert_eq!(a.expire, 600);
        assert_eq!(a.host_expire, 600);

        a.expire = 5000;
        a.host_expire = 5000;
        assert!(a.validate().expect("validate").is_none());
        assert_eq!(a.expire, 1440);
        assert_eq!(a.host_expire, 1440);

        a.host_expire = 5;
        assert!(a.validate().expect("validate").is_none());
        assert_eq!(a.host_expire, 15);

        a.expire = 30;
        assert!(a.validate().expect("validate").is_none());
        assert_eq!(a.expire, 30);
    }

    #[test]
    fn host_certificates_require_domain() {
        let mut a = authority();
        a.host_certificates = true;
        let err = a.validate().expect("validate").expect("error data");
        assert_eq!(err.error, "host_domain_required");
    }

    #[test]
    fn empty_domain_clears_host_settings() {
        let mut a = authority();
        a.strict_host_checking = true;
        a.host_proxy = "bastion@jump.example.com".to_string();
        a.host_tokens = vec!["tok".to_string()];
        assert!(a.validate().expect("validate").is_none());
        assert!(!a.host_certificates);
        assert!(!a.strict_host_checking);
        assert!(a.host_proxy.is_empty());
        assert!(a.host_tokens.is_empty());
    }

    #[test]
    fn match_roles_gates_access() {
        let mut a = authority();
        let usr = User::new(UserKind::Local, "alice", vec!["ops".to_string()]);
        assert!(a.user_has_access(&usr));

        a.match_roles = true;
        a.roles = vec!["db".to_string()];
        assert!(!a.user_has_access(&usr));

        a.roles.push("ops".to_string());
        assert!(a.user_has_access(&usr));
    }

    #[test]
    fn host_tokens_sorted_and_removable() {
        let mut a = authority();
        a.host_certificates = true;
        a.host_domain = "nodes.example.com".to_string();
        let first = a.token_new();
        let second = a.token_new();
        assert_eq!(first.len(), 48);

        let mut sorted = a.host_tokens.clone();
        sorted.sort();
        assert_eq!(a.host_tokens, sorted);

        assert!(a.token_valid(&first));
        a.token_delete(&first);
        assert!(!a.token_valid(&first));
        assert!(a.token_valid(&second));
    }

    #[test]
    fn domain_helpers() {
        let mut a = authority();
        a.host_domain = "nodes.example.com".to_string();
        a.public_key = "ssh-rsa AAAA".to_string();
        assert_eq!(a.get_domain("web0"), "web0.nodes.example.com");
        assert_eq!(
            a.get_cert_authority(),
            "@cert-authority *.nodes.example.com ssh-rsa AAAA"
        );

        a.host_proxy = "bastion@jump.example.com".to_string();
        assert_eq!(
            a.get_host_domain(),
            "*.nodes.example.com !jump.example.com"
        );
    }
}
