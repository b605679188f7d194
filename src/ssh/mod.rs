//! SSH certificate issuance records.
//!
//! A single request fans out over every authority the user has access to;
//! the resulting bundle carries the signed certificates, the known-hosts
//! lines for the signing authorities and the host patterns for client
//! configuration.

pub mod storage;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::agent::Agent;
use crate::authority::Authority;
use crate::user::User;

/// Challenge and association states shared by the Keybase flow.
pub const APPROVED: &str = "approved";
pub const DENIED: &str = "denied";
pub const UNAVAILABLE: &str = "unavailable";

/// Summary of one signed certificate, kept for the audit surface.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct CertificateInfo {
    pub serial: String,
    pub expires: DateTime<Utc>,
    pub principals: Vec<String>,
    pub extensions: Vec<String>,
}

/// Client-side host pattern contributed by a host-enabled authority.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Host {
    pub domain: String,
    pub proxy_host: String,
}

/// Issuance record.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct CertificateBundle {
    pub id: Uuid,
    pub user_id: Uuid,
    pub authority_ids: Vec<Uuid>,
    pub certificates: Vec<String>,
    pub certificates_info: Vec<CertificateInfo>,
    pub certificate_authorities: Vec<String>,
    pub hosts: Vec<Host>,
    pub agent: Agent,
    pub timestamp: DateTime<Utc>,
}

/// Sign a user certificate with every accessible authority.
///
/// An empty bundle (no authorities) is not an error; callers mark the
/// request unavailable.
///
/// # Errors
/// Returns an error if any signing fails.
pub fn new_certificate(
    authorities: &[Authority],
    usr: &User,
    agent: &Agent,
    ssh_pub_key: &str,
) -> Result<CertificateBundle> {
    let mut bundle = CertificateBundle {
        id: Uuid::new_v4(),
        user_id: usr.id,
        authority_ids: Vec::new(),
        certificates: Vec::new(),
        certificates_info: Vec::new(),
        certificate_authorities: Vec::new(),
        hosts: Vec::new(),
        agent: agent.clone(),
        timestamp: Utc::now(),
    };

    for authority in authorities {
        let signed = authority.create_certificate(usr, ssh_pub_key)?;
        let cert = &signed.certificate;

        bundle.authority_ids.push(authority.id);
        bundle.certificates.push(signed.marshaled.clone());
        bundle.certificates_info.push(CertificateInfo {
            serial: cert.serial().to_string(),
            expires: expires_at(cert.valid_before()),
            principals: cert.valid_principals().to_vec(),
            extensions: cert
                .extensions()
                .iter()
                .map(|(name, _)| name.clone())
                .collect(),
        });

        if !authority.host_domain.is_empty() {
            bundle
                .certificate_authorities
                .push(authority.get_cert_authority());
            bundle.hosts.push(Host {
                domain: authority.get_host_domain(),
                proxy_host: authority.host_proxy.clone(),
            });
        }
    }

    Ok(bundle)
}

#[allow(clippy::cast_possible_wrap)]
fn expires_at(valid_before: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(valid_before.min(i64::MAX as u64) as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::new_certificate;
    use crate::agent::Agent;
    use crate::authority::Authority;
    use crate::user::{User, UserKind};

    fn ec_authority(name: &str, host_domain: &str) -> Authority {
        let mut authority = Authority::new(name);
        authority.generate_ec_private_key().expect("keygen");
        authority.host_domain = host_domain.to_string();
        authority.host_proxy = if host_domain.is_empty() {
            String::new()
        } else {
            format!("bastion@jump.{host_domain}")
        };
        authority
    }

    fn offered_key() -> String {
        let mut subject = Authority::new("subject");
        subject.generate_ec_private_key().expect("keygen");
        let stripped: Vec<&str> = subject.public_key.split_whitespace().take(2).collect();
        format!("{} alice@laptop", stripped.join(" "))
    }

    #[test]
    fn bundle_spans_all_authorities() {
        let authorities = vec![
            ec_authority("plain", ""),
            ec_authority("hosted", "nodes.example.com"),
        ];
        let usr = User::new(UserKind::Local, "alice", vec!["ops".to_string()]);

        let bundle =
            new_certificate(&authorities, &usr, &Agent::default(), &offered_key())
                .expect("bundle");

        assert_eq!(bundle.certificates.len(), 2);
        assert_eq!(bundle.authority_ids.len(), 2);
        // Only the host-enabled authority contributes known-hosts material.
        assert_eq!(bundle.certificate_authorities.len(), 1);
        assert_eq!(bundle.hosts.len(), 1);
        assert_eq!(bundle.hosts[0].proxy_host, "bastion@jump.nodes.example.com");

        for info in &bundle.certificates_info {
            assert_eq!(info.principals, vec!["ops"]);
            assert_eq!(info.extensions.len(), 5);
            assert!(info.expires > bundle.timestamp);
        }
    }

    #[test]
    fn empty_authority_set_yields_empty_bundle() {
        let usr = User::new(UserKind::Local, "alice", vec!["ops".to_string()]);
        let bundle = new_certificate(&[], &usr, &Agent::default(), &offered_key())
            .expect("bundle");
        assert!(bundle.certificates.is_empty());
    }
}
