//! Certificate signing.

use anyhow::{Context, Result, anyhow};
use chrono::{Duration, Utc};
use fnv::FnvHasher;
use rand::rngs::OsRng;
use ssh_key::certificate::{Builder, CertType, Certificate};
use ssh_key::PublicKey;
use std::hash::Hasher;
use uuid::Uuid;

use super::{Authority, DEFAULT_EXPIRE_MINUTES};
use crate::user::User;

/// Clock-skew allowance applied backwards to `ValidAfter`.
pub const VALID_AFTER_SKEW_MINUTES: i64 = 5;

/// The five standard permit-* extensions carried by user certificates.
pub const USER_EXTENSIONS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

/// A signed certificate plus its authorized-keys serialization.
#[derive(Clone, Debug)]
pub struct SignedCertificate {
    pub certificate: Certificate,
    pub marshaled: String,
}

/// Best-effort unique serial: FNV-1a-64 of a fresh opaque id. Collisions
/// are tolerable because revocation is by authority rotation.
#[must_use]
pub fn new_serial() -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(Uuid::new_v4().simple().to_string().as_bytes());
    hasher.finish()
}

impl Authority {
    /// Sign a user certificate for the offered public key.
    ///
    /// Principals are the user's roles; a user without roles cannot hold a
    /// certificate.
    ///
    /// # Errors
    /// Returns an error if the offered key does not parse, the user has no
    /// roles, or signing fails.
    pub fn create_certificate(&self, usr: &User, ssh_pub_key: &str) -> Result<SignedCertificate> {
        if usr.roles.is_empty() {
            return Err(anyhow!("authority: user has no roles"));
        }

        let private = super::keys::parse_private(&self.private_key)?;
        let offered = PublicKey::from_openssh(ssh_pub_key.trim())
            .context("failed to parse ssh public key")?;

        let expire = effective_expire(self.expire);
        let now = Utc::now();
        let valid_after = now - Duration::minutes(VALID_AFTER_SKEW_MINUTES);
        let valid_before = now + Duration::minutes(expire);

        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            offered.key_data().clone(),
            timestamp(valid_after.timestamp()),
            timestamp(valid_before.timestamp()),
        )
        .context("failed to start certificate")?;

        builder
            .serial(new_serial())
            .context("failed to set serial")?;
        builder
            .cert_type(CertType::User)
            .context("failed to set cert type")?;
        builder
            .key_id(usr.id.simple().to_string())
            .context("failed to set key id")?;
        for role in &usr.roles {
            builder
                .valid_principal(role.clone())
                .context("failed to add principal")?;
        }
        for extension in USER_EXTENSIONS {
            builder
                .extension(extension, "")
                .context("failed to add extension")?;
        }
        builder
            .comment(offered.comment())
            .context("failed to set comment")?;

        let certificate = builder.sign(&private).context("failed to sign certificate")?;
        let marshaled = certificate
            .to_openssh()
            .context("failed to encode certificate")?;

        Ok(SignedCertificate {
            certificate,
            marshaled,
        })
    }

    /// Sign a host certificate; the single principal is the hostname under
    /// this authority's host domain.
    ///
    /// # Errors
    /// Returns an error if the offered key does not parse or signing fails.
    pub fn create_host_certificate(
        &self,
        hostname: &str,
        ssh_pub_key: &str,
    ) -> Result<SignedCertificate> {
        let private = super::keys::parse_private(&self.private_key)?;
        let offered = PublicKey::from_openssh(ssh_pub_key.trim())
            .context("failed to parse ssh public key")?;

        let expire = effective_expire(self.host_expire);
        let now = Utc::now();
        let valid_after = now - Duration::minutes(VALID_AFTER_SKEW_MINUTES);
        let valid_before = now + Duration::minutes(expire);

        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            offered.key_data().clone(),
            timestamp(valid_after.timestamp()),
            timestamp(valid_before.timestamp()),
        )
        .context("failed to start certificate")?;

        builder
            .serial(new_serial())
            .context("failed to set serial")?;
        builder
            .cert_type(CertType::Host)
            .context("failed to set cert type")?;
        builder
            .key_id(hostname)
            .context("failed to set key id")?;
        builder
            .valid_principal(self.get_domain(hostname))
            .context("failed to add principal")?;
        builder
            .comment(offered.comment())
            .context("failed to set comment")?;

        let certificate = builder.sign(&private).context("failed to sign certificate")?;
        let marshaled = certificate
            .to_openssh()
            .context("failed to encode certificate")?;

        Ok(SignedCertificate {
            certificate,
            marshaled,
        })
    }
}

fn effective_expire(expire: i32) -> i64 {
    if expire == 0 {
        i64::from(DEFAULT_EXPIRE_MINUTES)
    } else {
        i64::from(expire)
    }
}

#[allow(clippy::cast_sign_loss)]
fn timestamp(seconds: i64) -> u64 {
    seconds.max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::{USER_EXTENSIONS, new_serial};
    use crate::authority::Authority;
    use crate::user::{User, UserKind};
    use ssh_key::certificate::CertType;

    fn ec_authority() -> Authority {
        let mut authority = Authority::new("bastion");
        authority
            .generate_ec_private_key()
            .expect("generate authority key");
        authority.expire = 600;
        authority.host_expire = 60;
        authority.host_domain = "nodes.example.com".to_string();
        authority
    }

    fn offered_key() -> String {
        let mut subject = Authority::new("subject");
        subject.generate_ec_private_key().expect("subject key");
        // Stand in for a client key; only the public half matters here.
        format!("{} alice@laptop", strip_comment(&subject.public_key))
    }

    fn strip_comment(line: &str) -> String {
        line.split_whitespace().take(2).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn serials_vary() {
        assert_ne!(new_serial(), new_serial());
    }

    #[test]
    fn user_certificate_layout() {
        let authority = ec_authority();
        let mut usr = User::new(
            UserKind::Local,
            "alice",
            vec!["db".to_string(), "ops".to_string()],
        );
        assert!(usr.validate().is_none());

        let signed = authority
            .create_certificate(&usr, &offered_key())
            .expect("sign");
        let cert = &signed.certificate;

        assert_eq!(cert.cert_type(), CertType::User);
        assert_eq!(cert.key_id(), usr.id.simple().to_string());
        assert_eq!(cert.valid_principals(), &["db", "ops"]);

        // ValidBefore - ValidAfter == expire + 5 minute skew.
        let window = cert.valid_before() - cert.valid_after();
        assert_eq!(window, (600 + 5) * 60);

        let extensions: Vec<&str> = cert
            .extensions()
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        let mut expected = USER_EXTENSIONS.to_vec();
        expected.sort_unstable();
        assert_eq!(extensions, expected);

        assert!(signed.marshaled.contains("cert-v01@openssh.com"));
        assert!(signed.marshaled.contains("alice@laptop"));
    }

    #[test]
    fn user_certificate_requires_roles() {
        let authority = ec_authority();
        let usr = User::new(UserKind::Local, "alice", Vec::new());
        assert!(authority.create_certificate(&usr, &offered_key()).is_err());
    }

    #[test]
    fn host_certificate_layout() {
        let authority = ec_authority();
        let signed = authority
            .create_host_certificate("web0", &offered_key())
            .expect("sign");
        let cert = &signed.certificate;

        assert_eq!(cert.cert_type(), CertType::Host);
        assert_eq!(cert.key_id(), "web0");
        assert_eq!(cert.valid_principals(), &["web0.nodes.example.com"]);
        assert!(cert.extensions().is_empty());

        let window = cert.valid_before() - cert.valid_after();
        assert_eq!(window, (60 + 5) * 60);
    }

    #[test]
    fn rejects_unparseable_offered_key() {
        let authority = ec_authority();
        let usr = User::new(UserKind::Local, "alice", vec!["ops".to_string()]);
        assert!(authority.create_certificate(&usr, "junk").is_err());
    }
}
