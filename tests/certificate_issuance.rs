//! End-to-end certificate issuance against in-memory authorities.

use gardisto::agent::Agent;
use gardisto::authority::Authority;
use gardisto::ssh;
use gardisto::user::{User, UserKind};
use ssh_key::certificate::CertType;

fn ec_authority(name: &str) -> Authority {
    let mut authority = Authority::new(name);
    authority
        .generate_ec_private_key()
        .expect("authority keygen");
    authority
}

fn offered_key(comment: &str) -> String {
    let mut subject = Authority::new("subject");
    subject.generate_ec_private_key().expect("subject keygen");
    let stripped: Vec<&str> = subject.public_key.split_whitespace().take(2).collect();
    format!("{} {comment}", stripped.join(" "))
}

#[test]
fn issued_user_certificates_validate_against_the_authority() {
    let mut authority = ec_authority("bastion");
    authority.expire = 30;

    let mut usr = User::new(
        UserKind::Local,
        "alice",
        vec!["ops".to_string(), "db".to_string()],
    );
    assert!(usr.validate().is_none());

    let signed = authority
        .create_certificate(&usr, &offered_key("alice@laptop"))
        .expect("sign");
    let cert = &signed.certificate;

    assert_eq!(cert.cert_type(), CertType::User);
    assert_eq!(cert.key_id(), usr.id.simple().to_string());
    assert_eq!(cert.valid_principals(), &["db", "ops"]);
    assert_eq!(cert.valid_before() - cert.valid_after(), (30 + 5) * 60);

    // The signature must verify against the authority's own public key.
    let ca = ssh_key::PublicKey::from_openssh(&authority.public_key).expect("ca key");
    let fingerprint = ca.fingerprint(ssh_key::HashAlg::Sha256);
    cert.validate([&fingerprint]).expect("certificate valid");

    // The marshaled line keeps the subject's comment.
    assert!(signed.marshaled.contains("alice@laptop"));
}

#[test]
fn bundle_issues_once_per_accessible_authority() {
    let open = ec_authority("open");
    let mut gated = ec_authority("gated");
    gated.match_roles = true;
    gated.roles = vec!["db".to_string()];

    let usr = User::new(UserKind::Local, "alice", vec!["ops".to_string()]);

    let accessible: Vec<Authority> = [open, gated]
        .into_iter()
        .filter(|authority| authority.user_has_access(&usr))
        .collect();
    assert_eq!(accessible.len(), 1);

    let bundle = ssh::new_certificate(
        &accessible,
        &usr,
        &Agent::default(),
        &offered_key("alice@laptop"),
    )
    .expect("bundle");

    assert_eq!(bundle.certificates.len(), 1);
    assert_eq!(bundle.certificates_info[0].principals, vec!["ops"]);
}

#[test]
fn host_certificate_principal_is_the_fqdn() {
    let mut authority = ec_authority("hosts");
    authority.host_domain = "nodes.example.com".to_string();
    authority.host_expire = 60;

    let signed = authority
        .create_host_certificate("web0", &offered_key("root@web0"))
        .expect("sign");

    assert_eq!(signed.certificate.cert_type(), CertType::Host);
    assert_eq!(
        signed.certificate.valid_principals(),
        &["web0.nodes.example.com"]
    );
    assert!(signed.certificate.extensions().is_empty());
}
