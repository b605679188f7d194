//! Authority key material.
//!
//! Private keys are stored as OpenSSH PEM and never leave the store
//! unencrypted through the API; the public half is served in
//! authorized-keys format.

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use ssh_key::private::{EcdsaKeypair, KeypairData, RsaKeypair};
use ssh_key::{EcdsaCurve, LineEnding, PrivateKey};

pub const KEY_ALG_RSA: &str = "RSA 4096";
pub const KEY_ALG_EC: &str = "EC P384";

const KEY_COMMENT: &str = "gardisto";

/// Generated keypair in serialized form.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub key_alg: &'static str,
    pub private_pem: String,
    pub public_line: String,
}

/// Generate a 4096-bit RSA authority keypair.
///
/// # Errors
/// Returns an error if key generation or encoding fails.
pub fn generate_rsa() -> Result<KeyPair> {
    let keypair =
        RsaKeypair::random(&mut OsRng, 4096).context("failed to generate rsa keypair")?;
    let private = PrivateKey::new(KeypairData::Rsa(keypair), KEY_COMMENT)
        .context("failed to build rsa private key")?;
    serialize(KEY_ALG_RSA, &private)
}

/// Generate a P-384 ECDSA authority keypair.
///
/// # Errors
/// Returns an error if key generation or encoding fails.
pub fn generate_ec() -> Result<KeyPair> {
    let keypair = EcdsaKeypair::random(&mut OsRng, EcdsaCurve::NistP384)
        .context("failed to generate ec keypair")?;
    let private = PrivateKey::new(KeypairData::Ecdsa(keypair), KEY_COMMENT)
        .context("failed to build ec private key")?;
    serialize(KEY_ALG_EC, &private)
}

fn serialize(key_alg: &'static str, private: &PrivateKey) -> Result<KeyPair> {
    let private_pem = private
        .to_openssh(LineEnding::LF)
        .context("failed to encode private key")?;
    let public_line = private
        .public_key()
        .to_openssh()
        .context("failed to encode public key")?;
    Ok(KeyPair {
        key_alg,
        private_pem: private_pem.trim().to_string(),
        public_line: public_line.trim().to_string(),
    })
}

/// Parse a stored authority private key.
///
/// # Errors
/// Returns an error if the PEM is invalid.
pub fn parse_private(pem: &str) -> Result<PrivateKey> {
    PrivateKey::from_openssh(pem).context("failed to parse authority private key")
}

#[cfg(test)]
mod tests {
    use super::{KEY_ALG_EC, generate_ec, parse_private};

    // RSA-4096 generation is too slow for the unit suite; the EC path
    // exercises the same serialize/parse plumbing.
    #[test]
    fn ec_keypair_round_trips_through_pem() {
        let pair = generate_ec().expect("generate");
        assert_eq!(pair.key_alg, KEY_ALG_EC);
        assert!(pair.private_pem.contains("BEGIN OPENSSH PRIVATE KEY"));
        assert!(pair.public_line.starts_with("ecdsa-sha2-nistp384 "));

        let parsed = parse_private(&pair.private_pem).expect("parse");
        let public = parsed.public_key().to_openssh().expect("public");
        assert_eq!(public.trim(), pair.public_line);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_private("not a key").is_err());
    }
}
