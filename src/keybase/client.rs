//! Keybase API client.

use anyhow::{Context, Result, anyhow};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;

const KEYBASE_BASE_URL: &str = "https://keybase.io";
const KEYBASE_TIMEOUT: Duration = Duration::from_secs(20);
const LOOKUP_FIELDS: &str = "basics,proofs_summary,pictures,public_keys";

/// Public profile data shown while approving an association.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Info {
    pub username: String,
    pub picture: String,
    pub twitter: String,
    pub github: String,
    /// Keybase's id for the primary key; rotation changes it.
    #[serde(skip_serializing)]
    pub ukbid: String,
}

#[derive(Debug, Deserialize)]
struct LookupStatus {
    code: i64,
}

#[derive(Debug, Deserialize, Default)]
struct LookupBasics {
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize, Default)]
struct LookupProof {
    #[serde(default)]
    nametag: String,
}

#[derive(Debug, Deserialize, Default)]
struct LookupProofTypes {
    #[serde(default)]
    github: Vec<LookupProof>,
    #[serde(default)]
    twitter: Vec<LookupProof>,
}

#[derive(Debug, Deserialize, Default)]
struct LookupProofs {
    #[serde(default)]
    by_proof_type: LookupProofTypes,
}

#[derive(Debug, Deserialize, Default)]
struct LookupPicture {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize, Default)]
struct LookupPictures {
    #[serde(default)]
    primary: LookupPicture,
}

#[derive(Debug, Deserialize, Default)]
struct LookupPrimaryKey {
    #[serde(default)]
    ukbid: String,
}

#[derive(Debug, Deserialize, Default)]
struct LookupPublicKeys {
    #[serde(default)]
    primary: LookupPrimaryKey,
}

#[derive(Debug, Deserialize, Default)]
struct LookupThem {
    #[serde(default)]
    basics: LookupBasics,
    #[serde(default)]
    proofs_summary: LookupProofs,
    #[serde(default)]
    pictures: LookupPictures,
    #[serde(default)]
    public_keys: LookupPublicKeys,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    status: LookupStatus,
    #[serde(default)]
    them: LookupThem,
}

#[derive(Debug, Serialize)]
struct SigCheckBody<'a> {
    username: &'a str,
    message: &'a str,
    signature: &'a str,
}

#[derive(Debug, Deserialize)]
struct SigCheckResponse {
    status: LookupStatus,
    #[serde(default)]
    valid: bool,
}

/// HTTP client for keybase.io, shared process-wide.
#[derive(Clone, Debug)]
pub struct KeybaseClient {
    client: Client,
    base_url: String,
}

impl KeybaseClient {
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        Self::with_base_url(KEYBASE_BASE_URL)
    }

    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(KEYBASE_TIMEOUT)
            .user_agent(crate::APP_USER_AGENT)
            .build()
            .context("failed to build keybase http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch a user's public profile and primary-key id.
    ///
    /// # Errors
    /// Returns an error on transport failure or an unknown username.
    pub async fn lookup(&self, username: &str) -> Result<Info> {
        let url = format!(
            "{}/_/api/1.0/user/lookup.json?username={username}&fields={LOOKUP_FIELDS}",
            self.base_url
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("keybase lookup request failed")?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(anyhow!("keybase lookup bad status {}", resp.status()));
        }

        let data: LookupResponse = resp
            .json()
            .await
            .context("failed to parse keybase lookup response")?;
        if data.status.code != 0 {
            return Err(anyhow!("keybase lookup error code {}", data.status.code));
        }

        Ok(Info {
            username: data.them.basics.username,
            picture: data.them.pictures.primary.url,
            twitter: data
                .them
                .proofs_summary
                .by_proof_type
                .twitter
                .first()
                .map(|proof| proof.nametag.clone())
                .unwrap_or_default(),
            github: data
                .them
                .proofs_summary
                .by_proof_type
                .github
                .first()
                .map(|proof| proof.nametag.clone())
                .unwrap_or_default(),
            ukbid: data.them.public_keys.primary.ukbid,
        })
    }

    /// Verify a detached Keybase signature over a challenge message.
    ///
    /// # Errors
    /// Returns an error on transport failure; an invalid signature is
    /// `Ok(false)`.
    pub async fn verify_sig(
        &self,
        message: &str,
        signature: &str,
        username: &str,
    ) -> Result<bool> {
        let body = SigCheckBody {
            username,
            message,
            signature,
        };
        let url = format!("{}/_/api/1.0/sig/check.json", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("keybase signature check failed")?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(anyhow!(
                "keybase signature check bad status {}",
                resp.status()
            ));
        }

        let data: SigCheckResponse = resp
            .json()
            .await
            .context("failed to parse keybase signature response")?;
        Ok(data.status.code == 0 && data.valid)
    }
}

#[cfg(test)]
mod tests {
    use super::LookupResponse;

    #[test]
    fn lookup_response_tolerates_missing_fields() {
        let json = r#"{"status":{"code":0,"name":"OK"},"them":{"basics":{"username":"alice"}}}"#;
        let parsed: LookupResponse = serde_json::from_str(json).expect("parse");
        assert_eq!(parsed.status.code, 0);
        assert_eq!(parsed.them.basics.username, "alice");
        assert!(parsed.them.public_keys.primary.ukbid.is_empty());
    }

    #[test]
    fn lookup_response_reads_ukbid_and_proofs() {
        let json = r#"{
            "status": {"code": 0, "name": "OK"},
            "them": {
                "basics": {"username": "alice"},
                "proofs_summary": {"by_proof_type": {
                    "github": [{"proof_type": "github", "nametag": "alice-gh"}],
                    "twitter": []
                }},
                "pictures": {"primary": {"url": "https://img"}},
                "public_keys": {"primary": {"kid": "k", "ukbid": "ukb-1"}}
            }
        }"#;
        let parsed: LookupResponse = serde_json::from_str(json).expect("parse");
        assert_eq!(parsed.them.public_keys.primary.ukbid, "ukb-1");
        assert_eq!(parsed.them.proofs_summary.by_proof_type.github[0].nametag, "alice-gh");
        assert_eq!(parsed.them.pictures.primary.url, "https://img");
    }
}
