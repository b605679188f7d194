//! Client for the external identity broker.
//!
//! The broker owns the provider-specific OAuth/SAML legs. The gateway sends
//! it a request carrying `state` and `secret` and gets back the URL the
//! browser should be redirected to; the broker later calls back with the
//! same `state` and an HMAC signature computed from `secret`.

use anyhow::{Context, Result, anyhow};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::provider::Provider;
use crate::user::UserKind;

const BROKER_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Serialize)]
struct RequestBody<'a> {
    license: &'a str,
    callback: &'a str,
    state: &'a str,
    secret: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    directory_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_secret: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RequestResponse {
    url: String,
}

#[derive(Debug, Serialize)]
struct GoogleRolesBody<'a> {
    license: &'a str,
    domain: &'a str,
    username: &'a str,
}

#[derive(Debug, Deserialize)]
struct GoogleRolesResponse {
    roles: Vec<String>,
}

/// HTTP client for the auth broker, shared process-wide.
#[derive(Clone, Debug)]
pub struct BrokerClient {
    client: Client,
    server: String,
    license: String,
}

impl BrokerClient {
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(server: &str, license: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(BROKER_TIMEOUT)
            .user_agent(crate::APP_USER_AGENT)
            .build()
            .context("failed to build broker http client")?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            license: license.to_string(),
        })
    }

    /// Originate an SSO request; returns the broker-supplied redirect URL.
    ///
    /// `provider` is absent for Google, where the account domain is only
    /// known at callback time.
    ///
    /// # Errors
    /// Returns an error on transport failure or a non-200 broker response.
    pub async fn request(
        &self,
        kind: UserKind,
        provider: Option<&Provider>,
        callback: &str,
        state: &str,
        secret: &str,
    ) -> Result<String> {
        let body = RequestBody {
            license: &self.license,
            callback,
            state,
            secret,
            directory_id: provider
                .filter(|p| p.kind == UserKind::Azure)
                .map(|p| p.tenant.as_str()),
            app_id: provider.map(|p| p.client_id.as_str()),
            app_secret: provider.map(|p| p.client_secret.as_str()),
        };

        let url = format!("{}/v1/request/{}", self.server, kind.as_str());
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("auth broker request failed")?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(anyhow!("auth broker error {}", resp.status()));
        }

        let data: RequestResponse = resp
            .json()
            .await
            .context("failed to parse auth broker response")?;
        Ok(data.url)
    }

    /// Fetch the Google group roles for an account.
    ///
    /// # Errors
    /// Returns an error on transport failure or a non-200 broker response.
    pub async fn google_roles(&self, provider: &Provider, username: &str) -> Result<Vec<String>> {
        let body = GoogleRolesBody {
            license: &self.license,
            domain: &provider.domain,
            username,
        };

        let url = format!("{}/v1/roles/google", self.server);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("google roles request failed")?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(anyhow!("google roles error {}", resp.status()));
        }

        let data: GoogleRolesResponse = resp
            .json()
            .await
            .context("failed to parse google roles response")?;
        Ok(data.roles)
    }
}

#[cfg(test)]
mod tests {
    use super::RequestBody;

    #[test]
    fn request_body_omits_absent_provider_fields() {
        let body = RequestBody {
            license: "lic",
            callback: "https://gw/auth/callback",
            state: "s",
            secret: "k",
            directory_id: None,
            app_id: None,
            app_secret: None,
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert!(json.get("directory_id").is_none());
        assert!(json.get("app_id").is_none());
        assert_eq!(json["state"], "s");
    }
}
