//! Seam to the secondary-factor mechanisms.
//!
//! The gateway orchestrates step-up tickets; the actual push/OTP/SMS
//! verification is delegated through `FactorClient`. The default
//! implementation hands the exchange to the same auth broker that fronts
//! the SSO providers.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{Factor, SecondaryProvider};
use crate::user::User;

const FACTOR_TIMEOUT: Duration = Duration::from_secs(20);

/// Outcome of one factor exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FactorStatus {
    Approved,
    Denied,
    /// Mechanism started (push sent, SMS queued); verify again later.
    Pending,
}

#[async_trait]
pub trait FactorClient: Send + Sync {
    /// Run one step of the factor exchange.
    async fn authenticate(
        &self,
        provider: &SecondaryProvider,
        user: &User,
        factor: Factor,
        passcode: Option<&str>,
    ) -> Result<FactorStatus>;
}

#[derive(Debug, Serialize)]
struct FactorBody<'a> {
    license: &'a str,
    username: &'a str,
    factor: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    passcode: Option<&'a str>,
}

/// Broker-backed factor client.
#[derive(Clone, Debug)]
pub struct BrokerFactorClient {
    client: Client,
    server: String,
    license: String,
}

impl BrokerFactorClient {
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(server: &str, license: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(FACTOR_TIMEOUT)
            .user_agent(crate::APP_USER_AGENT)
            .build()
            .context("failed to build factor http client")?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            license: license.to_string(),
        })
    }
}

#[async_trait]
impl FactorClient for BrokerFactorClient {
    async fn authenticate(
        &self,
        provider: &SecondaryProvider,
        user: &User,
        factor: Factor,
        passcode: Option<&str>,
    ) -> Result<FactorStatus> {
        let body = FactorBody {
            license: &self.license,
            username: &user.username,
            factor: factor.as_str(),
            passcode,
        };

        let url = format!("{}/v1/secondary/{}", self.server, provider.kind);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("secondary factor request failed")?;

        match resp.status().as_u16() {
            200 => Ok(FactorStatus::Approved),
            201 | 202 => Ok(FactorStatus::Pending),
            401 | 403 => Ok(FactorStatus::Denied),
            status => Err(anyhow!("secondary factor error {status}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FactorBody;

    #[test]
    fn factor_body_omits_absent_passcode() {
        let body = FactorBody {
            license: "lic",
            username: "alice",
            factor: "push",
            passcode: None,
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert!(json.get("passcode").is_none());
        assert_eq!(json["factor"], "push");

        let body = FactorBody {
            license: "lic",
            username: "alice",
            factor: "sms",
            passcode: Some("123456"),
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["passcode"], "123456");
    }
}
