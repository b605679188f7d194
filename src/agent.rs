//! Request agent snapshots stored with sessions, audits and certificates.

use axum::http::HeaderMap;
use axum::http::header::USER_AGENT;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// What we know about the client that made a request.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Agent {
    pub ip: String,
    pub operating_system: String,
    pub browser: String,
    pub country: String,
}

impl Agent {
    /// Snapshot the calling client from request headers.
    ///
    /// The gateway always sits behind its own proxy layer, so the client
    /// address comes from `X-Forwarded-For` (first hop) when present.
    #[must_use]
    pub fn parse(headers: &HeaderMap) -> Self {
        let ip = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        let country = headers
            .get("x-country-code")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_uppercase();

        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        Self {
            ip,
            operating_system: operating_system(user_agent).to_string(),
            browser: browser(user_agent).to_string(),
            country,
        }
    }
}

fn operating_system(user_agent: &str) -> &'static str {
    // Order matters: Android UAs also contain "Linux", iOS UAs "Mac OS".
    if user_agent.contains("Android") {
        "android"
    } else if user_agent.contains("iPhone") || user_agent.contains("iPad") {
        "ios"
    } else if user_agent.contains("Windows") {
        "windows"
    } else if user_agent.contains("Mac OS") || user_agent.contains("Macintosh") {
        "macos"
    } else if user_agent.contains("CrOS") {
        "chrome_os"
    } else if user_agent.contains("Linux") {
        "linux"
    } else {
        ""
    }
}

fn browser(user_agent: &str) -> &'static str {
    // Chrome UAs contain "Safari", Edge UAs contain "Chrome".
    if user_agent.contains("Edg/") || user_agent.contains("Edge/") {
        "edge"
    } else if user_agent.contains("OPR/") || user_agent.contains("Opera") {
        "opera"
    } else if user_agent.contains("Chrome/") || user_agent.contains("Chromium/") {
        "chrome"
    } else if user_agent.contains("Firefox/") {
        "firefox"
    } else if user_agent.contains("Safari/") {
        "safari"
    } else if user_agent.contains("curl/") {
        "curl"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::Agent;
    use axum::http::{HeaderMap, HeaderValue};

    const CHROME_LINUX: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

    #[test]
    fn parses_forwarded_ip_and_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("user-agent", HeaderValue::from_static(CHROME_LINUX));
        headers.insert("x-country-code", HeaderValue::from_static("de"));

        let agent = Agent::parse(&headers);
        assert_eq!(agent.ip, "203.0.113.7");
        assert_eq!(agent.operating_system, "linux");
        assert_eq!(agent.browser, "chrome");
        assert_eq!(agent.country, "DE");
    }

    #[test]
    fn android_wins_over_linux() {
        let ua = "Mozilla/5.0 (Linux; Android 14) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/126.0.0.0 Mobile Safari/537.36";
        assert_eq!(super::operating_system(ua), "android");
        assert_eq!(super::browser(ua), "chrome");
    }

    #[test]
    fn safari_only_without_chrome_token() {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
             (KHTML, like Gecko) Version/17.4 Safari/605.1.15";
        assert_eq!(super::operating_system(ua), "macos");
        assert_eq!(super::browser(ua), "safari");
    }

    #[test]
    fn empty_headers_produce_empty_snapshot() {
        let agent = Agent::parse(&HeaderMap::new());
        assert_eq!(agent, Agent::default());
    }
}
