//! Provider API client.
//!
//! Opens a per-attempt HTTP session pre-loaded with the prepared
//! cookie bundle and a browser-like header set, then classifies the
//! user-info and check-in responses.
//!
//! Classification is an ordered set of heuristics, not a protocol:
//! JSON-success first, then WAF signature match, then malformed. The
//! WAF signatures are string/content-type sniffs that have been
//! observed in the wild; they are documented as heuristic, not
//! guaranteed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, COOKIE};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::{AccountConfig, ProviderConfig};
use crate::cookies::CookieBundle;
use crate::types::{truncate_chars, ApiFailure, UserInfo, ERROR_TRUNCATE_LEN};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Desktop UA sent on every request, and by the WAF bypass browser.
/// The two must match or the edge layer invalidates the clearance.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

/// Timeout for every API call.
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// How far into the body the `<html` prefix sniff looks.
const HTML_PREFIX_SCAN: usize = 100;

/// How far into the body the challenge-marker sniff looks.
const CHALLENGE_MARKER_SCAN: usize = 200;

// ---------------------------------------------------------------------------
// Response classification
// ---------------------------------------------------------------------------

/// First `n` characters of a body, char-boundary safe.
fn prefix(body: &str, n: usize) -> String {
    body.chars().take(n).collect()
}

/// Signature predicates, in the order they are consulted. Each takes
/// the lower-cased content type and body.
fn is_html_content_type(content_type: &str) -> bool {
    content_type.contains("html")
}

fn has_html_prefix(body: &str) -> bool {
    prefix(body, HTML_PREFIX_SCAN).contains("<html")
}

fn has_challenge_marker(body: &str) -> bool {
    let head = prefix(body, CHALLENGE_MARKER_SCAN);
    head.contains("verification") || head.contains("cloudflare") || head.contains("acw_tc")
}

fn has_block_banner(body: &str) -> bool {
    body.contains("sorry, you have been blocked") || body.contains("access denied")
}

/// Whether a response smells like a WAF verification page.
pub fn looks_like_waf_page(content_type: &str, body: &str) -> bool {
    let content_type = content_type.to_lowercase();
    let body = body.to_lowercase();

    is_html_content_type(&content_type)
        || has_html_prefix(&body)
        || has_challenge_marker(&body)
        || has_block_banner(&body)
}

/// Classify a user-info response into balance data or a failure.
///
/// Ranked predicates: JSON-success → WAF-signature-match → malformed.
pub fn classify_user_info_response(
    status: u16,
    content_type: &str,
    body: &str,
) -> Result<UserInfo, ApiFailure> {
    if status != 200 {
        return Err(ApiFailure::Status(status));
    }

    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if json.get("success").and_then(Value::as_bool).unwrap_or(false) {
            let data = json.get("data").cloned().unwrap_or(Value::Null);
            let quota_raw = data.get("quota").and_then(Value::as_f64).unwrap_or(0.0);
            let used_raw = data.get("used_quota").and_then(Value::as_f64).unwrap_or(0.0);
            return Ok(UserInfo::from_raw(quota_raw, used_raw));
        }
    }

    if looks_like_waf_page(content_type, body) {
        return Err(ApiFailure::WafBlocked);
    }

    Err(ApiFailure::Malformed)
}

/// Classify a check-in response.
///
/// JSON bodies succeed on any of `ret == 1`, `code == 0`,
/// `success == true`; otherwise the server message is surfaced.
/// Non-JSON bodies succeed only on a literal "success" substring.
pub fn classify_checkin_response(status: u16, body: &str) -> Result<(), ApiFailure> {
    if status != 200 {
        return Err(ApiFailure::Status(status));
    }

    match serde_json::from_str::<Value>(body) {
        Ok(json) => {
            let checked_in = json.get("ret").and_then(Value::as_i64) == Some(1)
                || json.get("code").and_then(Value::as_i64) == Some(0)
                || json.get("success").and_then(Value::as_bool).unwrap_or(false);
            if checked_in {
                Ok(())
            } else {
                let message = json
                    .get("msg")
                    .or_else(|| json.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error");
                Err(ApiFailure::Rejected(truncate_chars(
                    message,
                    ERROR_TRUNCATE_LEN,
                )))
            }
        }
        Err(_) => {
            if body.to_lowercase().contains("success") {
                Ok(())
            } else {
                Err(ApiFailure::Rejected("invalid response format".to_string()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Provider API session
// ---------------------------------------------------------------------------

/// One attempt's authenticated view of a provider.
///
/// Implementors carry the prepared cookies and headers; the engine
/// only sees these two operations.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Fetch balance/profile information.
    async fn fetch_user_info(&self) -> Result<UserInfo, ApiFailure>;

    /// Perform the explicit check-in call. Only invoked for providers
    /// that don't auto-check-in on the info fetch.
    async fn perform_checkin(&self) -> Result<(), ApiFailure>;
}

/// Opens a fresh session per attempt. The retry loop drops the session
/// at the end of each attempt, which closes its connections on every
/// exit path.
pub trait SessionFactory: Send + Sync {
    fn open(
        &self,
        provider: &ProviderConfig,
        account: &AccountConfig,
        cookies: &CookieBundle,
    ) -> Result<Box<dyn ProviderApi>>;
}

/// Real HTTP session over reqwest.
pub struct HttpProviderApi {
    http: reqwest::Client,
    user_info_url: String,
    sign_in_url: String,
}

impl HttpProviderApi {
    /// Build the session: fixed browser-like headers, the provider's
    /// user-id header, the merged cookie header, and a 30 s timeout.
    pub fn open(
        provider: &ProviderConfig,
        account: &AccountConfig,
        cookies: &CookieBundle,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );
        headers.insert(
            reqwest::header::REFERER,
            HeaderValue::from_str(&provider.domain).context("Invalid provider domain")?,
        );
        headers.insert(
            reqwest::header::ORIGIN,
            HeaderValue::from_str(&provider.domain).context("Invalid provider domain")?,
        );
        headers.insert(reqwest::header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("empty"));
        headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("cors"));
        headers.insert("Sec-Fetch-Site", HeaderValue::from_static("same-origin"));

        let user_id_header = HeaderName::from_bytes(provider.user_id_header.as_bytes())
            .context("Invalid user-id header name")?;
        headers.insert(
            user_id_header,
            HeaderValue::from_str(&account.api_user).context("Invalid api_user value")?,
        );

        if !cookies.is_empty() {
            headers.insert(
                COOKIE,
                HeaderValue::from_str(&cookies.header_value())
                    .context("Invalid cookie value")?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(API_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            user_info_url: provider.user_info_url(),
            sign_in_url: provider.sign_in_url(),
        })
    }
}

#[async_trait]
impl ProviderApi for HttpProviderApi {
    async fn fetch_user_info(&self) -> Result<UserInfo, ApiFailure> {
        let response = self
            .http
            .get(&self.user_info_url)
            .send()
            .await
            .map_err(ApiFailure::transport)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.text().await.map_err(ApiFailure::transport)?;

        debug!(
            status,
            content_type = %content_type,
            preview = %truncate_chars(&body, 300),
            "User info response"
        );

        classify_user_info_response(status, &content_type, &body)
    }

    async fn perform_checkin(&self) -> Result<(), ApiFailure> {
        let response = self
            .http
            .post(&self.sign_in_url)
            .header(CONTENT_TYPE, "application/json")
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await
            .map_err(ApiFailure::transport)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(ApiFailure::transport)?;

        debug!(status, preview = %truncate_chars(&body, 300), "Check-in response");

        classify_checkin_response(status, &body)
    }
}

/// The production factory.
pub struct HttpSessionFactory;

impl SessionFactory for HttpSessionFactory {
    fn open(
        &self,
        provider: &ProviderConfig,
        account: &AccountConfig,
        cookies: &CookieBundle,
    ) -> Result<Box<dyn ProviderApi>> {
        Ok(Box::new(HttpProviderApi::open(provider, account, cookies)?))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CookieMaterial;
    use std::collections::HashMap;

    // -- User info classification --

    #[test]
    fn test_user_info_json_success() {
        let body = r#"{"success": true, "data": {"quota": 1000000, "used_quota": 250000}}"#;
        let info = classify_user_info_response(200, "application/json", body).unwrap();
        assert_eq!(info.quota, 2.0);
        assert_eq!(info.used_quota, 0.5);
    }

    #[test]
    fn test_user_info_float_quota() {
        let body = r#"{"success": true, "data": {"quota": 123456.0, "used_quota": 0}}"#;
        let info = classify_user_info_response(200, "application/json", body).unwrap();
        assert_eq!(info.quota, 0.25);
    }

    #[test]
    fn test_user_info_missing_data_defaults_to_zero() {
        let body = r#"{"success": true}"#;
        let info = classify_user_info_response(200, "application/json", body).unwrap();
        assert_eq!(info.quota, 0.0);
        assert_eq!(info.used_quota, 0.0);
    }

    #[test]
    fn test_user_info_html_content_type_is_waf() {
        let result = classify_user_info_response(200, "text/html; charset=utf-8", "anything");
        assert_eq!(result.unwrap_err(), ApiFailure::WafBlocked);
    }

    #[test]
    fn test_user_info_html_prefix_is_waf() {
        let body = "<!DOCTYPE html><html><head>...</head></html>";
        let result = classify_user_info_response(200, "application/json", body);
        assert_eq!(result.unwrap_err(), ApiFailure::WafBlocked);
    }

    #[test]
    fn test_user_info_verification_marker_is_waf() {
        let body = "Please complete the verification challenge to continue";
        let result = classify_user_info_response(200, "application/json", body);
        assert_eq!(result.unwrap_err(), ApiFailure::WafBlocked);
    }

    #[test]
    fn test_user_info_block_banner_anywhere_is_waf() {
        let padding = "x".repeat(500);
        let body = format!("{padding} Sorry, you have been blocked");
        let result = classify_user_info_response(200, "text/plain", &body);
        assert_eq!(result.unwrap_err(), ApiFailure::WafBlocked);
    }

    #[test]
    fn test_user_info_marker_beyond_scan_window_is_malformed() {
        // "verification" past the 200-char window doesn't count.
        let padding = "x".repeat(300);
        let body = format!("{padding} verification");
        let result = classify_user_info_response(200, "text/plain", &body);
        assert_eq!(result.unwrap_err(), ApiFailure::Malformed);
    }

    #[test]
    fn test_user_info_success_false_with_waf_body() {
        // Well-formed JSON without the success flag still goes through
        // the signature scan.
        let body = r#"{"success": false, "detail": "acw_tc challenge"}"#;
        let result = classify_user_info_response(200, "application/json", body);
        assert_eq!(result.unwrap_err(), ApiFailure::WafBlocked);
    }

    #[test]
    fn test_user_info_garbage_is_malformed() {
        let result = classify_user_info_response(200, "text/plain", "not json at all");
        assert_eq!(result.unwrap_err(), ApiFailure::Malformed);
    }

    #[test]
    fn test_user_info_non_200() {
        let result = classify_user_info_response(503, "text/plain", "");
        assert_eq!(result.unwrap_err(), ApiFailure::Status(503));
    }

    // -- Check-in classification --

    #[test]
    fn test_checkin_ret_one() {
        assert!(classify_checkin_response(200, r#"{"ret": 1}"#).is_ok());
    }

    #[test]
    fn test_checkin_code_zero() {
        assert!(classify_checkin_response(200, r#"{"code": 0}"#).is_ok());
    }

    #[test]
    fn test_checkin_success_flag() {
        assert!(classify_checkin_response(200, r#"{"success": true}"#).is_ok());
    }

    #[test]
    fn test_checkin_rejection_surfaces_msg() {
        let result = classify_checkin_response(200, r#"{"ret": 0, "msg": "already checked in"}"#);
        assert_eq!(
            result.unwrap_err(),
            ApiFailure::Rejected("already checked in".to_string())
        );
    }

    #[test]
    fn test_checkin_rejection_message_key_fallback() {
        let result = classify_checkin_response(200, r#"{"code": 1, "message": "too early"}"#);
        assert_eq!(result.unwrap_err(), ApiFailure::Rejected("too early".to_string()));
    }

    #[test]
    fn test_checkin_rejection_no_message() {
        let result = classify_checkin_response(200, r#"{"code": 1}"#);
        assert_eq!(
            result.unwrap_err(),
            ApiFailure::Rejected("Unknown error".to_string())
        );
    }

    #[test]
    fn test_checkin_non_json_with_success_substring() {
        assert!(classify_checkin_response(200, "Check-in Success!").is_ok());
    }

    #[test]
    fn test_checkin_non_json_garbage() {
        let result = classify_checkin_response(200, "<garbage>");
        assert!(matches!(result.unwrap_err(), ApiFailure::Rejected(_)));
    }

    #[test]
    fn test_checkin_non_200() {
        assert_eq!(
            classify_checkin_response(429, "slow down").unwrap_err(),
            ApiFailure::Status(429)
        );
    }

    // -- Session construction --

    fn sample_provider() -> ProviderConfig {
        ProviderConfig {
            domain: "https://provider.example".to_string(),
            login_path: "/login".to_string(),
            user_info_path: "/api/user/self".to_string(),
            sign_in_path: "/api/user/sign_in".to_string(),
            user_id_header: "new-api-user".to_string(),
            requires_waf: true,
            auto_checkin_on_info_fetch: false,
        }
    }

    fn sample_account() -> AccountConfig {
        AccountConfig {
            name: Some("acct".to_string()),
            provider: "anyrouter".to_string(),
            cookies: CookieMaterial::Raw("session=abc".to_string()),
            api_user: "42".to_string(),
        }
    }

    #[test]
    fn test_open_session() {
        let provider = sample_provider();
        let account = sample_account();
        let bundle = CookieBundle::merged(
            &HashMap::from([("acw_tc".to_string(), "w".to_string())]),
            &account.cookies.parse(),
        );

        let session = HttpProviderApi::open(&provider, &account, &bundle).unwrap();
        assert_eq!(session.user_info_url, "https://provider.example/api/user/self");
        assert_eq!(session.sign_in_url, "https://provider.example/api/user/sign_in");
    }

    #[test]
    fn test_open_session_rejects_bad_header_name() {
        let mut provider = sample_provider();
        provider.user_id_header = "bad header\n".to_string();
        let account = sample_account();
        let bundle = CookieBundle::default();
        assert!(HttpProviderApi::open(&provider, &account, &bundle).is_err());
    }
}
