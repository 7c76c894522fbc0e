//! Configuration loading from TOML with environment variable resolution.
//!
//! Providers live in `config.toml` and deserialize into strongly-typed
//! structs. Account credentials are secrets and come from the
//! `CHECKIN_ACCOUNTS` environment variable as JSON; run tuning knobs
//! (retries, delays) are plain env vars with defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

/// Env var holding the JSON array of account configurations.
pub const ACCOUNTS_ENV: &str = "CHECKIN_ACCOUNTS";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub providers: HashMap<String, ProviderConfig>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Look up a provider by the identifier an account references.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// A check-in backend: domain, endpoint paths, and behavioral flags.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Base domain including scheme, no trailing slash.
    pub domain: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_user_info_path")]
    pub user_info_path: String,
    #[serde(default = "default_sign_in_path")]
    pub sign_in_path: String,
    /// Header key carrying the account's user id.
    #[serde(default = "default_user_id_header")]
    pub user_id_header: String,
    /// Whether the domain sits behind a WAF challenge that must be
    /// cleared in a browser before API calls are accepted.
    #[serde(default)]
    pub requires_waf: bool,
    /// Providers where fetching user info performs the check-in
    /// server-side; no explicit sign-in call is needed.
    #[serde(default)]
    pub auto_checkin_on_info_fetch: bool,
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_user_info_path() -> String {
    "/api/user/self".to_string()
}

fn default_sign_in_path() -> String {
    "/api/user/sign_in".to_string()
}

fn default_user_id_header() -> String {
    "new-api-user".to_string()
}

impl ProviderConfig {
    pub fn login_url(&self) -> String {
        format!("{}{}", self.domain, self.login_path)
    }

    pub fn user_info_url(&self) -> String {
        format!("{}{}", self.domain, self.user_info_path)
    }

    pub fn sign_in_url(&self) -> String {
        format!("{}{}", self.domain, self.sign_in_path)
    }

    /// Whether a separate sign-in call is required after the info fetch.
    pub fn needs_manual_checkin(&self) -> bool {
        !self.auto_checkin_on_info_fetch
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Session cookie material as supplied by the user: either a
/// name→value map or a raw `"k=v; k2=v2"` header string.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum CookieMaterial {
    Map(HashMap<String, String>),
    Raw(String),
}

impl CookieMaterial {
    /// Normalize into a name→value map. A raw string is split on `;`,
    /// each fragment on the first `=`; fragments without `=` are
    /// dropped. Returns an empty map for empty/garbage input.
    pub fn parse(&self) -> HashMap<String, String> {
        match self {
            CookieMaterial::Map(map) => map.clone(),
            CookieMaterial::Raw(raw) => raw
                .split(';')
                .filter_map(|fragment| {
                    let fragment = fragment.trim();
                    fragment.split_once('=').map(|(name, value)| {
                        (name.trim().to_string(), value.to_string())
                    })
                })
                .collect(),
        }
    }
}

/// One account to check in. Immutable once loaded.
#[derive(Debug, Deserialize, Clone)]
pub struct AccountConfig {
    /// Optional display name; falls back to a positional label.
    #[serde(default)]
    pub name: Option<String>,
    /// Key into the provider table.
    pub provider: String,
    pub cookies: CookieMaterial,
    /// Provider-specific user identifier, sent as a header.
    pub api_user: String,
}

impl AccountConfig {
    /// Display name for logs and notifications, 1-based when positional.
    pub fn display_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("Account {}", index + 1),
        }
    }
}

/// Load the ordered account list from the environment.
///
/// Absence or malformed JSON is a configuration error: fatal to the
/// run, before any account is processed.
pub fn load_accounts() -> Result<Vec<AccountConfig>> {
    let raw = std::env::var(ACCOUNTS_ENV)
        .with_context(|| format!("Environment variable not set: {ACCOUNTS_ENV}"))?;
    parse_accounts(&raw)
}

pub fn parse_accounts(raw: &str) -> Result<Vec<AccountConfig>> {
    let accounts: Vec<AccountConfig> =
        serde_json::from_str(raw).context("Failed to parse accounts JSON")?;
    Ok(accounts)
}

// ---------------------------------------------------------------------------
// Run tuning
// ---------------------------------------------------------------------------

/// Environment-tunable pacing parameters.
#[derive(Debug, Clone)]
pub struct RunTuning {
    /// Extra attempts after the first (total attempts = max_retries + 1).
    pub max_retries: u32,
    /// Fixed delay between attempts. Deliberately non-exponential: the
    /// WAF reacts to request cadence, not backoff curves.
    pub retry_delay: Duration,
    /// Delay between accounts, never applied after the last.
    pub account_delay: Duration,
}

impl Default for RunTuning {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(5),
            account_delay: Duration::from_secs(5),
        }
    }
}

impl RunTuning {
    /// Read `MAX_RETRIES`, `RETRY_DELAY`, and `DELAY_BETWEEN_ACCOUNTS`
    /// from the environment, with defaults 2 / 5s / 5s.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_parse("MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_delay: env_parse::<f64>("RETRY_DELAY")
                .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
                .unwrap_or(defaults.retry_delay),
            account_delay: env_parse::<f64>("DELAY_BETWEEN_ACCOUNTS")
                .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
                .unwrap_or(defaults.account_delay),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TOML: &str = r#"
        [providers.anyrouter]
        domain = "https://anyrouter.example"
        requires_waf = true

        [providers.agentrouter]
        domain = "https://agentrouter.example"
        login_path = "/signin"
        auto_checkin_on_info_fetch = true
    "#;

    #[test]
    fn test_parse_providers() {
        let cfg = AppConfig::from_toml(SAMPLE_TOML).unwrap();
        assert_eq!(cfg.providers.len(), 2);

        let anyrouter = cfg.provider("anyrouter").unwrap();
        assert!(anyrouter.requires_waf);
        assert!(anyrouter.needs_manual_checkin());
        assert_eq!(anyrouter.login_url(), "https://anyrouter.example/login");
        assert_eq!(
            anyrouter.user_info_url(),
            "https://anyrouter.example/api/user/self"
        );
        assert_eq!(
            anyrouter.sign_in_url(),
            "https://anyrouter.example/api/user/sign_in"
        );
        assert_eq!(anyrouter.user_id_header, "new-api-user");

        let agentrouter = cfg.provider("agentrouter").unwrap();
        assert!(!agentrouter.requires_waf);
        assert!(!agentrouter.needs_manual_checkin());
        assert_eq!(agentrouter.login_url(), "https://agentrouter.example/signin");
    }

    #[test]
    fn test_unknown_provider_lookup() {
        let cfg = AppConfig::from_toml(SAMPLE_TOML).unwrap();
        assert!(cfg.provider("nope").is_none());
    }

    #[test]
    fn test_parse_accounts_with_cookie_map() {
        let raw = r#"[
            {"name": "main", "provider": "anyrouter",
             "cookies": {"session": "abc123"}, "api_user": "42"}
        ]"#;
        let accounts = parse_accounts(raw).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].display_name(0), "main");
        let cookies = accounts[0].cookies.parse();
        assert_eq!(cookies.get("session").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn test_parse_accounts_with_cookie_string() {
        let raw = r#"[
            {"provider": "anyrouter",
             "cookies": "session=abc123; token=x=y", "api_user": "42"}
        ]"#;
        let accounts = parse_accounts(raw).unwrap();
        let cookies = accounts[0].cookies.parse();
        assert_eq!(cookies.get("session").map(String::as_str), Some("abc123"));
        // First '=' splits; the rest stays in the value.
        assert_eq!(cookies.get("token").map(String::as_str), Some("x=y"));
    }

    #[test]
    fn test_positional_display_name() {
        let raw = r#"[{"provider": "anyrouter", "cookies": "s=1", "api_user": "1"}]"#;
        let accounts = parse_accounts(raw).unwrap();
        assert_eq!(accounts[0].display_name(2), "Account 3");
    }

    #[test]
    fn test_parse_accounts_rejects_garbage() {
        assert!(parse_accounts("not json").is_err());
        assert!(parse_accounts(r#"{"provider": "x"}"#).is_err());
    }

    #[test]
    fn test_cookie_string_garbage_fragments_dropped() {
        let material = CookieMaterial::Raw("nonsense; a=1;; =odd".to_string());
        let cookies = material.parse();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies.get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_tuning_defaults() {
        let tuning = RunTuning::default();
        assert_eq!(tuning.max_retries, 2);
        assert_eq!(tuning.retry_delay, Duration::from_secs(5));
        assert_eq!(tuning.account_delay, Duration::from_secs(5));
    }
}
