//! Cookie preparation: merging user session cookies with freshly
//! obtained WAF clearance cookies.

use anyhow::{bail, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::waf::{WafCookieSource, WAF_COOKIE_ALLOWLIST};

// ---------------------------------------------------------------------------
// Cookie bundle
// ---------------------------------------------------------------------------

/// The cookie set carried by an attempt's HTTP session.
///
/// Merge order is WAF cookies first, user cookies overlaid on top, so
/// a user cookie wins on (conventionally impossible) name collisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieBundle {
    cookies: BTreeMap<String, String>,
}

impl CookieBundle {
    /// Bundle of user cookies only (provider without WAF).
    pub fn from_user(user: &HashMap<String, String>) -> Self {
        let mut cookies = BTreeMap::new();
        for (name, value) in user {
            cookies.insert(name.clone(), value.clone());
        }
        Self { cookies }
    }

    /// Merge WAF cookies with user cookies, user side winning.
    pub fn merged(waf: &HashMap<String, String>, user: &HashMap<String, String>) -> Self {
        let mut cookies = BTreeMap::new();
        for (name, value) in waf {
            cookies.insert(name.clone(), value.clone());
        }
        for (name, value) in user {
            cookies.insert(name.clone(), value.clone());
        }
        Self { cookies }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Serialize into a `Cookie` header value. Deterministic (sorted
    /// by name).
    pub fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ---------------------------------------------------------------------------
// Preparer
// ---------------------------------------------------------------------------

/// Prepares the cookie set for one attempt, invoking the WAF source
/// only when the provider requires clearance.
pub struct CookiePreparer<'a> {
    waf: &'a dyn WafCookieSource,
}

impl<'a> CookiePreparer<'a> {
    pub fn new(waf: &'a dyn WafCookieSource) -> Self {
        Self { waf }
    }

    /// Produce the bundle for this attempt.
    ///
    /// Success is lenient: at least one allow-listed WAF cookie counts.
    /// Missing members are informational, not fatal. Zero cookies is a
    /// failure.
    pub async fn prepare(
        &self,
        account_name: &str,
        provider: &ProviderConfig,
        user_cookies: &HashMap<String, String>,
    ) -> Result<CookieBundle> {
        if !provider.requires_waf {
            info!(
                account = account_name,
                "Using user cookies directly (no WAF bypass needed)"
            );
            return Ok(CookieBundle::from_user(user_cookies));
        }

        let login_url = provider.login_url();
        let waf_cookies = crate::waf::filter_allowlisted(
            self.waf
                .fetch_waf_cookies(&login_url)
                .await?
                .unwrap_or_default(),
        );

        if waf_cookies.is_empty() {
            warn!(account = account_name, "No WAF cookies obtained");
            bail!("no WAF cookies");
        }

        let missing: Vec<&str> = WAF_COOKIE_ALLOWLIST
            .iter()
            .copied()
            .filter(|name| !waf_cookies.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            debug!(
                account = account_name,
                missing = ?missing,
                "Some WAF cookies not found (may not be required)"
            );
        }

        info!(
            account = account_name,
            count = waf_cookies.len(),
            names = ?waf_cookies.keys().collect::<Vec<_>>(),
            "Got WAF cookies"
        );

        Ok(CookieBundle::merged(&waf_cookies, user_cookies))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
