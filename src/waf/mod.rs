//! WAF clearance cookie acquisition.
//!
//! Defines the `WafCookieSource` capability trait and the browser-based
//! implementation. The browser step is slow and opaque by nature, so it
//! stays behind a single-method seam that the engine and tests can
//! substitute with a deterministic stub.

pub mod browser;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Cookie names recognised as WAF clearance tokens. Anything else the
/// challenge page sets is ignored.
pub const WAF_COOKIE_ALLOWLIST: [&str; 3] = ["acw_tc", "cdn_sec_tc", "acw_sc__v2"];

/// Abstraction over WAF clearance cookie providers.
///
/// Implementors drive the provider's login page through a real browser
/// and harvest the cookies the edge layer sets once the anti-bot
/// challenge clears.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WafCookieSource: Send + Sync {
    /// Fetch WAF clearance cookies for the given login URL.
    ///
    /// The returned map contains only allow-listed names. `None` means
    /// the challenge produced nothing usable (distinct from a transport
    /// error, which is an `Err`).
    async fn fetch_waf_cookies(
        &self,
        login_url: &str,
    ) -> Result<Option<HashMap<String, String>>>;
}

/// Keep only allow-listed cookie names.
pub fn filter_allowlisted(cookies: HashMap<String, String>) -> HashMap<String, String> {
    cookies
        .into_iter()
        .filter(|(name, _)| WAF_COOKIE_ALLOWLIST.contains(&name.as_str()))
        .collect()
}
