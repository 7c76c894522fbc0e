//! Browser-driven WAF cookie source.
//!
//! Drives the provider's login page through Chrome via CDP so the edge
//! layer's anti-bot challenge runs in a real browser context, then
//! harvests the clearance cookies it sets. Headful by default: the
//! challenge scripts fingerprint headless environments.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{filter_allowlisted, WafCookieSource};
use crate::client::USER_AGENT;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Upper bound on opening the login page.
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the page to report ready after navigation.
const PAGE_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed wait used when readiness never fires. Challenge pages often
/// keep a beacon request open indefinitely.
const FALLBACK_WAIT: Duration = Duration::from_secs(3);

/// Env var forcing headless operation ("1"/"true").
const HEADLESS_ENV: &str = "WAF_BROWSER_HEADLESS";

/// WAF cookie source backed by a locally launched Chrome.
pub struct BrowserWafSource {
    headless: bool,
}

impl BrowserWafSource {
    pub fn new(headless: bool) -> Self {
        Self { headless }
    }

    /// Headful unless `WAF_BROWSER_HEADLESS` says otherwise.
    pub fn from_env() -> Self {
        let headless = std::env::var(HEADLESS_ENV)
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        Self::new(headless)
    }

    fn browser_config(&self) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .window_size(1920, 1080)
            .no_sandbox()
            .args(vec![
                format!("--user-agent={USER_AGENT}"),
                "--disable-blink-features=AutomationControlled".to_string(),
                "--disable-dev-shm-usage".to_string(),
            ]);
        if !self.headless {
            builder = builder.with_head();
        }
        builder.build().map_err(|e| anyhow!(e))
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

#[async_trait]
impl WafCookieSource for BrowserWafSource {
    async fn fetch_waf_cookies(
        &self,
        login_url: &str,
    ) -> Result<Option<HashMap<String, String>>> {
        info!(url = login_url, "Starting browser to get WAF cookies");

        let (mut browser, mut handler) = Browser::launch(self.browser_config()?)
            .await
            .context("Failed to launch browser for WAF bypass")?;

        // CDP events must be pumped for the connection to stay alive.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let result = harvest_login_cookies(&browser, login_url).await;

        if let Err(e) = browser.close().await {
            warn!(error = %e, "Browser close failed");
        }
        let _ = browser.wait().await;
        handler_task.abort();

        result
    }
}

/// Navigate to the login page, let the challenge settle, and read the
/// allow-listed cookies.
async fn harvest_login_cookies(
    browser: &Browser,
    login_url: &str,
) -> Result<Option<HashMap<String, String>>> {
    let page = tokio::time::timeout(NAVIGATION_TIMEOUT, browser.new_page(login_url))
        .await
        .context("Timed out opening login page")?
        .context("Failed to open login page")?;

    // Give the challenge script a chance to finish; fall back to a
    // fixed wait when the page never reports ready.
    let settled = tokio::time::timeout(PAGE_SETTLE_TIMEOUT, page.wait_for_navigation()).await;
    if !matches!(settled, Ok(Ok(_))) {
        debug!(url = login_url, "Page never settled, using fallback wait");
        tokio::time::sleep(FALLBACK_WAIT).await;
    }

    let cookies = page
        .get_cookies()
        .await
        .context("Failed to read cookies from browser")?;

    let harvested: HashMap<String, String> = cookies
        .into_iter()
        .map(|cookie| (cookie.name, cookie.value))
        .collect();
    let waf_cookies = filter_allowlisted(harvested);

    if waf_cookies.is_empty() {
        warn!(url = login_url, "No WAF cookies obtained");
        return Ok(None);
    }

    info!(
        count = waf_cookies.len(),
        names = ?waf_cookies.keys().collect::<Vec<_>>(),
        "Successfully got WAF cookies"
    );

    Ok(Some(waf_cookies))
}
