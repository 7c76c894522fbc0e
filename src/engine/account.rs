//! Account retry loop.
//!
//! Bounded-retry state machine for one account:
//! prepare cookies, open a session, fetch info, check in, with a
//! fixed delay between attempts. Retries fire on cookie preparation
//! failures, WAF-shaped fetch failures, and transport faults, but
//! never on explicit server rejections. The delay is deliberately
//! flat: the WAF reacts to request cadence, not backoff curves.

use tracing::{error, info, warn};

use crate::client::SessionFactory;
use crate::config::{AccountConfig, AppConfig, RunTuning};
use crate::cookies::CookiePreparer;
use crate::types::{truncate_chars, CheckinOutcome, ERROR_TRUNCATE_LEN};
use crate::waf::WafCookieSource;

/// Runs the check-in state machine for individual accounts.
pub struct AccountRunner<'a> {
    waf: &'a dyn WafCookieSource,
    sessions: &'a dyn SessionFactory,
    tuning: RunTuning,
}

impl<'a> AccountRunner<'a> {
    pub fn new(
        waf: &'a dyn WafCookieSource,
        sessions: &'a dyn SessionFactory,
        tuning: RunTuning,
    ) -> Self {
        Self {
            waf,
            sessions,
            tuning,
        }
    }

    /// Run one account to completion. Every failure mode is contained
    /// in the returned outcome; this never aborts the surrounding run.
    pub async fn run(
        &self,
        account: &AccountConfig,
        index: usize,
        config: &AppConfig,
    ) -> CheckinOutcome {
        let name = account.display_name(index);
        info!(account = %name, "Starting to process");

        let Some(provider) = config.provider(&account.provider) else {
            warn!(
                account = %name,
                provider = %account.provider,
                "Provider not found in configuration"
            );
            return CheckinOutcome::failure(
                &name,
                None,
                format!("provider \"{}\" not configured", account.provider),
            );
        };
        info!(
            account = %name,
            provider = %account.provider,
            domain = %provider.domain,
            "Using provider"
        );

        let user_cookies = account.cookies.parse();
        if user_cookies.is_empty() {
            warn!(account = %name, "Invalid cookie configuration");
            return CheckinOutcome::failure(&name, None, "invalid cookie configuration");
        }

        let preparer = CookiePreparer::new(self.waf);
        let max_retries = self.tuning.max_retries;
        let mut last_error: Option<String> = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                info!(
                    account = %name,
                    attempt = attempt + 1,
                    total = max_retries + 1,
                    delay_secs = self.tuning.retry_delay.as_secs_f64(),
                    "Retrying after delay"
                );
                tokio::time::sleep(self.tuning.retry_delay).await;
            }

            // Preparing: WAF clearance + merge with user cookies.
            let bundle = match preparer.prepare(&name, provider, &user_cookies).await {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!(account = %name, error = %e, "Cookie preparation failed");
                    last_error = Some(truncate_chars(&e.to_string(), ERROR_TRUNCATE_LEN));
                    continue;
                }
            };

            // Each attempt owns its session; dropping it at the end of
            // the iteration closes the connections on every exit path.
            let session = match self.sessions.open(provider, account, &bundle) {
                Ok(session) => session,
                Err(e) => {
                    warn!(account = %name, error = %e, "Failed to open HTTP session");
                    last_error = Some(truncate_chars(&e.to_string(), ERROR_TRUNCATE_LEN));
                    continue;
                }
            };

            // Fetching: balance/profile query.
            let info = session.fetch_user_info().await;
            match &info {
                Ok(user_info) => info!(account = %name, "{}", user_info.display_line()),
                Err(failure) => {
                    warn!(account = %name, error = %failure, "User info fetch failed");
                    if failure.is_retryable() && attempt < max_retries {
                        last_error = Some(failure.to_string());
                        continue;
                    }
                }
            }

            if provider.needs_manual_checkin() {
                info!(account = %name, "Executing check-in");
                match session.perform_checkin().await {
                    Ok(()) => {
                        info!(account = %name, "Check-in successful");
                        return CheckinOutcome::success(&name, info.ok());
                    }
                    Err(failure) => {
                        warn!(account = %name, error = %failure, "Check-in failed");
                        if failure.is_retryable() && attempt < max_retries {
                            last_error = Some(failure.to_string());
                            continue;
                        }
                        return CheckinOutcome::failure(&name, info.ok(), failure.to_string());
                    }
                }
            }

            // Auto-checkin providers: a successful info fetch is the
            // check-in.
            return match info {
                Ok(user_info) => {
                    info!(
                        account = %name,
                        "Check-in completed automatically (triggered by user info request)"
                    );
                    CheckinOutcome::success(&name, Some(user_info))
                }
                Err(failure) => CheckinOutcome::failure(&name, None, failure.to_string()),
            };
        }

        error!(account = %name, "All retry attempts exhausted");
        CheckinOutcome::failure(
            &name,
            None,
            last_error.unwrap_or_else(|| "all retry attempts exhausted".to_string()),
        )
    }
}
