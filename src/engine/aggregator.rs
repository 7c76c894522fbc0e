//! Run aggregator.
//!
//! Drives the account retry loop strictly sequentially (WAF evasion
//! needs human-like pacing), collects per-account outcomes, detects
//! balance changes against the persisted fingerprint, and builds the
//! notification payload. Dispatch happens only after every account has
//! completed.

use chrono::Local;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::client::SessionFactory;
use crate::config::{AccountConfig, AppConfig, RunTuning};
use crate::engine::account::AccountRunner;
use crate::fingerprint;
use crate::types::{AccountReport, BalanceSnapshot, RunReport, RunSummary};
use crate::waf::WafCookieSource;

/// Sequences accounts and produces the run report.
pub struct RunAggregator<'a> {
    waf: &'a dyn WafCookieSource,
    sessions: &'a dyn SessionFactory,
    tuning: RunTuning,
    /// Override for the fingerprint file, mainly for tests.
    fingerprint_path: Option<String>,
}

impl<'a> RunAggregator<'a> {
    pub fn new(
        waf: &'a dyn WafCookieSource,
        sessions: &'a dyn SessionFactory,
        tuning: RunTuning,
    ) -> Self {
        Self {
            waf,
            sessions,
            tuning,
            fingerprint_path: None,
        }
    }

    pub fn with_fingerprint_path(mut self, path: impl Into<String>) -> Self {
        self.fingerprint_path = Some(path.into());
        self
    }

    fn fingerprint_path(&self) -> Option<&str> {
        self.fingerprint_path.as_deref()
    }

    /// Process every account and assemble the report. Never fails:
    /// per-account errors are contained in their outcomes.
    pub async fn run(&self, config: &AppConfig, accounts: &[AccountConfig]) -> RunReport {
        let runner = AccountRunner::new(self.waf, self.sessions, self.tuning.clone());

        let last_fingerprint = match fingerprint::load(self.fingerprint_path()) {
            Ok(prev) => prev,
            Err(e) => {
                warn!(error = %e, "Failed to load balance fingerprint, treating as first run");
                None
            }
        };

        let total = accounts.len();
        let mut success_count = 0;
        let mut need_notify = false;
        let mut notification_content: Vec<String> = Vec::new();
        let mut current_balances: BTreeMap<String, BalanceSnapshot> = BTreeMap::new();
        let mut accounts_data: Vec<AccountReport> = Vec::new();

        for (i, account) in accounts.iter().enumerate() {
            let account_key = format!("account_{}", i + 1);
            let name = account.display_name(i);

            let outcome = runner.run(account, i, config).await;
            if outcome.success {
                success_count += 1;
            } else {
                need_notify = true;
                info!(account = %name, "Account failed, will send notification");
            }

            if let Some(user_info) = outcome.user_info {
                current_balances.insert(
                    account_key,
                    BalanceSnapshot {
                        quota: user_info.quota,
                        used: user_info.used_quota,
                    },
                );
                accounts_data.push(AccountReport {
                    name: name.clone(),
                    success: outcome.success,
                    quota: user_info.quota,
                    used_quota: user_info.used_quota,
                    error: outcome.error.clone(),
                });
            } else {
                accounts_data.push(AccountReport {
                    name: name.clone(),
                    success: false,
                    quota: 0.0,
                    used_quota: 0.0,
                    error: Some(
                        outcome
                            .error
                            .clone()
                            .unwrap_or_else(|| "Unknown error".to_string()),
                    ),
                });
            }

            if !outcome.success {
                let mut block = format!("[FAIL] {name}");
                if let Some(user_info) = &outcome.user_info {
                    block.push('\n');
                    block.push_str(&user_info.display_line());
                } else if let Some(error) = &outcome.error {
                    block.push('\n');
                    block.push_str(error);
                }
                notification_content.push(block);
            }

            // Pace between accounts; the last one doesn't wait.
            if i + 1 < total && !self.tuning.account_delay.is_zero() {
                info!(
                    delay_secs = self.tuning.account_delay.as_secs_f64(),
                    "Waiting before processing next account"
                );
                tokio::time::sleep(self.tuning.account_delay).await;
            }
        }

        // Change detection over successfully fetched balances only.
        let current_fingerprint = if current_balances.is_empty() {
            None
        } else {
            Some(fingerprint::compute(&current_balances))
        };

        let mut balance_changed = false;
        if let Some(current) = &current_fingerprint {
            match &last_fingerprint {
                None => {
                    balance_changed = true;
                    need_notify = true;
                    info!("First run detected, will send notification with current balances");
                }
                Some(previous) if previous != current => {
                    balance_changed = true;
                    need_notify = true;
                    info!("Balance changes detected, will send notification");
                }
                Some(_) => info!("No balance changes detected"),
            }
        }

        if balance_changed {
            backfill_balance_lines(
                accounts,
                &current_balances,
                &mut notification_content,
            );
        }

        if let Some(current) = &current_fingerprint {
            if let Err(e) = fingerprint::save(current, self.fingerprint_path()) {
                warn!(error = %e, "Failed to save balance fingerprint");
            }
        }

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let summary = RunSummary::new(total, success_count);
        let notification_text =
            build_notification_text(&timestamp, &notification_content, &summary);

        RunReport {
            accounts: accounts_data,
            summary,
            timestamp,
            need_notify,
            balance_changed,
            notification_text,
        }
    }
}

/// Append a balance line for every successfully fetched account that
/// is not already mentioned in the notification.
///
/// Dedup is substring containment of the display name in the existing
/// blocks. Fragile when one account's name is a substring of
/// another's; kept as-is because fixing the matching would change
/// which notifications users see.
fn backfill_balance_lines(
    accounts: &[AccountConfig],
    balances: &BTreeMap<String, BalanceSnapshot>,
    content: &mut Vec<String>,
) {
    for (i, account) in accounts.iter().enumerate() {
        let account_key = format!("account_{}", i + 1);
        let Some(balance) = balances.get(&account_key) else {
            continue;
        };
        let name = account.display_name(i);
        if content.iter().any(|block| block.contains(&name)) {
            continue;
        }
        content.push(format!(
            "[BALANCE] {name}\nCurrent balance: ${}, Used: ${}",
            balance.quota, balance.used
        ));
    }
}

/// Assemble the plain-text notification: time info, per-account
/// blocks, then the stats summary.
fn build_notification_text(
    timestamp: &str,
    content: &[String],
    summary: &RunSummary,
) -> String {
    let verdict = if summary.success_count == summary.total {
        "All accounts check-in successful!"
    } else if summary.success_count > 0 {
        "Some accounts check-in successful"
    } else {
        "All accounts check-in failed"
    };

    let stats = [
        "Check-in result statistics:".to_string(),
        format!("Success: {}/{}", summary.success_count, summary.total),
        format!("Failed: {}/{}", summary.failed_count, summary.total),
        verdict.to_string(),
    ];

    let time_info = format!("Execution time: {timestamp}");

    [time_info, content.join("\n"), stats.join("\n")].join("\n\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CookieMaterial;

    fn account(name: &str) -> AccountConfig {
        AccountConfig {
            name: Some(name.to_string()),
            provider: "anyrouter".to_string(),
            cookies: CookieMaterial::Raw("session=s".to_string()),
            api_user: "1".to_string(),
        }
    }

    #[test]
    fn test_notification_text_layout() {
        let summary = RunSummary::new(2, 1);
        let content = vec!["[FAIL] acct-a\nHTTP 503".to_string()];
        let text = build_notification_text("2026-08-06 09:00:00", &content, &summary);

        assert!(text.starts_with("Execution time: 2026-08-06 09:00:00"));
        assert!(text.contains("[FAIL] acct-a"));
        assert!(text.contains("Success: 1/2"));
        assert!(text.contains("Failed: 1/2"));
        assert!(text.contains("Some accounts check-in successful"));
    }

    #[test]
    fn test_notification_text_verdicts() {
        let all = build_notification_text("t", &[], &RunSummary::new(2, 2));
        assert!(all.contains("All accounts check-in successful!"));

        let none = build_notification_text("t", &[], &RunSummary::new(2, 0));
        assert!(none.contains("All accounts check-in failed"));
    }

    #[test]
    fn test_backfill_adds_missing_accounts() {
        let accounts = vec![account("alpha"), account("beta")];
        let balances = BTreeMap::from([
            (
                "account_1".to_string(),
                BalanceSnapshot { quota: 2.0, used: 0.5 },
            ),
            (
                "account_2".to_string(),
                BalanceSnapshot { quota: 4.0, used: 1.0 },
            ),
        ]);
        let mut content = Vec::new();

        backfill_balance_lines(&accounts, &balances, &mut content);

        assert_eq!(content.len(), 2);
        assert!(content[0].contains("[BALANCE] alpha"));
        assert!(content[0].contains("$2"));
        assert!(content[1].contains("[BALANCE] beta"));
    }

    #[test]
    fn test_backfill_dedups_by_substring() {
        let accounts = vec![account("alpha")];
        let balances = BTreeMap::from([(
            "account_1".to_string(),
            BalanceSnapshot { quota: 2.0, used: 0.5 },
        )]);
        let mut content = vec!["[FAIL] alpha\nHTTP 503".to_string()];

        backfill_balance_lines(&accounts, &balances, &mut content);

        assert_eq!(content.len(), 1);
    }

    #[test]
    fn test_backfill_skips_accounts_without_balance() {
        let accounts = vec![account("alpha"), account("beta")];
        let balances = BTreeMap::from([(
            "account_2".to_string(),
            BalanceSnapshot { quota: 4.0, used: 1.0 },
        )]);
        let mut content = Vec::new();

        backfill_balance_lines(&accounts, &balances, &mut content);

        assert_eq!(content.len(), 1);
        assert!(content[0].contains("beta"));
    }

    #[test]
    fn test_backfill_substring_collision_is_known_gap() {
        // "alpha" is a substring of "alpha-2": the shorter name's
        // balance line is suppressed by the longer name's block.
        let accounts = vec![account("alpha")];
        let balances = BTreeMap::from([(
            "account_1".to_string(),
            BalanceSnapshot { quota: 2.0, used: 0.5 },
        )]);
        let mut content = vec!["[FAIL] alpha-2\nHTTP 503".to_string()];

        backfill_balance_lines(&accounts, &balances, &mut content);

        assert_eq!(content.len(), 1);
    }
}
