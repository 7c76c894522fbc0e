//! Shared types for the ROLLCALL agent.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that the engine, client,
//! and notification modules can depend on them without circular
//! references.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw quota units per display currency unit. Upstream APIs report
/// balances as scaled integers; divide by this to get dollars.
pub const QUOTA_UNIT_DIVISOR: f64 = 500_000.0;

/// Maximum length of an error description carried into notifications.
pub const ERROR_TRUNCATE_LEN: usize = 50;

/// Truncate a message to `max` characters, appending an ellipsis when
/// anything was cut. Char-boundary safe.
pub fn truncate_chars(msg: &str, max: usize) -> String {
    if msg.chars().count() <= max {
        msg.to_string()
    } else {
        let head: String = msg.chars().take(max).collect();
        format!("{head}...")
    }
}

// ---------------------------------------------------------------------------
// User info
// ---------------------------------------------------------------------------

/// Balance information returned by a provider's user-info endpoint,
/// already scaled into currency units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub quota: f64,
    pub used_quota: f64,
}

impl UserInfo {
    /// Build from raw integer units, scaling by the fixed divisor and
    /// rounding to 2 decimals.
    pub fn from_raw(quota_raw: f64, used_raw: f64) -> Self {
        Self {
            quota: scale_quota(quota_raw),
            used_quota: scale_quota(used_raw),
        }
    }

    /// The balance line shown in notifications.
    pub fn display_line(&self) -> String {
        format!(
            "Current balance: ${}, Used: ${}",
            self.quota, self.used_quota
        )
    }
}

impl fmt::Display for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "quota=${} used=${}", self.quota, self.used_quota)
    }
}

/// Scale a raw quota value into currency units, rounded to 2 decimals.
pub fn scale_quota(raw: f64) -> f64 {
    (raw / QUOTA_UNIT_DIVISOR * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Failure taxonomy
// ---------------------------------------------------------------------------

/// Classified failure of a provider API call.
///
/// The WAF-vs-malformed-vs-success split is heuristic (string and
/// content-type signatures), not a protocol guarantee; see
/// `client::classify_user_info_response` for the ordered predicates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiFailure {
    /// The edge security layer served a verification challenge instead
    /// of the API response.
    #[error("WAF verification page detected")]
    WafBlocked,

    /// HTTP 200 but the body is neither a success payload nor a
    /// recognisable verification page.
    #[error("invalid response format")]
    Malformed,

    /// Non-200 status.
    #[error("HTTP {0}")]
    Status(u16),

    /// Connection / timeout / TLS level fault. Message pre-truncated.
    #[error("request failed: {0}")]
    Transport(String),

    /// Well-formed rejection from the server (e.g. "already checked in").
    #[error("check-in rejected: {0}")]
    Rejected(String),
}

impl ApiFailure {
    /// Whether another attempt is likely to clear this failure.
    ///
    /// WAF challenges and malformed bodies are usually the same
    /// challenge in disguise; transport faults are transient. Explicit
    /// rejections and plain HTTP errors are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiFailure::WafBlocked | ApiFailure::Malformed | ApiFailure::Transport(_)
        )
    }

    /// Build a `Transport` failure from any error, truncating the
    /// description so diagnostics don't leak into notifications.
    pub fn transport(err: impl fmt::Display) -> Self {
        ApiFailure::Transport(truncate_chars(&err.to_string(), ERROR_TRUNCATE_LEN))
    }
}

// ---------------------------------------------------------------------------
// Per-account outcome
// ---------------------------------------------------------------------------

/// Result of one account's check-in run. Created fresh each run,
/// never persisted.
#[derive(Debug, Clone)]
pub struct CheckinOutcome {
    pub account_name: String,
    pub success: bool,
    pub user_info: Option<UserInfo>,
    /// Classified error description when anything went wrong.
    pub error: Option<String>,
}

impl CheckinOutcome {
    pub fn success(account_name: &str, user_info: Option<UserInfo>) -> Self {
        Self {
            account_name: account_name.to_string(),
            success: true,
            user_info,
            error: None,
        }
    }

    pub fn failure(
        account_name: &str,
        user_info: Option<UserInfo>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            account_name: account_name.to_string(),
            success: false,
            user_info,
            error: Some(error.into()),
        }
    }

    /// Whether the balance query succeeded, regardless of check-in
    /// success. Only such outcomes contribute to the fingerprint.
    pub fn has_balance(&self) -> bool {
        self.user_info.is_some()
    }
}

impl fmt::Display for CheckinOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "SUCCESS" } else { "FAIL" };
        write!(f, "[{status}] {}", self.account_name)?;
        if let Some(info) = &self.user_info {
            write!(f, " ({info})")?;
        }
        if let Some(err) = &self.error {
            write!(f, ": {err}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Balance snapshot
// ---------------------------------------------------------------------------

/// Per-account balance captured during a run. Only `quota` feeds the
/// fingerprint; `used` moves every day and would defeat change
/// detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub quota: f64,
    pub used: f64,
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// Per-account entry in the structured notification payload.
#[derive(Debug, Clone, Serialize)]
pub struct AccountReport {
    pub name: String,
    pub success: bool,
    pub quota: f64,
    pub used_quota: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate statistics for a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    /// Percentage in [0, 100].
    pub success_rate: f64,
}

impl RunSummary {
    pub fn new(total: usize, success_count: usize) -> Self {
        Self {
            total,
            success_count,
            failed_count: total - success_count,
            success_rate: if total > 0 {
                success_count as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

/// Everything the Notification Dispatcher needs about a finished run.
/// Built once per run, consumed once, then discarded.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub accounts: Vec<AccountReport>,
    pub summary: RunSummary,
    /// Run timestamp, `%Y-%m-%d %H:%M:%S`.
    pub timestamp: String,
    /// Whether anything warrants a notification at all.
    pub need_notify: bool,
    /// Whether the balance fingerprint changed (or no prior one existed).
    pub balance_changed: bool,
    /// Plain-text summary for chat/push channels.
    pub notification_text: String,
}

impl RunReport {
    /// The contract with the invoking scheduler: 0 if at least one
    /// account succeeded, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.summary.success_count > 0 {
            0
        } else {
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
