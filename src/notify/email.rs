//! SMTP email channel and the HTML report template.
//!
//! Delivery mirrors common personal-mailbox setups: try implicit TLS
//! on 465 first, fall back to STARTTLS on 587. The SMTP host defaults
//! to `smtp.<domain>` of the sender address unless overridden.

use anyhow::{Context, Result};
use async_trait::async_trait;
use handlebars::Handlebars;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{MessageKind, NotifyChannel};
use crate::types::RunReport;

/// Channel name used for email-skip matching in the dispatcher.
pub const CHANNEL_NAME: &str = "email";

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

pub struct EmailChannel {
    user: String,
    pass: String,
    to: String,
    smtp_server: String,
}

impl EmailChannel {
    /// Configured only when sender, password, and recipient are all set.
    pub fn from_env() -> Option<Self> {
        let user = std::env::var("EMAIL_USER").ok().filter(|v| !v.is_empty())?;
        let pass = std::env::var("EMAIL_PASS").ok().filter(|v| !v.is_empty())?;
        let to = std::env::var("EMAIL_TO").ok().filter(|v| !v.is_empty())?;
        let smtp_server = std::env::var("CUSTOM_SMTP_SERVER")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_smtp_server(&user));
        Some(Self {
            user,
            pass,
            to,
            smtp_server,
        })
    }

    fn message(&self, title: &str, content: &str, kind: MessageKind) -> Result<Message> {
        let from: Mailbox = format!("ROLLCALL Assistant <{}>", self.user)
            .parse()
            .context("Invalid sender address")?;
        let to: Mailbox = self.to.parse().context("Invalid recipient address")?;
        let content_type = match kind {
            MessageKind::Html => ContentType::TEXT_HTML,
            MessageKind::Text => ContentType::TEXT_PLAIN,
        };

        Message::builder()
            .from(from)
            .to(to)
            .subject(title)
            .header(content_type)
            .body(content.to_string())
            .context("Failed to build email message")
    }

    fn transport_465(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        Ok(
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.smtp_server)
                .context("Failed to configure SMTP relay")?
                .credentials(Credentials::new(self.user.clone(), self.pass.clone()))
                .build(),
        )
    }

    fn transport_587(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        Ok(
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.smtp_server)
                .context("Failed to configure SMTP STARTTLS relay")?
                .credentials(Credentials::new(self.user.clone(), self.pass.clone()))
                .build(),
        )
    }
}

/// `smtp.` + the domain of the sender address.
fn default_smtp_server(user: &str) -> String {
    match user.split_once('@') {
        Some((_, domain)) => format!("smtp.{domain}"),
        None => "smtp.localhost".to_string(),
    }
}

#[async_trait]
impl NotifyChannel for EmailChannel {
    async fn deliver(&self, title: &str, content: &str, kind: MessageKind) -> Result<()> {
        let message = self.message(title, content, kind)?;

        debug!(server = %self.smtp_server, "Sending email via SMTPS (465)");
        match self.transport_465()?.send(message.clone()).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "SMTPS (465) failed, trying STARTTLS (587)");
            }
        }

        self.transport_587()?
            .send(message)
            .await
            .context("STARTTLS (587) send failed")?;
        Ok(())
    }

    fn name(&self) -> &str {
        CHANNEL_NAME
    }
}

// ---------------------------------------------------------------------------
// HTML report rendering
// ---------------------------------------------------------------------------

const REPORT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Check-in Report</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif;
            margin: 0; padding: 20px; background-color: #e2e8f0;
        }
        .container {
            max-width: 800px; margin: 0 auto; background-color: #ffffff;
            border-radius: 16px; overflow: hidden;
        }
        .header {
            background: #fafbfc; color: #0f172a; padding: 32px 20px;
            text-align: center; border-bottom: 1px solid #f1f5f9;
        }
        .header h1 { margin: 0; font-size: 24px; font-weight: 700; }
        .summary { padding: 25px 20px; }
        .summary h2 { margin: 0 0 16px 0; font-size: 18px; color: #0f172a; }
        .stats { display: grid; grid-template-columns: repeat(4, 1fr); gap: 10px; }
        .stat-item {
            padding: 16px 12px; background: #fafbfc; border-radius: 12px;
            border: 1px solid #f1f5f9; text-align: center;
        }
        .stat-label { font-size: 13px; color: #64748b; margin-bottom: 6px; }
        .stat-value { font-size: 26px; font-weight: 700; color: #0f172a; }
        .accounts { padding: 0 20px 25px; }
        .accounts h2 { margin: 0 0 16px 0; font-size: 18px; color: #0f172a; }
        .account {
            padding: 16px 18px; margin-bottom: 10px; border-radius: 12px;
            background-color: #fafbfc; border: 1px solid #f1f5f9;
        }
        .account.success { border-left: 4px solid #10b981; }
        .account.failed { border-left: 4px solid #ef4444; }
        .account-header {
            display: flex; justify-content: space-between;
            align-items: center; margin-bottom: 8px;
        }
        .account-name { font-size: 15px; font-weight: 600; color: #333; }
        .account-status {
            font-size: 12px; padding: 3px 10px; border-radius: 20px;
            font-weight: 600; color: white;
        }
        .status-success { background-color: #28a745; }
        .status-failed { background-color: #dc3545; }
        .account-detail { font-size: 13px; color: #666; }
        .error-message {
            color: #dc3545; font-size: 13px; padding: 8px 12px;
            background-color: rgba(220, 53, 69, 0.08); border-radius: 8px;
        }
        .footer {
            background-color: #fafbfc; padding: 16px 20px; text-align: center;
            border-top: 1px solid #f1f5f9; font-size: 12px; color: #666;
        }
    </style>
</head>
<body>
    <div class="container">
        <div class="header">
            <h1>Check-in Report</h1>
        </div>
        <div class="summary">
            <h2>Summary</h2>
            <div class="stats">
                <div class="stat-item">
                    <div class="stat-label">Accounts</div>
                    <div class="stat-value">{{summary.total}}</div>
                </div>
                <div class="stat-item">
                    <div class="stat-label">Success</div>
                    <div class="stat-value" style="color: #10b981;">{{summary.success_count}}</div>
                </div>
                <div class="stat-item">
                    <div class="stat-label">Failed</div>
                    <div class="stat-value" style="color: #ef4444;">{{summary.failed_count}}</div>
                </div>
                <div class="stat-item">
                    <div class="stat-label">Success rate</div>
                    <div class="stat-value" style="color: #06b6d4;">{{summary.success_rate}}%</div>
                </div>
            </div>
        </div>
        <div class="accounts">
            <h2>Accounts</h2>
            {{#each accounts}}
            <div class="account {{#if success}}success{{else}}failed{{/if}}">
                <div class="account-header">
                    <div class="account-name">{{name}}</div>
                    <div class="account-status {{#if success}}status-success{{else}}status-failed{{/if}}">
                        {{#if success}}Success{{else}}Failed{{/if}}
                    </div>
                </div>
                {{#if success}}
                <div class="account-detail">
                    <strong>Balance:</strong> ${{quota}} |
                    <strong>Used:</strong> ${{used_quota}}
                </div>
                {{else}}
                <div class="error-message">{{error}}</div>
                {{/if}}
            </div>
            {{/each}}
        </div>
        <div class="footer">
            <p>Executed at {{timestamp}}</p>
            <p>Generated by ROLLCALL</p>
        </div>
    </div>
</body>
</html>
"#;

/// Render the run report into the HTML email body.
pub fn render_report(report: &RunReport) -> Result<String> {
    let handlebars = Handlebars::new();
    handlebars
        .render_template(REPORT_TEMPLATE, &template_data(report))
        .context("Failed to render report template")
}

/// Flatten the report into template data. Numeric formatting happens
/// here so the template stays dumb.
fn template_data(report: &RunReport) -> Value {
    let accounts: Vec<Value> = report
        .accounts
        .iter()
        .map(|account| {
            json!({
                "name": account.name,
                "success": account.success,
                "quota": format!("{:.2}", account.quota),
                "used_quota": format!("{:.2}", account.used_quota),
                "error": account.error.clone().unwrap_or_else(|| "Unknown error".to_string()),
            })
        })
        .collect();

    json!({
        "accounts": accounts,
        "summary": {
            "total": report.summary.total,
            "success_count": report.summary.success_count,
            "failed_count": report.summary.failed_count,
            "success_rate": format!("{:.0}", report.summary.success_rate),
        },
        "timestamp": report.timestamp,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountReport, RunSummary};

    fn sample_report() -> RunReport {
        RunReport {
            accounts: vec![
                AccountReport {
                    name: "alpha".to_string(),
                    success: true,
                    quota: 2.0,
                    used_quota: 0.5,
                    error: None,
                },
                AccountReport {
                    name: "beta".to_string(),
                    success: false,
                    quota: 0.0,
                    used_quota: 0.0,
                    error: Some("WAF verification page detected".to_string()),
                },
            ],
            summary: RunSummary::new(2, 1),
            timestamp: "2026-08-06 09:00:00".to_string(),
            need_notify: true,
            balance_changed: false,
            notification_text: String::new(),
        }
    }

    #[test]
    fn test_default_smtp_server_from_address() {
        assert_eq!(default_smtp_server("me@example.com"), "smtp.example.com");
        assert_eq!(default_smtp_server("broken"), "smtp.localhost");
    }

    #[test]
    fn test_template_data_formats_numbers() {
        let data = template_data(&sample_report());
        assert_eq!(data["accounts"][0]["quota"], "2.00");
        assert_eq!(data["accounts"][0]["used_quota"], "0.50");
        assert_eq!(data["summary"]["success_rate"], "50");
    }

    #[test]
    fn test_render_report_contains_accounts_and_stats() {
        let html = render_report(&sample_report()).unwrap();
        assert!(html.contains("alpha"));
        assert!(html.contains("beta"));
        assert!(html.contains("$2.00"));
        assert!(html.contains("WAF verification page detected"));
        assert!(html.contains("2026-08-06 09:00:00"));
        assert!(html.contains("50%"));
    }

    #[test]
    fn test_render_report_marks_failure_rows() {
        let html = render_report(&sample_report()).unwrap();
        assert!(html.contains(r#"class="account success""#));
        assert!(html.contains(r#"class="account failed""#));
    }

    #[test]
    fn test_message_build() {
        let channel = EmailChannel {
            user: "me@example.com".to_string(),
            pass: "secret".to_string(),
            to: "you@example.com".to_string(),
            smtp_server: "smtp.example.com".to_string(),
        };
        let message = channel.message("Title", "<p>hi</p>", MessageKind::Html);
        assert!(message.is_ok());
    }
}
