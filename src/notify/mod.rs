//! Notification dispatch.
//!
//! Defines the `NotifyChannel` trait and the `Notifier` fan-out.
//! The notifier is constructed once at process start (after config and
//! secrets are loaded) and passed in explicitly, so there is no hidden
//! global state and tests can inject recording channels.

pub mod channels;
pub mod email;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::types::RunReport;

/// Payload format hint for channels that distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Html,
}

/// A notification delivery target.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    async fn deliver(&self, title: &str, content: &str, kind: MessageKind) -> Result<()>;

    /// Channel name for logging and email-skip matching.
    fn name(&self) -> &str;
}

/// Fans a run summary out to all configured channels. Channel failures
/// are isolated: logged, never escalated, never blocking the rest.
pub struct Notifier {
    channels: Vec<Box<dyn NotifyChannel>>,
}

impl Notifier {
    pub fn new(channels: Vec<Box<dyn NotifyChannel>>) -> Self {
        Self { channels }
    }

    /// Attach every channel whose configuration is present in the
    /// environment. No channel is mandatory.
    pub fn from_env() -> Self {
        let mut channels: Vec<Box<dyn NotifyChannel>> = Vec::new();

        if let Some(c) = email::EmailChannel::from_env() {
            channels.push(Box::new(c));
        }
        if let Some(c) = channels::PushPlusChannel::from_env() {
            channels.push(Box::new(c));
        }
        if let Some(c) = channels::ServerChanChannel::from_env() {
            channels.push(Box::new(c));
        }
        if let Some(c) = channels::DingTalkChannel::from_env() {
            channels.push(Box::new(c));
        }
        if let Some(c) = channels::FeishuChannel::from_env() {
            channels.push(Box::new(c));
        }
        if let Some(c) = channels::WeComChannel::from_env() {
            channels.push(Box::new(c));
        }
        if let Some(c) = channels::TelegramChannel::from_env() {
            channels.push(Box::new(c));
        }

        info!(
            count = channels.len(),
            names = ?channels.iter().map(|c| c.name()).collect::<Vec<_>>(),
            "Notification channels configured"
        );

        Self::new(channels)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Send the rendered HTML report to the designated email channel.
    /// No-op when email isn't configured.
    pub async fn send_html_report(&self, title: &str, report: &RunReport) {
        let Some(channel) = self
            .channels
            .iter()
            .find(|c| c.name() == email::CHANNEL_NAME)
        else {
            info!("Email notification not configured, skipping HTML report");
            return;
        };

        let html = match email::render_report(report) {
            Ok(html) => html,
            Err(e) => {
                warn!(error = %e, "Failed to render HTML report");
                return;
            }
        };

        match channel.deliver(title, &html, MessageKind::Html).await {
            Ok(()) => info!(channel = channel.name(), "HTML report sent"),
            Err(e) => warn!(channel = channel.name(), error = %e, "HTML report failed"),
        }
    }

    /// Plain-text fan-out to every configured channel, best-effort.
    /// `skip_email` avoids double delivery when the HTML report was
    /// already sent separately.
    pub async fn broadcast(&self, title: &str, content: &str, skip_email: bool) {
        for channel in &self.channels {
            if skip_email && channel.name() == email::CHANNEL_NAME {
                continue;
            }
            match channel.deliver(title, content, MessageKind::Text).await {
                Ok(()) => info!(channel = channel.name(), "Message push successful"),
                Err(e) => {
                    warn!(channel = channel.name(), error = %e, "Message push failed");
                }
            }
        }
    }
}
