//! Webhook and push notification channels.
//!
//! Every channel is gated purely on its configuration being present in
//! the environment. Payload shapes follow each service's incoming
//! webhook contract.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::{MessageKind, NotifyChannel};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

fn webhook_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(WEBHOOK_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// POST a JSON payload and fail on a non-success status.
async fn post_json(client: &reqwest::Client, url: &str, payload: &Value) -> Result<()> {
    let response = client
        .post(url)
        .json(payload)
        .send()
        .await
        .context("Webhook request failed")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Webhook POST failed with status {status}: {body}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// PushPlus
// ---------------------------------------------------------------------------

pub struct PushPlusChannel {
    token: String,
    http: reqwest::Client,
}

impl PushPlusChannel {
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("PUSHPLUS_TOKEN").ok()?;
        Some(Self {
            token,
            http: webhook_client(),
        })
    }
}

pub fn pushplus_payload(token: &str, title: &str, content: &str) -> Value {
    json!({
        "token": token,
        "title": title,
        "content": content,
        "template": "html",
    })
}

#[async_trait]
impl NotifyChannel for PushPlusChannel {
    async fn deliver(&self, title: &str, content: &str, _kind: MessageKind) -> Result<()> {
        let payload = pushplus_payload(&self.token, title, content);
        post_json(&self.http, "http://www.pushplus.plus/send", &payload).await
    }

    fn name(&self) -> &str {
        "pushplus"
    }
}

// ---------------------------------------------------------------------------
// ServerChan
// ---------------------------------------------------------------------------

pub struct ServerChanChannel {
    key: String,
    http: reqwest::Client,
}

impl ServerChanChannel {
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("SERVERPUSHKEY").ok()?;
        Some(Self {
            key,
            http: webhook_client(),
        })
    }
}

pub fn serverchan_payload(title: &str, content: &str) -> Value {
    json!({ "title": title, "desp": content })
}

#[async_trait]
impl NotifyChannel for ServerChanChannel {
    async fn deliver(&self, title: &str, content: &str, _kind: MessageKind) -> Result<()> {
        let url = format!("https://sctapi.ftqq.com/{}.send", self.key);
        let payload = serverchan_payload(title, content);
        post_json(&self.http, &url, &payload).await
    }

    fn name(&self) -> &str {
        "serverchan"
    }
}

// ---------------------------------------------------------------------------
// DingTalk
// ---------------------------------------------------------------------------

pub struct DingTalkChannel {
    webhook: String,
    http: reqwest::Client,
}

impl DingTalkChannel {
    pub fn from_env() -> Option<Self> {
        let webhook = std::env::var("DINGDING_WEBHOOK").ok()?;
        Some(Self {
            webhook,
            http: webhook_client(),
        })
    }
}

pub fn dingtalk_payload(title: &str, content: &str) -> Value {
    json!({
        "msgtype": "text",
        "text": { "content": format!("{title}\n{content}") },
    })
}

#[async_trait]
impl NotifyChannel for DingTalkChannel {
    async fn deliver(&self, title: &str, content: &str, _kind: MessageKind) -> Result<()> {
        let payload = dingtalk_payload(title, content);
        post_json(&self.http, &self.webhook, &payload).await
    }

    fn name(&self) -> &str {
        "dingtalk"
    }
}

// ---------------------------------------------------------------------------
// Feishu
// ---------------------------------------------------------------------------

pub struct FeishuChannel {
    webhook: String,
    http: reqwest::Client,
}

impl FeishuChannel {
    pub fn from_env() -> Option<Self> {
        let webhook = std::env::var("FEISHU_WEBHOOK").ok()?;
        Some(Self {
            webhook,
            http: webhook_client(),
        })
    }
}

pub fn feishu_payload(title: &str, content: &str) -> Value {
    json!({
        "msg_type": "interactive",
        "card": {
            "elements": [
                { "tag": "markdown", "content": content, "text_align": "left" }
            ],
            "header": {
                "template": "blue",
                "title": { "content": title, "tag": "plain_text" },
            },
        },
    })
}

#[async_trait]
impl NotifyChannel for FeishuChannel {
    async fn deliver(&self, title: &str, content: &str, _kind: MessageKind) -> Result<()> {
        let payload = feishu_payload(title, content);
        post_json(&self.http, &self.webhook, &payload).await
    }

    fn name(&self) -> &str {
        "feishu"
    }
}

// ---------------------------------------------------------------------------
// WeCom
// ---------------------------------------------------------------------------

pub struct WeComChannel {
    webhook: String,
    http: reqwest::Client,
}

impl WeComChannel {
    pub fn from_env() -> Option<Self> {
        let webhook = std::env::var("WEIXIN_WEBHOOK").ok()?;
        Some(Self {
            webhook,
            http: webhook_client(),
        })
    }
}

pub fn wecom_payload(title: &str, content: &str) -> Value {
    json!({
        "msgtype": "text",
        "text": { "content": format!("{title}\n{content}") },
    })
}

#[async_trait]
impl NotifyChannel for WeComChannel {
    async fn deliver(&self, title: &str, content: &str, _kind: MessageKind) -> Result<()> {
        let payload = wecom_payload(title, content);
        post_json(&self.http, &self.webhook, &payload).await
    }

    fn name(&self) -> &str {
        "wecom"
    }
}

// ---------------------------------------------------------------------------
// Telegram
// ---------------------------------------------------------------------------

pub struct TelegramChannel {
    bot_token: String,
    chat_id: String,
    http: reqwest::Client,
}

impl TelegramChannel {
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok()?;
        Some(Self {
            bot_token,
            chat_id,
            http: webhook_client(),
        })
    }
}

pub fn telegram_payload(chat_id: &str, title: &str, content: &str) -> Value {
    json!({
        "chat_id": chat_id,
        "text": format!("<b>{title}</b>\n\n{content}"),
        "parse_mode": "HTML",
    })
}

#[async_trait]
impl NotifyChannel for TelegramChannel {
    async fn deliver(&self, title: &str, content: &str, _kind: MessageKind) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = telegram_payload(&self.chat_id, title, content);
        post_json(&self.http, &url, &payload).await
    }

    fn name(&self) -> &str {
        "telegram"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
