//! Operator notifications over a chat webhook.
//!
//! Failures in the pipeline are only useful if a human sees them, so every
//! error path funnels through here. Sends are fire-and-forget with hard
//! timeouts; a notification must never wedge a call path.

use chrono::Utc;
use log::{error, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Fatal notifications get the short timeout: the caller is usually about
/// to return a 500 and should not sit behind a slow chat API.
const FATAL_TIMEOUT: Duration = Duration::from_secs(5);
const NORMAL_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    fn emoji(&self) -> &'static str {
        match self {
            Severity::Info => "✅",
            Severity::Warning => "⚠️",
            Severity::Error => "❌",
            Severity::Fatal => "🚨",
        }
    }

    fn timeout(&self) -> Duration {
        match self {
            Severity::Fatal => FATAL_TIMEOUT,
            _ => NORMAL_TIMEOUT,
        }
    }
}

/// Context fields attached to every notification. All optional; absent
/// fields are omitted from the message.
#[derive(Debug, Clone, Default)]
pub struct NotifyContext {
    pub request_id: Option<String>,
    pub contact_id: Option<String>,
    pub phone: Option<String>,
    pub service: Option<String>,
    pub province: Option<String>,
    pub call_sid: Option<String>,
    pub detail: Option<String>,
}

#[derive(Clone)]
pub struct Notifier {
    client: Client,
    webhook_url: String,
}

impl Notifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
        }
    }

    /// Post a structured message. Errors are logged and swallowed.
    pub async fn notify(&self, severity: Severity, title: &str, ctx: NotifyContext) {
        let payload = build_payload(severity, title, &ctx);

        let result = self
            .client
            .post(&self.webhook_url)
            .timeout(severity.timeout())
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                warn!("notifier webhook returned {}", response.status());
            }
            Err(e) => error!("notifier webhook failed: {}", e),
            _ => {}
        }
    }

    pub async fn info(&self, title: &str, ctx: NotifyContext) {
        self.notify(Severity::Info, title, ctx).await;
    }

    pub async fn warning(&self, title: &str, ctx: NotifyContext) {
        self.notify(Severity::Warning, title, ctx).await;
    }

    pub async fn error(&self, title: &str, ctx: NotifyContext) {
        self.notify(Severity::Error, title, ctx).await;
    }

    pub async fn fatal(&self, title: &str, ctx: NotifyContext) {
        self.notify(Severity::Fatal, title, ctx).await;
    }
}

fn build_payload(severity: Severity, title: &str, ctx: &NotifyContext) -> Value {
    let mut fields: Vec<Value> = Vec::new();
    let mut push = |label: &str, value: &Option<String>| {
        if let Some(v) = value {
            fields.push(json!({"type": "mrkdwn", "text": format!("*{}:* {}", label, v)}));
        }
    };
    push("Request", &ctx.request_id);
    push("Contact", &ctx.contact_id);
    push("Phone", &ctx.phone);
    push("Service", &ctx.service);
    push("Province", &ctx.province);
    push("Call SID", &ctx.call_sid);

    let mut blocks = vec![json!({
        "type": "section",
        "text": {
            "type": "mrkdwn",
            "text": format!("{} *{}*", severity.emoji(), title)
        }
    })];

    if !fields.is_empty() {
        blocks.push(json!({"type": "section", "fields": fields}));
    }

    if let Some(detail) = &ctx.detail {
        blocks.push(json!({
            "type": "section",
            "text": {"type": "mrkdwn", "text": format!("```{}```", truncate(detail, 2000))}
        }));
    }

    blocks.push(json!({
        "type": "context",
        "elements": [{"type": "mrkdwn", "text": Utc::now().to_rfc3339()}]
    }));

    json!({"blocks": blocks})
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect::<String>() + "…"
    }
}
