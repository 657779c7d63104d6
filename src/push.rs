use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::model::NotificationPlan;

/// Dumb push-send primitive. At-most-once per batch is the workflow's job,
/// not the gateway's; this just delivers whatever plan it is handed.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify(&self, user: &str, plan: &NotificationPlan) -> Result<()>;
}

#[derive(Clone)]
pub struct PushClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for PushClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl PushClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.push.base_url).context("invalid push.base_url")?;
        Ok(Self::new(base_url, cfg.push.token.clone()))
    }

    pub fn new(base_url: Url, token: String) -> Self {
        let http = Client::builder()
            .user_agent("inbox-sentry/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }

    async fn send(&self, payload: &Value) -> Result<()> {
        let url = self
            .base_url
            .join("v1/notifications")
            .context("invalid push base URL")?;
        let res = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(payload)
            .send()
            .await
            .context("failed to reach push gateway")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("push gateway error {}: {}", status, body));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationGateway for PushClient {
    async fn notify(&self, user: &str, plan: &NotificationPlan) -> Result<()> {
        let payload = build_push_payload(user, plan);
        self.send(&payload).await?;
        info!(user, message_id = plan.message_id, "push notification delivered");
        Ok(())
    }
}

/// One candidate gets a named title; several get a count. The payload data
/// names the top message only when there is exactly one, so the client can
/// deep-link it.
pub fn build_push_payload(user: &str, plan: &NotificationPlan) -> Value {
    let title = if plan.high_priority_count == 1 {
        format!("Urgent: {}", display_sender(&plan.sender))
    } else {
        format!("{} urgent emails need attention", plan.high_priority_count)
    };
    let rationale = snippet(&plan.rationale, 140);
    let body = if rationale.is_empty() {
        plan.subject.clone()
    } else {
        format!("{}: {}", plan.subject, rationale)
    };

    let mut data = json!({
        "type": "urgent_email",
        "urgency_score": plan.urgency_score,
        "high_priority_count": plan.high_priority_count,
    });
    if plan.high_priority_count == 1 {
        data["email_id"] = Value::String(plan.external_id.clone());
    }

    json!({
        "user": user,
        "title": title,
        "body": body,
        "data": data,
    })
}

fn display_sender(sender: &str) -> String {
    if let Some((name, rest)) = sender.split_once('<') {
        let name = name.trim().trim_matches('"');
        if !name.is_empty() {
            return name.to_string();
        }
        return rest.trim_end_matches('>').trim().to_string();
    }
    sender.trim().to_string()
}

fn snippet(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
