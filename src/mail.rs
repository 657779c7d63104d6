use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::Config;
use crate::model::FetchedMessage;

#[async_trait]
pub trait MailFetcher: Send + Sync {
    async fn fetch_message(&self, user: &str, external_id: &str) -> Result<FetchedMessage>;
}

/// Aggregated result of fetching one batch: whatever came back, plus the ids
/// that did not.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub messages: Vec<FetchedMessage>,
    pub failed: Vec<String>,
}

/// Fetch every id with bounded concurrency. A failing id is logged and
/// reported, never fatal; the report is sorted so replays persist the same
/// checkpoint.
pub async fn fetch_all(
    fetcher: &dyn MailFetcher,
    user: &str,
    external_ids: &[String],
    max_concurrent: usize,
) -> FetchReport {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let failed = Arc::new(Mutex::new(Vec::new()));

    futures::stream::iter(external_ids)
        .for_each_concurrent(Some(max_concurrent.max(1)), |external_id| {
            let messages = Arc::clone(&messages);
            let failed = Arc::clone(&failed);
            async move {
                match fetcher.fetch_message(user, external_id).await {
                    Ok(msg) => messages.lock().await.push(msg),
                    Err(err) => {
                        warn!(?err, external_id = %external_id, "message fetch failed; skipping");
                        failed.lock().await.push(external_id.clone());
                    }
                }
            }
        })
        .await;

    let mut messages = std::mem::take(&mut *messages.lock().await);
    let mut failed = std::mem::take(&mut *failed.lock().await);
    messages.sort_by(|a, b| a.external_id.cmp(&b.external_id));
    failed.sort();
    FetchReport { messages, failed }
}

#[derive(Clone)]
pub struct MailClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for MailClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl MailClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.mail.base_url).context("invalid mail.base_url")?;
        Ok(Self::new(base_url, cfg.mail.token.clone()))
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

    async fn get_message(&self, user: &str, external_id: &str) -> Result<FetchedMessage> {
        let url = self
            .base_url
            .join(&format!("v1/users/{}/messages/{}", user, external_id))
            .context("invalid mail base URL")?;
        let res = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .context("failed to reach mail provider")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("mail api error {}: {}", status, body));
        }
        let wire: MessageResp = res.json().await.context("invalid mail response JSON")?;
        Ok(FetchedMessage {
            external_id: wire.id,
            subject: wire.subject,
            sender: wire.from,
            received_at: wire.received_at,
            body: wire.body,
        })
    }
}

#[async_trait]
impl MailFetcher for MailClient {
    async fn fetch_message(&self, user: &str, external_id: &str) -> Result<FetchedMessage> {
        self.get_message(user, external_id).await
    }
}

#[derive(Deserialize)]
struct MessageResp {
    id: String,
    #[serde(default)]
    subject: String,
    from: String,
    received_at: DateTime<Utc>,
    #[serde(default)]
    body: String,
}
