use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::model::MessageSummary;
use crate::summarizer::model::{ChatMessage, ChatRequest, ChatResponse};

pub mod model;

pub use model::extract_summary;

/// Bodies are cut here before prompting; anything urgent announces itself
/// well before four thousand characters.
const MAX_BODY_CHARS: usize = 4000;

const SYSTEM_PROMPT: &str = "You are an email triage assistant. You read one email \
and decide how urgently the recipient needs to see it.";

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, subject: &str, sender: &str, body: &str) -> Result<MessageSummary>;
}

#[derive(Clone)]
pub struct AiClient {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

impl fmt::Debug for AiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl AiClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.ai.base_url).context("invalid ai.base_url")?;
        Ok(Self::new(
            base_url,
            cfg.ai.api_key.clone(),
            cfg.ai.model.clone(),
            Duration::from_secs(cfg.ai.request_timeout_seconds),
        ))
    }

    pub fn new(base_url: Url, api_key: String, model: String, timeout: Duration) -> Self {
        let http = Client::builder()
            .user_agent("inbox-sentry/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
            model,
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let url = self
            .base_url
            .join("v1/chat/completions")
            .context("invalid AI base URL")?;
        let res = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .context("failed to reach AI provider")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("rate limited by AI provider: {}", body);
            return Err(anyhow!("received 429 from AI provider: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("AI provider error {}: {}", status, body));
        }

        let payload: ChatResponse = res.json().await.context("invalid AI response JSON")?;
        payload
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("AI response contained no choices"))
    }
}

#[async_trait]
impl Summarizer for AiClient {
    async fn summarize(&self, subject: &str, sender: &str, body: &str) -> Result<MessageSummary> {
        let request = build_summary_request(&self.model, subject, sender, body);
        let content = self.complete(&request).await?;
        extract_summary(&content)
            .ok_or_else(|| anyhow!("unusable summary output: {}", truncate_chars(&content, 200)))
    }
}

pub fn build_summary_request(model: &str, subject: &str, sender: &str, body: &str) -> ChatRequest {
    let body = truncate_chars(body, MAX_BODY_CHARS);
    let user_prompt = format!(
        "From: {}\nSubject: {}\n\n{}\n\n\
         Return ONLY a JSON object in this exact format:\n\
         {{\"urgency_score\": <integer 0-100>, \
         \"action\": \"<reply_needed|action_required|fyi|ignore>\", \
         \"rationale\": \"<one short sentence>\"}}",
        sender, subject, body
    );
    ChatRequest {
        model: model.to_string(),
        messages: vec![
            ChatMessage {
                role: "system".to_string(),
                content: SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: user_prompt,
            },
        ],
        temperature: 0.1,
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_prompt_and_model() {
        let req = build_summary_request(
            "triage-model",
            "Server down",
            "ops@example.com",
            "Production is on fire.",
        );
        assert_eq!(req.model, "triage-model");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[1].role, "user");
        let prompt = &req.messages[1].content;
        assert!(prompt.contains("Subject: Server down"));
        assert!(prompt.contains("From: ops@example.com"));
        assert!(prompt.contains("urgency_score"));
        assert_eq!(req.temperature, 0.1);
    }

    #[test]
    fn request_serializes_to_chat_shape() {
        let req = build_summary_request("m", "s", "f", "b");
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["model"], "m");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["role"], "user");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(MAX_BODY_CHARS + 500);
        let req = build_summary_request("m", "s", "f", &body);
        let prompt = &req.messages[1].content;
        assert!(prompt.contains(&"x".repeat(MAX_BODY_CHARS)));
        assert!(!prompt.contains(&"x".repeat(MAX_BODY_CHARS + 1)));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
    }
}
