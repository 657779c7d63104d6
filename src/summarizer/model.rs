//! Wire types for the chat-completion API, plus the tolerant parser that
//! turns model output into a structured summary.

use serde::{Deserialize, Serialize};

use crate::model::{ActionClass, MessageSummary};

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct RawSummary {
    urgency_score: f64,
    #[serde(default)]
    action: String,
    #[serde(default)]
    rationale: String,
}

/// Pull a summary out of output that is JSON-ish at best: leading prose,
/// code fences, trailing commentary. Takes the outermost brace pair and
/// parses what is between. A missing urgency score means the output is
/// unusable; an unknown action label degrades to `fyi`; a score outside
/// 0-100 is clamped.
pub fn extract_summary(output: &str) -> Option<MessageSummary> {
    let trimmed = output.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    let raw: RawSummary = serde_json::from_str(&trimmed[start..=end]).ok()?;
    Some(MessageSummary {
        urgency_score: raw.urgency_score.round().clamp(0.0, 100.0) as u8,
        action: ActionClass::parse(&raw.action),
        rationale: raw.rationale.trim().to_string(),
    })
}
