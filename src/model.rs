use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stages of a triage run. A run only ever moves forward through these;
/// the stage column in `triage_runs` is the resume point after a crash.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Fetching,
    Summarizing,
    Filtering,
    Deciding,
    Notifying,
    Done,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Fetching => "fetching",
            RunStage::Summarizing => "summarizing",
            RunStage::Filtering => "filtering",
            RunStage::Deciding => "deciding",
            RunStage::Notifying => "notifying",
            RunStage::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<RunStage> {
        match s {
            "fetching" => Some(RunStage::Fetching),
            "summarizing" => Some(RunStage::Summarizing),
            "filtering" => Some(RunStage::Filtering),
            "deciding" => Some(RunStage::Deciding),
            "notifying" => Some(RunStage::Notifying),
            "done" => Some(RunStage::Done),
            _ => None,
        }
    }
}

/// What the summarizer thinks the user should do with a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    ReplyNeeded,
    ActionRequired,
    Fyi,
    Ignore,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::ReplyNeeded => "reply_needed",
            ActionClass::ActionRequired => "action_required",
            ActionClass::Fyi => "fyi",
            ActionClass::Ignore => "ignore",
        }
    }

    /// Tolerant parse for model output. Unknown labels degrade to `Fyi`
    /// rather than failing the whole message.
    pub fn parse(s: &str) -> ActionClass {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "reply_needed" | "reply" => ActionClass::ReplyNeeded,
            "action_required" | "action" => ActionClass::ActionRequired,
            "ignore" | "skip" => ActionClass::Ignore,
            _ => ActionClass::Fyi,
        }
    }
}

/// Structured summary produced for a single message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageSummary {
    /// 0 (ignorable) to 100 (drop everything).
    pub urgency_score: u8,
    pub action: ActionClass,
    pub rationale: String,
}

/// Full message content as returned by the mail provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchedMessage {
    pub external_id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub body: String,
}

/// Persisted result of the fetch stage: message row ids that were stored
/// plus the external ids that could not be retrieved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchStageResult {
    pub stored: Vec<i64>,
    pub failed: Vec<String>,
}

/// Persisted result of the summarize stage, by message row id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummaryStageResult {
    pub summarized: Vec<i64>,
    pub failed: Vec<i64>,
}

/// Persisted result of the subscription filter: high-urgency candidates
/// that survived, and the ones suppressed as bulk mail.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterStageResult {
    pub candidates: Vec<i64>,
    pub suppressed: Vec<i64>,
}

/// Outcome of one triage run, reported to callers and logs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriageOutcome {
    pub stored_count: usize,
    pub summarized_count: usize,
    pub high_priority_count: usize,
    pub notification_sent: bool,
}

/// The push the notify stage would send. Recomputed from durable state,
/// never persisted itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPlan {
    pub message_id: i64,
    pub external_id: String,
    pub sender: String,
    pub subject: String,
    pub urgency_score: i64,
    pub rationale: String,
    pub high_priority_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_strings_round_trip() {
        for stage in [
            RunStage::Fetching,
            RunStage::Summarizing,
            RunStage::Filtering,
            RunStage::Deciding,
            RunStage::Notifying,
            RunStage::Done,
        ] {
            assert_eq!(RunStage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(RunStage::parse("bogus"), None);
    }

    #[test]
    fn action_parse_is_tolerant() {
        assert_eq!(ActionClass::parse("reply_needed"), ActionClass::ReplyNeeded);
        assert_eq!(ActionClass::parse("Reply-Needed"), ActionClass::ReplyNeeded);
        assert_eq!(ActionClass::parse("ACTION REQUIRED"), ActionClass::ActionRequired);
        assert_eq!(ActionClass::parse("ignore"), ActionClass::Ignore);
        assert_eq!(ActionClass::parse("fyi"), ActionClass::Fyi);
        assert_eq!(ActionClass::parse("something else"), ActionClass::Fyi);
        assert_eq!(ActionClass::parse(""), ActionClass::Fyi);
    }
}
