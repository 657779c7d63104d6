//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Stage logic
//! lives in the workflow layer.

use chrono::{DateTime, Utc};

use crate::model::{
    FetchStageResult, FilterStageResult, RunStage, SummaryStageResult, TriageOutcome,
};

/// Run slice loaded by the workflow driver. The three `*_result` fields are
/// the durable stage checkpoints; a `None` means that stage has not
/// completed yet.
#[derive(Debug, Clone)]
pub struct RunForTriage {
    pub id: i64,
    pub user_id: i64,
    pub batch_key: String,
    pub stage: RunStage,
    pub attempt: i32,
    pub cancelled: bool,
    pub notified: bool,
    pub failed_at: Option<DateTime<Utc>>,
    pub submitted_ids: Vec<String>,
    pub fetch_result: Option<FetchStageResult>,
    pub summary_result: Option<SummaryStageResult>,
    pub filter_result: Option<FilterStageResult>,
}

impl RunForTriage {
    /// Reconstruct the run outcome from whatever checkpoints exist. Stages
    /// that never ran contribute zero.
    pub fn outcome(&self) -> TriageOutcome {
        TriageOutcome {
            stored_count: self
                .fetch_result
                .as_ref()
                .map(|r| r.stored.len())
                .unwrap_or(0),
            summarized_count: self
                .summary_result
                .as_ref()
                .map(|r| r.summarized.len())
                .unwrap_or(0),
            high_priority_count: self
                .filter_result
                .as_ref()
                .map(|r| r.candidates.len())
                .unwrap_or(0),
            notification_sent: self.notified,
        }
    }
}

/// Message slice handed to the summarize stage.
#[derive(Debug, Clone)]
pub struct MessageForSummary {
    pub id: i64,
    pub external_id: String,
    pub subject: String,
    pub sender: String,
    pub body_ref: Option<String>,
}

/// Joined message + summary slice used when filtering and notifying.
/// Rows are returned ranked: urgency desc, then received_at asc, then
/// external_id asc, so the first row is always the notification pick.
#[derive(Debug, Clone)]
pub struct CandidateForNotify {
    pub message_id: i64,
    pub external_id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub urgency_score: i64,
    pub rationale: String,
    pub body_ref: Option<String>,
}
