#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use inbox_sentry::db;
use inbox_sentry::mail::MailFetcher;
use inbox_sentry::model::{ActionClass, FetchedMessage, MessageSummary, NotificationPlan};
use inbox_sentry::push::NotificationGateway;
use inbox_sentry::retry::RetryPolicy;
use inbox_sentry::summarizer::Summarizer;
use inbox_sentry::triage::TriageSettings;

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Retries are exercised in unit tests; scenarios run with a budget of one
/// so scripted failures surface immediately.
pub fn settings(data_dir: &Path) -> TriageSettings {
    TriageSettings {
        high_priority_threshold: 70,
        fetch_concurrency: 4,
        summarize_concurrency: 2,
        data_dir: data_dir.to_path_buf(),
        summarize_retry: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
        notify_retry: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
    }
}

pub fn message(external_id: &str, subject: &str, sender: &str, hour: u32) -> FetchedMessage {
    FetchedMessage {
        external_id: external_id.to_string(),
        subject: subject.to_string(),
        sender: sender.to_string(),
        received_at: Utc.with_ymd_and_hms(2026, 8, 20, hour, 0, 0).unwrap(),
        body: format!("body of {}", subject),
    }
}

pub async fn submit(
    pool: &sqlx::SqlitePool,
    user: &str,
    batch: &str,
    ids: &[&str],
) -> (i64, i64) {
    let user_id = db::get_or_create_user(pool, user, None).await.unwrap();
    let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
    let run_id = db::submit_run(pool, user_id, batch, &ids).await.unwrap();
    (user_id, run_id)
}

pub async fn message_row_id(pool: &sqlx::SqlitePool, external_id: &str) -> i64 {
    sqlx::query_scalar("SELECT id FROM messages WHERE external_id = ?")
        .bind(external_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Mail provider fake: serves scripted messages by external id, fails the
/// ids it was told to, and records every fetch call.
#[derive(Default)]
pub struct ScriptedMailbox {
    messages: HashMap<String, FetchedMessage>,
    fail: HashSet<String>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedMailbox {
    pub fn with_messages(messages: Vec<FetchedMessage>) -> Self {
        Self {
            messages: messages
                .into_iter()
                .map(|m| (m.external_id.clone(), m))
                .collect(),
            ..Default::default()
        }
    }

    pub fn failing_on(mut self, external_id: &str) -> Self {
        self.fail.insert(external_id.to_string());
        self
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl MailFetcher for ScriptedMailbox {
    async fn fetch_message(&self, _user: &str, external_id: &str) -> Result<FetchedMessage> {
        self.calls.lock().await.push(external_id.to_string());
        if self.fail.contains(external_id) {
            return Err(anyhow!("mailbox offline for {}", external_id));
        }
        self.messages
            .get(external_id)
            .cloned()
            .ok_or_else(|| anyhow!("no such message {}", external_id))
    }
}

/// Summarizer fake keyed by subject. Unscripted subjects get a routine
/// low-urgency summary; a scripted `None` fails that message.
#[derive(Default)]
pub struct ScriptedSummarizer {
    by_subject: HashMap<String, Option<MessageSummary>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scoring(mut self, subject: &str, score: u8, action: ActionClass) -> Self {
        self.by_subject.insert(
            subject.to_string(),
            Some(MessageSummary {
                urgency_score: score,
                action,
                rationale: format!("scored {}", score),
            }),
        );
        self
    }

    pub fn failing_on(mut self, subject: &str) -> Self {
        self.by_subject.insert(subject.to_string(), None);
        self
    }

    /// `(subject, body)` pairs, in call order.
    pub async fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize(&self, subject: &str, _sender: &str, body: &str) -> Result<MessageSummary> {
        self.calls
            .lock()
            .await
            .push((subject.to_string(), body.to_string()));
        match self.by_subject.get(subject) {
            Some(Some(summary)) => Ok(summary.clone()),
            Some(None) => Err(anyhow!("model unavailable for {}", subject)),
            None => Ok(MessageSummary {
                urgency_score: 10,
                action: ActionClass::Fyi,
                rationale: "routine".to_string(),
            }),
        }
    }
}

/// Push gateway fake: pops a scripted response per call, defaulting to
/// success, and records who was notified with what plan.
#[derive(Clone, Default)]
pub struct RecordingGateway {
    responses: Arc<Mutex<VecDeque<Result<()>>>>,
    calls: Arc<Mutex<Vec<(String, NotificationPlan)>>>,
}

impl RecordingGateway {
    pub fn with_responses(responses: Vec<Result<()>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<(String, NotificationPlan)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl NotificationGateway for RecordingGateway {
    async fn notify(&self, user: &str, plan: &NotificationPlan) -> Result<()> {
        self.calls
            .lock()
            .await
            .push((user.to_string(), plan.clone()));
        self.responses.lock().await.pop_front().unwrap_or(Ok(()))
    }
}
