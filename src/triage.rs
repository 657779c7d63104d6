//! The triage workflow: a durable five-stage pipeline over one batch of
//! message ids.
//!
//! Progress is checkpointed in `triage_runs` at stage boundaries only. A
//! crash rewinds to the start of the interrupted stage; every stage is
//! idempotent, so re-executing it lands on the same durable state.

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::db::{self, Pool, RunForTriage};
use crate::filter::SubscriptionFilter;
use crate::mail::{fetch_all, MailFetcher};
use crate::model::{
    FetchStageResult, FilterStageResult, NotificationPlan, RunStage, SummaryStageResult,
    TriageOutcome,
};
use crate::push::NotificationGateway;
use crate::retry::{retry_async, RetryPolicy};
use crate::summarizer::Summarizer;

#[derive(Debug, Clone)]
pub struct TriageSettings {
    pub high_priority_threshold: i64,
    pub fetch_concurrency: usize,
    pub summarize_concurrency: usize,
    pub data_dir: PathBuf,
    pub summarize_retry: RetryPolicy,
    pub notify_retry: RetryPolicy,
}

impl TriageSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            high_priority_threshold: i64::from(cfg.app.high_priority_threshold),
            fetch_concurrency: cfg.app.fetch_concurrency,
            summarize_concurrency: cfg.app.summarize_concurrency,
            data_dir: cfg.app.resolved_data_dir(),
            summarize_retry: RetryPolicy::new(
                cfg.ai.max_retries,
                Duration::from_millis(500),
                Duration::from_secs(8),
            ),
            notify_retry: RetryPolicy::new(
                cfg.push.max_retries,
                Duration::from_millis(500),
                Duration::from_secs(8),
            ),
        }
    }
}

pub struct TriageWorkflow<'a> {
    pool: &'a Pool,
    fetcher: &'a dyn MailFetcher,
    summarizer: &'a dyn Summarizer,
    gateway: &'a dyn NotificationGateway,
    filter: SubscriptionFilter,
    settings: TriageSettings,
}

impl<'a> TriageWorkflow<'a> {
    pub fn new(
        pool: &'a Pool,
        fetcher: &'a dyn MailFetcher,
        summarizer: &'a dyn Summarizer,
        gateway: &'a dyn NotificationGateway,
        filter: SubscriptionFilter,
        settings: TriageSettings,
    ) -> Self {
        Self {
            pool,
            fetcher,
            summarizer,
            gateway,
            filter,
            settings,
        }
    }

    /// Drive a run from its persisted stage to `done`. Completed stages are
    /// never re-entered; a cancelled run is finalized at the next stage
    /// boundary without touching the remaining stages.
    #[instrument(skip_all, fields(run_id))]
    pub async fn run(&self, run_id: i64) -> Result<TriageOutcome> {
        loop {
            let run = db::load_run(self.pool, run_id).await?;
            if run.stage == RunStage::Done {
                return Ok(run.outcome());
            }
            if run.cancelled {
                info!(
                    run_id,
                    stage = run.stage.as_str(),
                    "run cancelled; finishing early"
                );
                db::complete_run(self.pool, run_id).await?;
                return Ok(run.outcome());
            }

            match run.stage {
                RunStage::Fetching => self.fetch_stage(&run).await?,
                RunStage::Summarizing => self.summarize_stage(&run).await?,
                RunStage::Filtering => self.filter_stage(&run).await?,
                RunStage::Deciding => self.decide_stage(&run).await?,
                RunStage::Notifying => self.notify_stage(&run).await?,
                RunStage::Done => return Ok(run.outcome()),
            }
        }
    }

    /// Pull every submitted message from the provider, park the bodies on
    /// disk and upsert the rows. An empty store short-circuits the run.
    #[instrument(skip_all, fields(run_id = run.id))]
    async fn fetch_stage(&self, run: &RunForTriage) -> Result<()> {
        let Some(user) = db::user_external_id(self.pool, run.user_id).await? else {
            warn!(
                run_id = run.id,
                user_id = run.user_id,
                "run references an unknown user; finishing"
            );
            db::complete_run(self.pool, run.id).await?;
            return Ok(());
        };

        // Ids stored on an earlier attempt (or by an earlier batch) are not
        // fetched again; their rows join the checkpoint as-is.
        let known = db::existing_messages(self.pool, run.user_id, &run.submitted_ids).await?;
        let known_ids: HashSet<&str> = known.iter().map(|(_, ext)| ext.as_str()).collect();
        let missing: Vec<String> = run
            .submitted_ids
            .iter()
            .filter(|ext| !known_ids.contains(ext.as_str()))
            .cloned()
            .collect();

        let report = fetch_all(
            self.fetcher,
            &user,
            &missing,
            self.settings.fetch_concurrency,
        )
        .await;

        let mut stored: Vec<i64> = known.iter().map(|(id, _)| *id).collect();
        for msg in &report.messages {
            let body_ref = self.store_body(&user, &msg.external_id, &msg.body).await?;
            let id = db::upsert_message(self.pool, run.user_id, msg, &body_ref).await?;
            stored.push(id);
        }
        stored.sort_unstable();
        stored.dedup();

        let result = FetchStageResult {
            stored,
            failed: report.failed,
        };
        info!(
            run_id = run.id,
            stored = result.stored.len(),
            reused = known.len(),
            failed = result.failed.len(),
            "fetch stage complete"
        );
        let nothing_stored = result.stored.is_empty();
        db::complete_fetch_stage(self.pool, run.id, &result).await?;
        if nothing_stored {
            db::complete_run(self.pool, run.id).await?;
        }
        Ok(())
    }

    /// Summarize each stored message with bounded concurrency. A message
    /// whose summary cannot be produced drops out of the run; it does not
    /// fail the stage.
    #[instrument(skip_all, fields(run_id = run.id))]
    async fn summarize_stage(&self, run: &RunForTriage) -> Result<()> {
        let fetch = run.fetch_result.as_ref().ok_or_else(|| {
            anyhow!("run {} reached summarizing without a fetch checkpoint", run.id)
        })?;
        let messages = db::messages_by_ids(self.pool, &fetch.stored).await?;

        let summarized = Arc::new(Mutex::new(Vec::new()));
        let failed = Arc::new(Mutex::new(Vec::new()));

        futures::stream::iter(&messages)
            .for_each_concurrent(Some(self.settings.summarize_concurrency.max(1)), |msg| {
                let summarized = Arc::clone(&summarized);
                let failed = Arc::clone(&failed);
                async move {
                    let body = self.read_body(msg.body_ref.as_deref()).await;
                    let outcome =
                        retry_async(self.settings.summarize_retry, "summarize", || {
                            self.summarizer.summarize(&msg.subject, &msg.sender, &body)
                        })
                        .await;
                    match outcome {
                        Ok(summary) => {
                            match db::record_summary(self.pool, run.id, msg.id, &summary).await {
                                Ok(()) => summarized.lock().await.push(msg.id),
                                Err(err) => {
                                    warn!(?err, message_id = msg.id, "failed to persist summary");
                                    failed.lock().await.push(msg.id);
                                }
                            }
                        }
                        Err(err) => {
                            warn!(
                                ?err,
                                message_id = msg.id,
                                "summarize failed; message drops out of this run"
                            );
                            failed.lock().await.push(msg.id);
                        }
                    }
                }
            })
            .await;

        let mut summarized = std::mem::take(&mut *summarized.lock().await);
        let mut failed = std::mem::take(&mut *failed.lock().await);
        summarized.sort_unstable();
        failed.sort_unstable();

        let result = SummaryStageResult { summarized, failed };
        info!(
            run_id = run.id,
            summarized = result.summarized.len(),
            failed = result.failed.len(),
            "summarize stage complete"
        );
        db::complete_summary_stage(self.pool, run.id, &result).await?;
        Ok(())
    }

    /// Drop high-urgency candidates that look like bulk mail. The filter
    /// runs after scoring so a newsletter with an alarming subject still
    /// gets suppressed.
    #[instrument(skip_all, fields(run_id = run.id))]
    async fn filter_stage(&self, run: &RunForTriage) -> Result<()> {
        let rows = db::candidates_above_threshold(
            self.pool,
            run.id,
            self.settings.high_priority_threshold,
        )
        .await?;

        let mut candidates = Vec::new();
        let mut suppressed = Vec::new();
        for row in &rows {
            let body = self.read_body(row.body_ref.as_deref()).await;
            if self.filter.is_bulk(&row.sender, &row.subject, &body) {
                info!(
                    run_id = run.id,
                    message_id = row.message_id,
                    sender = %row.sender,
                    "suppressing bulk sender despite high urgency"
                );
                suppressed.push(row.message_id);
            } else {
                candidates.push(row.message_id);
            }
        }

        let result = FilterStageResult {
            candidates,
            suppressed,
        };
        info!(
            run_id = run.id,
            candidates = result.candidates.len(),
            suppressed = result.suppressed.len(),
            "filter stage complete"
        );
        db::complete_filter_stage(self.pool, run.id, &result).await?;
        Ok(())
    }

    /// The decision is recomputed at notify time from the filter checkpoint,
    /// so this stage only logs it and advances.
    #[instrument(skip_all, fields(run_id = run.id))]
    async fn decide_stage(&self, run: &RunForTriage) -> Result<()> {
        let filter = run.filter_result.as_ref().ok_or_else(|| {
            anyhow!("run {} reached deciding without a filter checkpoint", run.id)
        })?;
        match self.plan_notification(run.id, filter).await? {
            Some(plan) => info!(
                run_id = run.id,
                message_id = plan.message_id,
                urgency = plan.urgency_score,
                high_priority = plan.high_priority_count,
                "decision: notify"
            ),
            None => info!(run_id = run.id, "decision: nothing urgent enough to push"),
        }
        db::complete_decide_stage(self.pool, run.id).await?;
        Ok(())
    }

    /// Send the push, annotate the winning message, finish the run. A push
    /// failure bubbles up so the driver backs the whole run off.
    #[instrument(skip_all, fields(run_id = run.id))]
    async fn notify_stage(&self, run: &RunForTriage) -> Result<()> {
        let filter = run.filter_result.as_ref().ok_or_else(|| {
            anyhow!("run {} reached notifying without a filter checkpoint", run.id)
        })?;
        let Some(plan) = self.plan_notification(run.id, filter).await? else {
            info!(run_id = run.id, "no urgent candidates; finishing without a push");
            db::complete_run(self.pool, run.id).await?;
            return Ok(());
        };
        let Some(user) = db::user_external_id(self.pool, run.user_id).await? else {
            warn!(
                run_id = run.id,
                user_id = run.user_id,
                "user disappeared before notify; finishing"
            );
            db::complete_run(self.pool, run.id).await?;
            return Ok(());
        };

        retry_async(self.settings.notify_retry, "notify", || {
            self.gateway.notify(&user, &plan)
        })
        .await
        .with_context(|| format!("push for run {} failed", run.id))?;

        // A crash between the push and these writes re-sends on resume; the
        // run never records a push it did not make.
        db::annotate_triage_action(self.pool, plan.message_id, "notified").await?;
        db::mark_notified(self.pool, run.id).await?;
        info!(
            run_id = run.id,
            message_id = plan.message_id,
            "notification recorded"
        );
        Ok(())
    }

    /// Rebuild the notification decision from the filter checkpoint: the
    /// top-ranked surviving candidate plus the survivor count. `None` when
    /// the filter left nothing standing.
    async fn plan_notification(
        &self,
        run_id: i64,
        filter: &FilterStageResult,
    ) -> Result<Option<NotificationPlan>> {
        if filter.candidates.is_empty() {
            return Ok(None);
        }
        let ranked = db::candidates_by_ids(self.pool, run_id, &filter.candidates).await?;
        let Some(top) = ranked.first() else {
            return Ok(None);
        };
        Ok(Some(NotificationPlan {
            message_id: top.message_id,
            external_id: top.external_id.clone(),
            sender: top.sender.clone(),
            subject: top.subject.clone(),
            urgency_score: top.urgency_score,
            rationale: top.rationale.clone(),
            high_priority_count: ranked.len(),
        }))
    }

    async fn store_body(&self, user: &str, external_id: &str, body: &str) -> Result<String> {
        let dir = self
            .settings
            .data_dir
            .join("bodies")
            .join(sanitize_component(user));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create body dir {}", dir.display()))?;
        let path = dir.join(format!("{}.txt", sanitize_component(external_id)));
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("failed to write body {}", path.display()))?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// A missing or unreadable body degrades to empty text rather than
    /// failing the stage.
    async fn read_body(&self, body_ref: Option<&str>) -> String {
        let Some(path) = body_ref else {
            return String::new();
        };
        match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) => {
                warn!(?err, path, "message body unreadable; continuing without it");
                String::new()
            }
        }
    }
}

/// External ids and account names come from providers and may contain path
/// separators or dots; flatten them before they become file names.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Claim and execute the next due run. Returns `false` when the queue is
/// idle. A failing run is backed off exponentially; once its attempt budget
/// is spent it is parked as failed and stops being claimed.
#[instrument(skip_all)]
pub async fn process_next_run(
    workflow: &TriageWorkflow<'_>,
    max_backoff_seconds: i64,
    max_run_attempts: i32,
) -> Result<bool> {
    let Some(run) = db::next_due_run(workflow.pool).await? else {
        return Ok(false);
    };

    info!(
        run_id = run.id,
        stage = run.stage.as_str(),
        attempt = run.attempt,
        "processing triage run"
    );
    match workflow.run(run.id).await {
        Ok(outcome) => {
            info!(
                run_id = run.id,
                stored = outcome.stored_count,
                summarized = outcome.summarized_count,
                high_priority = outcome.high_priority_count,
                notified = outcome.notification_sent,
                "triage run finished"
            );
        }
        Err(err) => {
            if run.attempt + 1 >= max_run_attempts {
                error!(
                    ?err,
                    run_id = run.id,
                    attempt = run.attempt,
                    "triage run exhausted its attempts"
                );
                db::mark_run_failed(workflow.pool, run.id).await?;
            } else {
                warn!(
                    ?err,
                    run_id = run.id,
                    attempt = run.attempt,
                    "triage run failed; backing off"
                );
                db::backoff_run(workflow.pool, run.id, run.attempt, max_backoff_seconds).await?;
            }
        }
    }
    Ok(true)
}
