use super::model::{CandidateForNotify, MessageForSummary, RunForTriage};
use crate::model::{
    FetchStageResult, FetchedMessage, FilterStageResult, MessageSummary, RunStage,
    SummaryStageResult,
};
use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_or_create_user(
    pool: &Pool,
    external_id: &str,
    email: Option<&str>,
) -> Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE external_id = ?")
        .bind(external_id)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query("INSERT INTO users (external_id, email) VALUES (?, ?) RETURNING id")
        .bind(external_id)
        .bind(email)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn user_external_id(pool: &Pool, user_id: i64) -> Result<Option<String>> {
    let id = sqlx::query_scalar::<_, String>("SELECT external_id FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

/// Store a fetched message, keyed by `(user_id, external_id)`. Re-storing the
/// same message refreshes the provider fields but never duplicates the row,
/// and leaves any triage annotation in place.
#[instrument(skip_all)]
pub async fn upsert_message(
    pool: &Pool,
    user_id: i64,
    msg: &FetchedMessage,
    body_ref: &str,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO messages (user_id, external_id, subject, sender, received_at, body_ref) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(user_id, external_id) DO UPDATE SET \
             subject = excluded.subject, \
             sender = excluded.sender, \
             received_at = excluded.received_at, \
             body_ref = excluded.body_ref \
         RETURNING id",
    )
    .bind(user_id)
    .bind(&msg.external_id)
    .bind(&msg.subject)
    .bind(&msg.sender)
    .bind(msg.received_at)
    .bind(body_ref)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// Which of `external_ids` this user already has stored, as `(row id,
/// external id)` pairs. Lets the fetch stage skip ids it holds a copy of.
#[instrument(skip_all)]
pub async fn existing_messages(
    pool: &Pool,
    user_id: i64,
    external_ids: &[String],
) -> Result<Vec<(i64, String)>> {
    if external_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; external_ids.len()].join(", ");
    let sql = format!(
        "SELECT id, external_id FROM messages WHERE user_id = ? AND external_id IN ({})",
        placeholders
    );
    let mut query = sqlx::query(&sql).bind(user_id);
    for external_id in external_ids {
        query = query.bind(external_id);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get("id"), row.get("external_id")))
        .collect())
}

#[instrument(skip_all)]
pub async fn messages_by_ids(pool: &Pool, ids: &[i64]) -> Result<Vec<MessageForSummary>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT id, external_id, subject, sender, body_ref FROM messages WHERE id IN ({}) ORDER BY id",
        placeholders
    );
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|row| MessageForSummary {
            id: row.get("id"),
            external_id: row.get("external_id"),
            subject: row.get("subject"),
            sender: row.get("sender"),
            body_ref: row.try_get::<Option<String>, _>("body_ref").ok().flatten(),
        })
        .collect())
}

/// The single mutable field on a stored message.
#[instrument(skip_all)]
pub async fn annotate_triage_action(pool: &Pool, message_id: i64, action: &str) -> Result<()> {
    sqlx::query("UPDATE messages SET triage_action = ? WHERE id = ?")
        .bind(action)
        .bind(message_id)
        .execute(pool)
        .await
        .context("failed to annotate message")?;
    Ok(())
}

/// Summaries are append-only: replaying a stage hits the `(run_id,
/// message_id)` key and is ignored.
#[instrument(skip_all)]
pub async fn record_summary(
    pool: &Pool,
    run_id: i64,
    message_id: i64,
    summary: &MessageSummary,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO summaries (run_id, message_id, urgency_score, action, rationale) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(run_id, message_id) DO NOTHING",
    )
    .bind(run_id)
    .bind(message_id)
    .bind(i64::from(summary.urgency_score))
    .bind(summary.action.as_str())
    .bind(&summary.rationale)
    .execute(pool)
    .await?;
    Ok(())
}

const CANDIDATE_COLUMNS: &str = "s.message_id, m.external_id, m.subject, m.sender, \
     m.received_at, s.urgency_score, s.rationale, m.body_ref";

const CANDIDATE_ORDER: &str =
    "s.urgency_score DESC, datetime(m.received_at) ASC, m.external_id ASC";

fn map_candidate(row: &SqliteRow) -> CandidateForNotify {
    CandidateForNotify {
        message_id: row.get("message_id"),
        external_id: row.get("external_id"),
        subject: row.get("subject"),
        sender: row.get("sender"),
        received_at: row.get("received_at"),
        urgency_score: row.get("urgency_score"),
        rationale: row.get("rationale"),
        body_ref: row.try_get::<Option<String>, _>("body_ref").ok().flatten(),
    }
}

/// Messages in a run whose urgency cleared the threshold, ranked.
#[instrument(skip_all)]
pub async fn candidates_above_threshold(
    pool: &Pool,
    run_id: i64,
    threshold: i64,
) -> Result<Vec<CandidateForNotify>> {
    let sql = format!(
        "SELECT {} FROM summaries s JOIN messages m ON m.id = s.message_id \
         WHERE s.run_id = ? AND s.urgency_score >= ? ORDER BY {}",
        CANDIDATE_COLUMNS, CANDIDATE_ORDER
    );
    let rows = sqlx::query(&sql)
        .bind(run_id)
        .bind(threshold)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(map_candidate).collect())
}

/// The same ranked view restricted to an explicit candidate set, used when
/// the notify stage rebuilds its decision from the filter checkpoint.
#[instrument(skip_all)]
pub async fn candidates_by_ids(
    pool: &Pool,
    run_id: i64,
    message_ids: &[i64],
) -> Result<Vec<CandidateForNotify>> {
    if message_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; message_ids.len()].join(", ");
    let sql = format!(
        "SELECT {} FROM summaries s JOIN messages m ON m.id = s.message_id \
         WHERE s.run_id = ? AND m.id IN ({}) ORDER BY {}",
        CANDIDATE_COLUMNS, placeholders, CANDIDATE_ORDER
    );
    let mut query = sqlx::query(&sql).bind(run_id);
    for id in message_ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows.iter().map(map_candidate).collect())
}

/// Queue a batch of message ids for triage. Each `(user, batch_key)` pair is
/// accepted exactly once.
#[instrument(skip_all)]
pub async fn submit_run(
    pool: &Pool,
    user_id: i64,
    batch_key: &str,
    message_ids: &[String],
) -> Result<i64> {
    let submitted = serde_json::to_string(message_ids).context("encode submitted ids")?;
    let row = sqlx::query(
        "INSERT INTO triage_runs (user_id, batch_key, submitted_ids) VALUES (?, ?, ?) \
         ON CONFLICT(user_id, batch_key) DO NOTHING RETURNING id",
    )
    .bind(user_id)
    .bind(batch_key)
    .bind(submitted)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Err(anyhow!("batch {} already submitted", batch_key));
    };
    Ok(row.get::<i64, _>("id"))
}

const RUN_COLUMNS: &str = "id, user_id, batch_key, stage, attempt, cancelled, notified, \
     failed_at, submitted_ids, fetch_result, summary_result, filter_result";

fn parse_json_column<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
    column: &str,
) -> Result<Option<T>> {
    match raw {
        Some(text) => {
            let value = serde_json::from_str(&text)
                .with_context(|| format!("corrupt {} payload", column))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn map_run(row: &SqliteRow) -> Result<RunForTriage> {
    let stage_str: String = row.get("stage");
    let stage = RunStage::parse(&stage_str)
        .ok_or_else(|| anyhow!("run has unknown stage {}", stage_str))?;
    let submitted_raw: String = row.get("submitted_ids");
    let submitted_ids: Vec<String> =
        serde_json::from_str(&submitted_raw).context("corrupt submitted_ids payload")?;
    let fetch_result: Option<FetchStageResult> =
        parse_json_column(row.try_get("fetch_result").ok().flatten(), "fetch_result")?;
    let summary_result: Option<SummaryStageResult> = parse_json_column(
        row.try_get("summary_result").ok().flatten(),
        "summary_result",
    )?;
    let filter_result: Option<FilterStageResult> = parse_json_column(
        row.try_get("filter_result").ok().flatten(),
        "filter_result",
    )?;

    Ok(RunForTriage {
        id: row.get("id"),
        user_id: row.get("user_id"),
        batch_key: row.get("batch_key"),
        stage,
        attempt: row.get("attempt"),
        cancelled: row.get("cancelled"),
        notified: row.get("notified"),
        failed_at: row.try_get("failed_at").ok().flatten(),
        submitted_ids,
        fetch_result,
        summary_result,
        filter_result,
    })
}

#[instrument(skip_all)]
pub async fn load_run(pool: &Pool, run_id: i64) -> Result<RunForTriage> {
    let sql = format!("SELECT {} FROM triage_runs WHERE id = ?", RUN_COLUMNS);
    let row = sqlx::query(&sql).bind(run_id).fetch_optional(pool).await?;
    let Some(row) = row else {
        return Err(anyhow!("run {} not found", run_id));
    };
    map_run(&row)
}

/// Oldest due run that is neither finished nor permanently failed.
/// Cancelled runs are still claimed once so the workflow can finalize them.
#[instrument(skip_all)]
pub async fn next_due_run(pool: &Pool) -> Result<Option<RunForTriage>> {
    let sql = format!(
        "SELECT {} FROM triage_runs \
         WHERE stage != 'done' AND failed_at IS NULL \
           AND datetime(due_at) <= CURRENT_TIMESTAMP \
         ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
        RUN_COLUMNS
    );
    let row = sqlx::query(&sql).fetch_optional(pool).await?;
    match row {
        Some(row) => Ok(Some(map_run(&row)?)),
        None => Ok(None),
    }
}

#[instrument(skip_all)]
pub async fn complete_fetch_stage(
    pool: &Pool,
    run_id: i64,
    result: &FetchStageResult,
) -> Result<()> {
    let payload = serde_json::to_string(result).context("encode fetch result")?;
    let updated = sqlx::query(
        "UPDATE triage_runs SET stage = 'summarizing', fetch_result = ?, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ? AND stage = 'fetching'",
    )
    .bind(payload)
    .bind(run_id)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(anyhow!("run {} is not in the fetching stage", run_id));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn complete_summary_stage(
    pool: &Pool,
    run_id: i64,
    result: &SummaryStageResult,
) -> Result<()> {
    let payload = serde_json::to_string(result).context("encode summary result")?;
    let updated = sqlx::query(
        "UPDATE triage_runs SET stage = 'filtering', summary_result = ?, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ? AND stage = 'summarizing'",
    )
    .bind(payload)
    .bind(run_id)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(anyhow!("run {} is not in the summarizing stage", run_id));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn complete_filter_stage(
    pool: &Pool,
    run_id: i64,
    result: &FilterStageResult,
) -> Result<()> {
    let payload = serde_json::to_string(result).context("encode filter result")?;
    let updated = sqlx::query(
        "UPDATE triage_runs SET stage = 'deciding', filter_result = ?, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ? AND stage = 'filtering'",
    )
    .bind(payload)
    .bind(run_id)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(anyhow!("run {} is not in the filtering stage", run_id));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn complete_decide_stage(pool: &Pool, run_id: i64) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE triage_runs SET stage = 'notifying', updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND stage = 'deciding'",
    )
    .bind(run_id)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(anyhow!("run {} is not in the deciding stage", run_id));
    }
    Ok(())
}

/// Record a successful push and finish the run in one write, so a resumed
/// run can never observe "sent but still pending".
#[instrument(skip_all)]
pub async fn mark_notified(pool: &Pool, run_id: i64) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE triage_runs SET notified = 1, stage = 'done', \
         updated_at = CURRENT_TIMESTAMP WHERE id = ? AND stage = 'notifying'",
    )
    .bind(run_id)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(anyhow!("run {} is not in the notifying stage", run_id));
    }
    Ok(())
}

/// Finish a run without a notification. Used for cancelled runs, empty
/// batches, and runs where nothing cleared the bar.
#[instrument(skip_all)]
pub async fn complete_run(pool: &Pool, run_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE triage_runs SET stage = 'done', updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn backoff_run(pool: &Pool, id: i64, attempt: i32, max_cap_secs: i64) -> Result<()> {
    // Exponential backoff: 5s * 2^attempt, capped.
    let secs = (5_i64) * (1_i64 << attempt.min(10));
    let cap = if max_cap_secs <= 0 { secs } else { max_cap_secs };
    let secs = secs.min(cap);
    sqlx::query(
        "UPDATE triage_runs SET attempt = ?, due_at = datetime('now', ? || ' seconds'), \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_run_failed(pool: &Pool, run_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE triage_runs SET failed_at = CURRENT_TIMESTAMP, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Flag a run so the workflow finishes it early at the next stage boundary.
#[instrument(skip_all)]
pub async fn cancel_run(pool: &Pool, run_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE triage_runs SET cancelled = 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_pending_runs(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM triage_runs WHERE stage != 'done' AND failed_at IS NULL",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionClass;
    use chrono::{TimeZone, Utc};

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_message(external_id: &str, subject: &str) -> FetchedMessage {
        FetchedMessage {
            external_id: external_id.to_string(),
            subject: subject.to_string(),
            sender: "alice@example.com".to_string(),
            received_at: Utc.with_ymd_and_hms(2026, 8, 20, 9, 0, 0).unwrap(),
            body: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_message_is_idempotent() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "acct-1", Some("a@example.com"))
            .await
            .unwrap();

        let msg = sample_message("ext-1", "First");
        let id1 = upsert_message(&pool, uid, &msg, "/tmp/a.txt").await.unwrap();
        annotate_triage_action(&pool, id1, "notified").await.unwrap();

        let refreshed = sample_message("ext-1", "First (edited)");
        let id2 = upsert_message(&pool, uid, &refreshed, "/tmp/a.txt")
            .await
            .unwrap();
        assert_eq!(id1, id2);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let (subject, action): (String, Option<String>) =
            sqlx::query_as("SELECT subject, triage_action FROM messages WHERE id = ?")
                .bind(id1)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(subject, "First (edited)");
        assert_eq!(action.as_deref(), Some("notified"));
    }

    #[tokio::test]
    async fn existing_messages_scopes_by_user() {
        let pool = setup_pool().await;
        let alice = get_or_create_user(&pool, "acct-a", None).await.unwrap();
        let bob = get_or_create_user(&pool, "acct-b", None).await.unwrap();

        let id = upsert_message(&pool, alice, &sample_message("ext-1", "Hers"), "/tmp/a.txt")
            .await
            .unwrap();
        upsert_message(&pool, bob, &sample_message("ext-2", "His"), "/tmp/b.txt")
            .await
            .unwrap();

        let asked = vec!["ext-1".to_string(), "ext-2".to_string(), "ext-3".to_string()];
        let known = existing_messages(&pool, alice, &asked).await.unwrap();
        assert_eq!(known, vec![(id, "ext-1".to_string())]);

        assert!(existing_messages(&pool, alice, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_run_rejects_duplicate_batch() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "acct-2", None).await.unwrap();
        let ids = vec!["m-1".to_string(), "m-2".to_string()];

        let run_id = submit_run(&pool, uid, "batch-a", &ids).await.unwrap();
        assert!(submit_run(&pool, uid, "batch-a", &ids).await.is_err());

        let run = load_run(&pool, run_id).await.unwrap();
        assert_eq!(run.stage, RunStage::Fetching);
        assert_eq!(run.submitted_ids, ids);
        assert!(run.fetch_result.is_none());
    }

    #[tokio::test]
    async fn stage_advance_is_guarded() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "acct-3", None).await.unwrap();
        let run_id = submit_run(&pool, uid, "batch-b", &["m-1".to_string()])
            .await
            .unwrap();

        let result = FetchStageResult {
            stored: vec![7],
            failed: vec![],
        };
        complete_fetch_stage(&pool, run_id, &result).await.unwrap();
        assert!(complete_fetch_stage(&pool, run_id, &result).await.is_err());

        let run = load_run(&pool, run_id).await.unwrap();
        assert_eq!(run.stage, RunStage::Summarizing);
        assert_eq!(run.fetch_result.unwrap(), result);
    }

    #[tokio::test]
    async fn backoff_run_pushes_due_forward() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "acct-4", None).await.unwrap();
        let run_id = submit_run(&pool, uid, "batch-c", &["m-1".to_string()])
            .await
            .unwrap();

        let due = next_due_run(&pool).await.unwrap();
        assert_eq!(due.map(|r| r.id), Some(run_id));

        backoff_run(&pool, run_id, 0, 60).await.unwrap();
        assert!(next_due_run(&pool).await.unwrap().is_none());

        let run = load_run(&pool, run_id).await.unwrap();
        assert_eq!(run.attempt, 1);
        assert_eq!(count_pending_runs(&pool).await.unwrap(), 1);

        mark_run_failed(&pool, run_id).await.unwrap();
        assert_eq!(count_pending_runs(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn record_summary_ignores_replay() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "acct-5", None).await.unwrap();
        let run_id = submit_run(&pool, uid, "batch-d", &["m-1".to_string()])
            .await
            .unwrap();
        let msg_id = upsert_message(&pool, uid, &sample_message("m-1", "Hi"), "/tmp/b.txt")
            .await
            .unwrap();

        let first = MessageSummary {
            urgency_score: 80,
            action: ActionClass::ReplyNeeded,
            rationale: "deadline".to_string(),
        };
        let replay = MessageSummary {
            urgency_score: 5,
            action: ActionClass::Ignore,
            rationale: "replayed".to_string(),
        };
        record_summary(&pool, run_id, msg_id, &first).await.unwrap();
        record_summary(&pool, run_id, msg_id, &replay).await.unwrap();

        let (count, score): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), MAX(urgency_score) FROM summaries")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
        assert_eq!(score, 80);
    }

    #[tokio::test]
    async fn candidates_are_ranked_deterministically() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, "acct-6", None).await.unwrap();
        let run_id = submit_run(&pool, uid, "batch-e", &[]).await.unwrap();

        let mut early = sample_message("ext-a", "Early");
        early.received_at = Utc.with_ymd_and_hms(2026, 8, 20, 8, 0, 0).unwrap();
        let mut late = sample_message("ext-b", "Late");
        late.received_at = Utc.with_ymd_and_hms(2026, 8, 20, 10, 0, 0).unwrap();
        let mut top = sample_message("ext-c", "Top");
        top.received_at = Utc.with_ymd_and_hms(2026, 8, 20, 11, 0, 0).unwrap();

        let early_id = upsert_message(&pool, uid, &early, "/tmp/1.txt").await.unwrap();
        let late_id = upsert_message(&pool, uid, &late, "/tmp/2.txt").await.unwrap();
        let top_id = upsert_message(&pool, uid, &top, "/tmp/3.txt").await.unwrap();

        let summary = |score: u8| MessageSummary {
            urgency_score: score,
            action: ActionClass::ActionRequired,
            rationale: String::new(),
        };
        record_summary(&pool, run_id, early_id, &summary(80)).await.unwrap();
        record_summary(&pool, run_id, late_id, &summary(80)).await.unwrap();
        record_summary(&pool, run_id, top_id, &summary(95)).await.unwrap();

        let ranked = candidates_above_threshold(&pool, run_id, 70).await.unwrap();
        let order: Vec<i64> = ranked.iter().map(|c| c.message_id).collect();
        assert_eq!(order, vec![top_id, early_id, late_id]);

        // Below-threshold summaries never surface.
        let none = candidates_above_threshold(&pool, run_id, 96).await.unwrap();
        assert!(none.is_empty());

        let subset = candidates_by_ids(&pool, run_id, &[late_id, early_id])
            .await
            .unwrap();
        let order: Vec<i64> = subset.iter().map(|c| c.message_id).collect();
        assert_eq!(order, vec![early_id, late_id]);
    }
}
