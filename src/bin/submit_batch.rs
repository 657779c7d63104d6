use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use inbox_sentry::config;
use inbox_sentry::db;

#[derive(Debug, Parser)]
#[command(author, version, about = "Queue a batch of message ids for triage")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Account the messages belong to
    #[arg(long)]
    user: String,

    /// Email recorded the first time this account is seen
    #[arg(long)]
    email: Option<String>,

    /// Batch key; generated when omitted. Submitting the same key twice is
    /// rejected.
    #[arg(long)]
    batch: Option<String>,

    /// Provider message ids to triage
    #[arg(required = true)]
    message_ids: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let data_dir = cfg.app.resolved_data_dir();
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/sentry.db", data_dir.display()));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let batch_key = args.batch.unwrap_or_else(|| Uuid::new_v4().to_string());
    let user_id = db::get_or_create_user(&pool, &args.user, args.email.as_deref()).await?;
    let run_id = db::submit_run(&pool, user_id, &batch_key, &args.message_ids).await?;

    info!(
        run_id,
        user = %args.user,
        batch_key = %batch_key,
        messages = args.message_ids.len(),
        "triage run queued"
    );
    Ok(())
}
