use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use inbox_sentry::config;
use inbox_sentry::db;
use inbox_sentry::filter::SubscriptionFilter;
use inbox_sentry::mail::MailClient;
use inbox_sentry::push::PushClient;
use inbox_sentry::summarizer::AiClient;
use inbox_sentry::triage::{self, TriageSettings, TriageWorkflow};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Process every pending triage run and exit when the queue is empty"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Exit once the only remaining runs are waiting out a backoff
    #[arg(long)]
    skip_waiting: bool,
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

    let mail_client = MailClient::from_config(&cfg)?;
    let ai_client = AiClient::from_config(&cfg)?;
    let push_client = PushClient::from_config(&cfg)?;
    let workflow = TriageWorkflow::new(
        &pool,
        &mail_client,
        &ai_client,
        &push_client,
        SubscriptionFilter::new(&cfg.filter.extra_bulk_domains),
        TriageSettings::from_config(&cfg),
    );

    let max_backoff = cfg.app.max_backoff_seconds as i64;
    let max_attempts = cfg.app.max_run_attempts as i32;

    let remaining = db::count_pending_runs(&pool).await?;
    info!(remaining, "starting triage drain");
    if remaining == 0 {
        info!("no pending runs, exiting");
        return Ok(());
    }

    let mut processed = 0u64;
    loop {
        if triage::process_next_run(&workflow, max_backoff, max_attempts).await? {
            processed += 1;
            if processed % 10 == 0 {
                let remaining = db::count_pending_runs(&pool).await?;
                info!(processed, remaining, "drain progress");
            }
            continue;
        }

        let remaining = db::count_pending_runs(&pool).await?;
        if remaining == 0 {
            info!(processed, "all triage runs drained");
            break;
        }
        if args.skip_waiting {
            warn!(
                remaining,
                "--skip-waiting specified, exiting with runs still in backoff"
            );
            break;
        }
        warn!(
            remaining,
            "runs remain but none are due; waiting for backoff to expire"
        );
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    Ok(())
}
