use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use inbox_sentry::config;
use inbox_sentry::db;
use inbox_sentry::filter::SubscriptionFilter;
use inbox_sentry::mail::MailClient;
use inbox_sentry::push::PushClient;
use inbox_sentry::summarizer::AiClient;
use inbox_sentry::triage::{self, TriageSettings, TriageWorkflow};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    let subscription_filter = SubscriptionFilter::new(&cfg.filter.extra_bulk_domains);
    let settings = TriageSettings::from_config(&cfg);

    let workflow = TriageWorkflow::new(
        &pool,
        &mail_client,
        &ai_client,
        &push_client,
        subscription_filter,
        settings,
    );

    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let max_backoff = cfg.app.max_backoff_seconds as i64;
    let max_attempts = cfg.app.max_run_attempts as i32;

    info!("starting triage worker");
    loop {
        match triage::process_next_run(&workflow, max_backoff, max_attempts).await {
            Ok(processed) => {
                if !processed {
                    tokio::time::sleep(poll_sleep).await;
                }
            }
            Err(err) => {
                error!(?err, "triage worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
