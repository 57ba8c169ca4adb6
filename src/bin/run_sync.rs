use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use keep_sync::config;
use keep_sync::db;
use keep_sync::keep::KeepClient;
use keep_sync::model::JobStatus;
use keep_sync::notify::Notifier;
use keep_sync::notion::NotionClient;
use keep_sync::orchestrator::SyncOrchestrator;
use keep_sync::vault::TokenCipher;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one sync job to completion and print the report"
)]
struct Args {
    /// YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// User whose notes should be synced
    #[arg(long)]
    user_id: String,

    /// Ignore the incremental window and sync every note
    #[arg(long)]
    full_sync: bool,
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

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/keep_sync.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let timeout = Duration::from_secs(cfg.services.request_timeout_secs);
    let orchestrator = SyncOrchestrator::new(
        pool,
        Arc::new(KeepClient::new(&cfg.services.keep_extractor_url, timeout)?),
        Arc::new(NotionClient::new(&cfg.services.notion_writer_url, timeout)?),
        Arc::new(TokenCipher::new(&cfg.encryption.key)?),
        Arc::new(Notifier::from_config(&cfg.notifications)),
    )
    .with_note_limit(cfg.sync.note_limit);

    let report = orchestrator
        .execute_sync(
            Uuid::new_v4(),
            &args.user_id,
            args.full_sync,
            CancellationToken::new(),
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.status != JobStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}
