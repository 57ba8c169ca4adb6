use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use keep_sync::config;
use keep_sync::db;
use keep_sync::http::{app, AppState};
use keep_sync::keep::KeepClient;
use keep_sync::notify::Notifier;
use keep_sync::notion::NotionClient;
use keep_sync::orchestrator::SyncOrchestrator;
use keep_sync::runner::SyncRunner;
use keep_sync::vault::TokenCipher;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// YAML configuration file
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

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/keep_sync.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let timeout = Duration::from_secs(cfg.services.request_timeout_secs);
    let keep: Arc<KeepClient> = Arc::new(KeepClient::new(&cfg.services.keep_extractor_url, timeout)?);
    let notion: Arc<NotionClient> =
        Arc::new(NotionClient::new(&cfg.services.notion_writer_url, timeout)?);
    let cipher = Arc::new(TokenCipher::new(&cfg.encryption.key)?);
    let notifier = Arc::new(Notifier::from_config(&cfg.notifications));

    let orchestrator = SyncOrchestrator::new(
        pool.clone(),
        keep.clone(),
        notion.clone(),
        cipher,
        notifier,
    )
    .with_note_limit(cfg.sync.note_limit);
    let (runner, _worker) = SyncRunner::spawn(orchestrator, cfg.app.queue_depth);

    let state = AppState {
        pool,
        runner,
        keep,
        notion,
    };

    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.app.bind_addr))?;
    info!(addr = %cfg.app.bind_addr, "sync service listening");
    axum::serve(listener, app(state))
        .await
        .context("server error")?;

    Ok(())
}
