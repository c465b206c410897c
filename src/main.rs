use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crm_sync::config;
use crm_sync::crm::{HubSpotClient, OAuthCredentials};
use crm_sync::db::{self, SqliteAccountStore};
use crm_sync::engine::SyncEngine;
use crm_sync::sink::SqliteActionSink;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Pull CRM changes for every stored account into the action store and exit"
)]
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let credentials = OAuthCredentials::from_env()?;
    let crm = Arc::new(HubSpotClient::new(&cfg.crm.base_url, &cfg.crm.token_path)?);
    let sink = Arc::new(SqliteActionSink::new(pool.clone()));
    let store = SqliteAccountStore::new(pool.clone());

    if !cfg.app.persist_checkpoints {
        warn!("checkpoint persistence disabled; every run re-syncs from scratch");
    }
    let engine = SyncEngine::new(crm, sink, credentials, &cfg.sync)
        .with_checkpoint_persistence(cfg.app.persist_checkpoints);

    let reports = engine.run(&store).await?;
    let failed = reports.iter().filter(|r| !r.failed.is_empty()).count();
    let stored = db::count_actions(&pool).await?;
    info!(
        accounts = reports.len(),
        accounts_with_failures = failed,
        stored_actions = stored,
        "sync run completed"
    );
    Ok(())
}
