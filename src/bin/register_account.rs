use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use crm_sync::config;
use crm_sync::db;

#[derive(Debug, Parser)]
#[command(author, version, about = "Add a CRM account to the store or replace its refresh token")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// CRM account (portal) id
    #[arg(long)]
    account_id: String,

    /// OAuth refresh token issued for the account
    #[arg(long)]
    refresh_token: String,
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

    db::upsert_account(&pool, args.account_id.trim(), args.refresh_token.trim()).await?;
    let accounts = db::load_accounts(&pool).await?;
    info!(
        account_id = %args.account_id,
        total_accounts = accounts.len(),
        "account registered"
    );
    Ok(())
}
