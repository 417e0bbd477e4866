use std::sync::Arc;

use anyhow::{Context, Result};
use syftbox_rs::{config::ConfigOverrides, filters::SyncFilters, telemetry::HttpStats, ApiClient, Config, SyncEngine};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(err) = run().await {
        eprintln!("syftbox: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let config_path = Config::resolve_config_path(None);
    let cfg = Config::load_with_overrides(&config_path, ConfigOverrides::default())
        .context("load config")?;

    let log_path = syftbox_rs::logging::init_default_log_file().context("init log file")?;
    syftbox_rs::logging::info(format!(
        "syftbox starting email={} server={} dataDir={} log={}",
        cfg.email,
        cfg.server_url,
        cfg.data_dir.display(),
        log_path.display()
    ));

    syftbox_rs::workspace::ensure_workspace_layout(&cfg.data_dir, &cfg.email)
        .context("prepare workspace layout")?;
    let _lock = syftbox_rs::workspace::WorkspaceLock::try_lock(&cfg.data_dir)
        .context("acquire workspace lock")?;

    let datasites_root = cfg.data_dir.join("datasites");
    let filters = SyncFilters::load(&datasites_root).context("load sync filters")?;

    let stats = Arc::new(HttpStats::default());
    let api = ApiClient::new(
        &cfg.server_url,
        &cfg.email,
        cfg.access_token.as_deref(),
        cfg.refresh_token.as_deref(),
        cfg.config_path.as_deref(),
        stats,
    )
    .context("build api client")?;

    let engine = SyncEngine::new(cfg, api, filters)
        .await
        .context("build sync engine")?;
    engine.start().await.context("start sync engine")?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    syftbox_rs::logging::info("syftbox shutting down");
    engine.stop().await;
    Ok(())
}
