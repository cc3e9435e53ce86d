use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use officeno::config::Config;
use officeno::engine::Engine;
use officeno::finalizer::{self, Clock, SystemClock};
use officeno::notify::NotifyHub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    officeno::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let registry = Arc::new(config.registry()?);
    let engine = Arc::new(Engine::new(config.wal_path(), Arc::new(NotifyHub::new()), registry.clone())?);

    info!("officeno started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  branches: {}", registry.len());
    info!("  finalize at: {} {}", config.schedule.at, config.schedule.tz);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let finalizer_task = tokio::spawn(finalizer::run_finalizer(engine.clone(), config.schedule, clock));
    let compactor_task = tokio::spawn(finalizer::run_compactor(engine.clone(), config.compact_threshold));

    // Stop on SIGTERM/ctrl-c. Writes are durable once acknowledged, so no drain is needed.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    finalizer_task.abort();
    compactor_task.abort();
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction skipped: {e}");
    }
    info!("officeno stopped");
    Ok(())
}
