//! flowstate - run-state orchestration engine
//!
//! Opens the data directory, applies configured limits and keeps the log
//! synced until interrupted.

use flowstate_runtime::{Config, Orchestrator};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // An explicitly named config file must load; otherwise fall back to defaults.
    let config_path = std::env::var("FLOWSTATE_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Ignoring invalid environment configuration: {}", e);
            Config::default()
        }
    };

    tracing::info!("Starting flowstate");
    tracing::info!("  Data directory: {}", config.storage.data_dir.display());
    tracing::info!("  Fsync policy: {}", String::from(config.storage.fsync_policy));
    tracing::info!(
        "  Core rules: {}",
        if config.policy.apply_core_rules {
            "enabled"
        } else {
            "disabled"
        }
    );
    for (tag, limit) in &config.concurrency_limits {
        tracing::info!("  Concurrency limit: {}={}", tag, limit);
    }

    let orchestrator = Orchestrator::open(config)?;
    let maintenance = Arc::new(orchestrator.maintenance());

    let maintenance_handle = {
        let task = maintenance.clone();
        tokio::spawn(async move {
            task.run().await;
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping...");
    maintenance.shutdown();
    let _ = maintenance_handle.await;

    if let Err(e) = orchestrator.shutdown() {
        tracing::error!("Failed to sync WAL on shutdown: {}", e);
    }

    tracing::info!("flowstate stopped");
    Ok(())
}
