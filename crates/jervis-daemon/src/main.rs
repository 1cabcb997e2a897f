//! Jervis daemon entry point — loads config, opens the staging store, and
//! runs the supervisor until a shutdown signal arrives.

use anyhow::{Context, Result};
use jervis_core::config::Config;
use tracing::info;

use jervis_daemon::daemon::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("failed to load config, using defaults: {e}");
        Config::default()
    });

    if config.logging.json {
        jervis_telemetry::logging::init_logging_json("jervis-daemon", &config.logging.level);
    } else {
        jervis_telemetry::logging::init_logging("jervis-daemon", &config.logging.level);
    }

    if config.staging.database_path.starts_with("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        config.staging.database_path = config.staging.database_path.replacen('~', &home, 1);
    }
    if let Some(parent) = std::path::Path::new(&config.staging.database_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "jervis daemon starting"
    );

    let supervisor = Supervisor::new(config)
        .await
        .context("failed to initialize supervisor")?;
    let shutdown = supervisor.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    supervisor.run().await?;
    info!("jervis daemon stopped");
    Ok(())
}
