//! Profile harvester daemon.
//!
//! Loads the configuration, starts the cron scheduler and runs until Ctrl-C.
//!
//! Usage: `profile-harvester [--config <path>]`

use std::path::PathBuf;

use anyhow::Context;

use profile_harvester::state::{load_config, AppState};

fn config_arg() -> anyhow::Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(None),
        Some("--config") => {
            let path = args.next().context("--config needs a path")?;
            Ok(Some(PathBuf::from(path)))
        }
        Some(other) => anyhow::bail!("Unknown argument '{}'. Usage: profile-harvester [--config <path>]", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = config_arg()?;
    let config = load_config(config_path.as_deref()).context("Failed to load configuration")?;
    let state = AppState::new(config).context("Failed to initialise services")?;

    let scheduler = state.scheduler()?;
    let active = scheduler.start()?;
    for job in scheduler.registered_jobs() {
        log::info!(
            "  {} [{}] next run {}",
            job.job_name,
            job.schedule,
            job.next_run_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        );
    }
    if active == 0 {
        log::warn!("No enabled jobs; waiting for Ctrl-C");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutdown requested, stopping scheduler");
    scheduler.stop().await;

    Ok(())
}
