//! One-shot run of the profile fetch job.
//!
//! Runs `profile_fetcher` once and prints the execution record as JSON.
//! Entries are claimed in the database, so a daemon running alongside never
//! fetches the same entry. Ctrl-C cancels the run; entries already stored
//! stay stored.
//!
//! Usage: `run-profile-fetch [--config <path>] [--job <name>]`

use std::path::PathBuf;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use profile_harvester::state::{load_config, AppState};
use profile_harvester::types::PROFILE_FETCHER_JOB;

struct Args {
    config: Option<PathBuf>,
    job: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut parsed = Args {
        config: None,
        job: PROFILE_FETCHER_JOB.to_string(),
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                parsed.config = Some(PathBuf::from(args.next().context("--config needs a path")?))
            }
            "--job" => parsed.job = args.next().context("--job needs a name")?,
            other => anyhow::bail!(
                "Unknown argument '{}'. Usage: run-profile-fetch [--config <path>] [--job <name>]",
                other
            ),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args()?;
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    let state = AppState::new(config).context("Failed to initialise services")?;

    // Make sure the job row exists on a fresh database
    state.scheduler()?.ensure_default_jobs()?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Ctrl-C received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let execution = match state.fetcher.execute(&args.job, &cancel).await {
        Ok(execution) => execution,
        Err(e) => match e.history() {
            Some(history) => {
                log::warn!("Run stopped early: {}", e);
                history.clone()
            }
            None => {
                log::error!("{}", e.recovery_suggestion());
                if e.is_retryable() {
                    log::info!("The failure is transient; rerunning later may succeed");
                }
                return Err(e).context(format!("Job '{}' failed", args.job));
            }
        },
    };

    println!("{}", serde_json::to_string_pretty(&execution)?);
    Ok(())
}
