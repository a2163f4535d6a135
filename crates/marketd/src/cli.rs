//! Exposes the command line application.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use marketd_service::caching::Resolution;
use marketd_service::config::Config;
use marketd_service::metrics;
use marketd_service::service::Service;

use crate::logging;

/// marketd commands.
#[derive(Subcommand)]
enum Command {
    /// Run the warm scheduler until interrupted.
    Run,
    /// Warm one job, or all registered jobs, and exit.
    Warm {
        /// The job id to warm; all jobs when omitted.
        job: Option<String>,
    },
    /// Drop cached records whose indicator name matches a glob.
    Flush {
        /// Indicator name glob, e.g. `market:*`.
        pattern: String,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "marketd", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        environment: config.environment.clone().map(Into::into),
        ..Default::default()
    });

    // SAFETY: We are in a single-threaded context, before the runtime is
    // started.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags: BTreeMap<String, String> = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone()
            && let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok())
        {
            tags.insert(tag, name);
        }
        if let Some(tag) = config.metrics.environment_tag.clone()
            && let Some(environment) = sentry.options().environment.as_ref()
        {
            tags.insert(tag, environment.to_string());
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    match cli.command {
        Command::Run => runtime.block_on(run(config)),
        Command::Warm { job } => runtime.block_on(warm(config, job)),
        Command::Flush { pattern } => runtime.block_on(flush(config, &pattern)),
    }
}

async fn run(config: Config) -> Result<()> {
    let grace = config.scheduler.shutdown_grace;
    let service = Service::create(config)?;

    match service.stats().await {
        Ok(stats) => tracing::info!(keys = stats.keys, "cache store reachable"),
        Err(error) => tracing::warn!(%error, "cache store unreachable, starting anyway"),
    }

    tracing::info!("running initial warm");
    service.warm_all().await;

    let scheduler = service.start_scheduler();
    tracing::info!("scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    tracing::info!("shutting down");
    scheduler.shutdown(grace).await;
    Ok(())
}

async fn warm(config: Config, job: Option<String>) -> Result<()> {
    let service = Service::create(config)?;
    match job {
        Some(id) => {
            let resolution = service.warm_job(&id).await?;
            match resolution {
                Resolution::Fresh { payload, .. } => {
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                }
                Resolution::Stale { payload, .. } => {
                    tracing::warn!(job = %id, "warm fell back to a stale payload");
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                }
                Resolution::WarmingUp => anyhow::bail!("job {id} did not produce a payload"),
                Resolution::ProducerError(error) => {
                    anyhow::bail!("failed to warm {id}: {error}")
                }
            }
        }
        None => service.warm_all().await,
    }
    Ok(())
}

async fn flush(config: Config, pattern: &str) -> Result<()> {
    let service = Service::create(config)?;
    let deleted = service.flush(pattern).await?;
    println!("flushed {deleted} records");
    Ok(())
}
