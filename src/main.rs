//! store-probe: connectivity smoke-tester for backing stores
//!
//! Depending on `DB_TYPE` the prober repeatedly talks to one store:
//! - `pg`: PostgreSQL ping, optional insert, read of the newest row
//! - `redis`: Redis SET and GET of a fixed key
//!
//! Every iteration's outcome is logged; store errors never stop the loop.
//! The process runs until it receives Ctrl-C or SIGTERM.

mod config;
mod probers;

use std::process::ExitCode;

use clap::Parser;
use config::{CliArgs, Mode, Settings};
use probers::{Shutdown, ShutdownTrigger};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration; nothing touches the network before this succeeds
    let settings = match Settings::from_env(cli) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Prober failed");
            ExitCode::FAILURE
        }
    }
}

fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    info!(log_level = %settings.log_level, "Starting store-probe");

    // Both clients share one crypto provider; errs only if already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (trigger, shutdown) = Shutdown::new();
        tokio::spawn(watch_signals(trigger));

        match &settings.mode {
            Mode::Postgres(pg) => {
                info!(interval_secs = settings.interval.as_secs(), "Starting PostgreSQL prober");
                probers::relational::start(pg, settings.interval, shutdown).await
            }
            Mode::Redis(kv) => {
                info!(interval_secs = settings.interval.as_secs(), "Starting Redis prober");
                probers::keyvalue::start(kv, settings.interval, shutdown).await
            }
        }
    })
}

/// Fire the shutdown trigger on Ctrl-C or SIGTERM.
async fn watch_signals(trigger: ShutdownTrigger) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown requested");
    trigger.trigger();
}
