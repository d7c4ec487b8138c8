//! CLI entry point for Lodestore.
//!
//! Starts the embedded broker, provisions the session and cache buckets,
//! serves the item API, and tears everything down in order on Ctrl-C or
//! SIGTERM.  Exits 1 if startup, serving or shutdown fails.

mod app;
mod cli;
mod config;
mod shutdown;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::app::AppContext;
use crate::cli::Cli;
use crate::config::{AppConfig, LogFormat};
use crate::shutdown::shutdown_signal;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is normal.
    let _ = dotenvy::dotenv();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match AppConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(config.log_format);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "lodestore exited with an error");
            ExitCode::FAILURE
        }
    }
}

/// Start, wait for a signal or a fatal serve error, then shut down.
async fn run(config: AppConfig) -> Result<()> {
    let mut ctx = AppContext::start(config).await?;

    let serve_error = tokio::select! {
        e = ctx.http.failed() => {
            error!(error = %e, "http server failed");
            Some(e)
        }
        () = shutdown_signal() => None,
    };

    let shutdown = ctx.into_shutdown().run().await;
    if let Some(e) = serve_error {
        if let Err(steps) = shutdown {
            error!(error = %steps, "shutdown after serve failure was incomplete");
        }
        return Err(e).context("http server stopped unexpectedly");
    }
    shutdown.context("shutdown incomplete")?;
    info!("bye");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Install the global subscriber.  `RUST_LOG` overrides the `info` default.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}
