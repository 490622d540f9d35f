//! sentlog - report matching log lines to Sentry.

use anyhow::{Context, Result};
use clap::Parser;
use sentlog::cli::Cli;
use sentlog::config::DSN_ENV;
use sentlog::logging::init_tracing;
use sentlog::metrics;
use sentlog::reporter::sentry::SentrySessions;
use sentlog::reporter::{DisabledSessions, SessionFactory};
use sentlog::runner::{signals, RunOutcome, Supervisor};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONTROL_CHANNEL_CAPACITY: usize = 8;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.log_format, cli.verbose) {
        eprintln!("sentlog: {err:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(err) => {
            error!(error = %format!("{err:#}"), "sentlog failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<RunOutcome> {
    let metrics_addr = cli.metrics_addr;
    let run = cli.into_run_config()?;

    // keeps the Sentry client alive until the process exits
    let sessions: Arc<dyn SessionFactory> = if run.dry_run {
        info!("dry run: matched entries are not reported");
        Arc::new(DisabledSessions)
    } else {
        let dsn = run.sentry_dsn.as_deref().with_context(|| {
            format!("no Sentry DSN configured: set sentry_dsn or {DSN_ENV}, or use --dry-run")
        })?;
        Arc::new(SentrySessions::init(dsn)?)
    };

    if run.verbose {
        info!(
            inputs = run.inputs.len(),
            pattern_files = run.pattern_files.len(),
            max_events = ?run.max_events,
            "verbose output enabled"
        );
    }

    let supervisor = Supervisor::new(run, sessions)?;

    let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
    let signal_listener = signals::listen(control_tx)?;

    let metrics_shutdown = CancellationToken::new();
    let metrics_server = metrics_addr.map(|addr| {
        let shutdown = metrics_shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(addr, shutdown).await {
                warn!(error = %format!("{err:#}"), "metrics server stopped");
            }
        })
    });

    let outcome = supervisor.run(control_rx).await;

    metrics_shutdown.cancel();
    if let Some(server) = metrics_server {
        let _ = server.await;
    }
    signal_listener.abort();

    let outcome = outcome?;
    info!(outcome = ?outcome, "sentlog stopped");
    Ok(outcome)
}
