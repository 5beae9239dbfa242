//! Runner entry point.

use std::process::ExitCode;

use clap::Parser;
use runner::{Cli, Config, LogFormat, Runner, RunnerError};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use workflow::EngineConfig;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, requesting cancellation");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, requesting cancellation");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr so stdout carries only the command's JSON output.
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

async fn run(cli: Cli, config: Config) -> runner::Result<()> {
    // 1. Install Prometheus exporter
    if let Some(addr) = config.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| RunnerError::Metrics(e.to_string()))?;
        tracing::info!(%addr, "serving Prometheus metrics");
    }

    // 2. Open the log and build the engine
    let log = runner::open_log(&config).await?;
    let runner = Runner::new(log, EngineConfig::from_env())?;

    // 3. Resume what a previous process left unfinished
    if !cli.no_recover && cli.command.recovers_first() {
        let recovered = runner.engine().recover().await?;
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "resumed unfinished instances");
        }
    }

    // 4. Run the command
    let output = runner.execute(cli.command, shutdown_signal()).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::from_env();
    init_tracing(&config);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "runner failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
