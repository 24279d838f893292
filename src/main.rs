mod cli;

use clap::Parser;
use eyre::eyre;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Command};
use stagehand::{exit_guard, HarnessConfig, LogSink, MockOriginServer, ProcessSupervisor, Result, StartOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            retries,
            backoff_ms,
        } => {
            let config = cli::load_config(&config, retries, backoff_ms)?;
            run(config).await
        }
        Command::Origin { config, name } => {
            let config = HarnessConfig::from_path(&config)?;
            serve_origin(config, &name).await
        }
    }
}

/// Starts everything, then tears down on Ctrl-C / SIGTERM.
async fn run(config: HarnessConfig) -> Result<()> {
    // Interrupts go through stop() so ports are seen closing.
    exit_guard::leave_signals_to_caller(true);

    let mut supervisor = ProcessSupervisor::new(config)?.with_log(LogSink::tracing());

    match supervisor.start().await {
        Ok(StartOutcome::Ready) => {
            info!("harness ready, press Ctrl-C to stop");
            wait_for_shutdown_signal().await?;
            supervisor.stop().await
        }
        Ok(StartOutcome::Completed { service, status }) => {
            info!("{} finished: {}", service, status);
            supervisor.stop().await?;
            if status.success() {
                Ok(())
            } else {
                Err(eyre!("{} failed: {}", service, status))
            }
        }
        Err(e) => {
            // Leave nothing behind, but report the original failure.
            if let Err(stop_error) = supervisor.stop().await {
                tracing::warn!("cleanup after failed start: {}", stop_error);
            }
            Err(e)
        }
    }
}

async fn serve_origin(config: HarnessConfig, name: &str) -> Result<()> {
    let service = config
        .servers
        .get(name)
        .ok_or_else(|| eyre!("No service named '{}' in config", name))?;

    let server = MockOriginServer::from_service(name, service, LogSink::tracing()).await?;
    wait_for_shutdown_signal().await?;
    server.stop().await;
    info!("{} stopped", name);
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
    Ok(())
}
