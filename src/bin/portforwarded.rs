//! Portforwarded server
//!
//! Loads settings, holds the configured port mappings for the lifetime of the
//! configured process, and exits with the run's exit code.

use anyhow::Context;
use clap::Parser;
use portforwarded::cli::Cli;
use portforwarded::gateway::upnp::{UpnpClient, UPNP_TIMEOUT};
use portforwarded::{cancel, Coordinator, ExitReason, Interrupter, Settings};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long abandoned gateway calls may hold up process exit
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    let cli = Cli::parse();
    portforwarded::init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(ExitReason::Unhandled.code())
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    let code = runtime.block_on(supervise(cli))?;

    // Gateway calls abandoned on interrupt may still sit on the blocking pool
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
    Ok(code)
}

async fn supervise(cli: Cli) -> anyhow::Result<u8> {
    info!("Launching portforwarded, loading configuration");

    let settings = match Settings::from_cli(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            return Ok(ExitReason::ConfigInvalid.code());
        }
    };

    let (interrupter, cancellation) = cancel::channel();
    listen_for_interrupts(interrupter).context("Failed to install signal handlers")?;

    let client = UpnpClient::new(UPNP_TIMEOUT, settings.lease_seconds);
    let report = Coordinator::new(client, settings).run(cancellation).await;

    Ok(report.exit_code())
}

/// Turn Ctrl-C (and SIGTERM on Unix) into interrupts; nothing else happens here
#[cfg(unix)]
fn listen_for_interrupts(interrupter: Interrupter) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                received = interrupt.recv() => received,
                received = terminate.recv() => received,
            };
            if received.is_none() {
                warn!("Signal stream closed, no longer listening for interrupts");
                return;
            }
            interrupter.interrupt();
            info!("Exiting process (interrupt #{})", interrupter.count());
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn listen_for_interrupts(interrupter: Interrupter) -> anyhow::Result<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Error listening for interrupt: {}", e);
                return;
            }
            interrupter.interrupt();
            info!("Exiting process (interrupt #{})", interrupter.count());
        }
    });
    Ok(())
}
