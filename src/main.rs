//! # xAPI Bridge CLI (`xapi-bridge`)
//!
//! Watches an Open edX tracking log and publishes xAPI statements to the
//! configured Learning Record Store until it receives SIGHUP, SIGINT,
//! SIGTERM or SIGABRT.
//!
//! ```bash
//! xapi-bridge --config ./config/xapi-bridge.toml /edx/var/log/tracking/tracking.log
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use xapi_bridge::config;
use xapi_bridge::lrs::{LrsClient, StatementPublisher};
use xapi_bridge::server;
use xapi_bridge::watch::Supervisor;

const DEFAULT_LOG_PATH: &str = "/edx/var/log/tracking/tracking.log";

/// Publish Open edX tracking log events to a Learning Record Store as xAPI
/// statements.
#[derive(Parser)]
#[command(name = "xapi-bridge", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, default_value = "./config/xapi-bridge.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long)]
    debug: bool,

    /// Tracking log to tail.
    #[arg(default_value = DEFAULT_LOG_PATH)]
    log_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_logging(cli.debug || cfg.debug);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let status = if cfg.status.enabled {
        let bind = cfg.status.bind.clone();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            server::run_status_server(&bind, rx).await
        }))
    } else {
        None
    };

    // try to connect to the LRS immediately
    let client = Arc::new(LrsClient::new(&cfg.lrs)?);
    match client.about().await {
        Ok(about) => info!(
            endpoint = client.endpoint(),
            "Successfully connected to remote LRS. Described by {}",
            about.raw
        ),
        Err(e) => {
            error!(endpoint = client.endpoint(), "could not reach LRS: {}", e);
            shutdown_tx.send_replace(true);
            bail!("LRS connectivity check failed: {}", e);
        }
    }

    let log_path = absolute(cli.log_path)?;
    info!(
        path = %log_path.display(),
        "Watching file, starting time {}",
        chrono::Utc::now().to_rfc3339()
    );

    let mut signals = ShutdownSignals::install().context("could not install signal handlers")?;
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let name = signals.recv().await;
        info!("{} received, shutting down", name);
        signal_tx.send_replace(true);
    });

    let result = Supervisor::new(log_path, &cfg, client).run(shutdown_rx).await;

    shutdown_tx.send_replace(true);
    if let Some(handle) = status {
        info!("Shutting down http server");
        match tokio::time::timeout(std::time::Duration::from_secs(2), handle).await {
            Ok(Ok(Err(e))) => error!("status server failed: {}", e),
            Ok(Err(e)) => error!("status server task failed: {}", e),
            Err(_) => error!("status server did not stop in time"),
            Ok(Ok(Ok(()))) => {}
        }
    }

    if let Err(e) = &result {
        error!("fatal: {}", e);
    }
    result.context("watch terminated")
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// SIGABRT is 6 on every unix the bridge targets.
const SIGABRT: std::os::raw::c_int = 6;

/// Process signals that end the watch in an orderly way.
struct ShutdownSignals {
    hangup: Signal,
    interrupt: Signal,
    terminate: Signal,
    abort: Signal,
}

impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            abort: signal(SignalKind::from_raw(SIGABRT))?,
        })
    }

    /// Name of the next signal received.
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.hangup.recv() => "SIGHUP",
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.abort.recv() => "SIGABRT",
        }
    }
}

fn absolute(path: PathBuf) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()?.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    fn send_to_self(signal: &str) {
        let status = Command::new("kill")
            .args(["-s", signal, &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn abort_and_hangup_request_shutdown() {
        let mut signals = ShutdownSignals::install().unwrap();

        send_to_self("ABRT");
        let name = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap();
        assert_eq!(name, "SIGABRT");

        send_to_self("HUP");
        let name = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap();
        assert_eq!(name, "SIGHUP");
    }
}
