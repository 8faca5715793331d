//! Courier Daemon
//!
//! Hosts the delivery core as a standalone process: connects the channels
//! listed in the configuration, optionally accepts inbound channels, and
//! logs SLA compliance and alert transitions.
//!
//! # Usage
//!
//! ```bash
//! # Default config ($XDG_CONFIG_HOME/courier/courier.toml)
//! courier-daemon
//!
//! # Accept peers over TCP and the default Unix socket
//! courier-daemon --listen 127.0.0.1:7400 --listen-ipc
//!
//! # With verbose logging
//! RUST_LOG=debug courier-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `COURIER_CONFIG`: Config file path
//! - `COURIER_*`: Individual overrides, see `courier_core::config`
//! - `RUST_LOG`: Log filter
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (flushes batches, removes PID file and socket)

mod server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::{broadcast, Notify};
use tracing::{error, info, warn};

use courier_core::{
    config::load_config_from_path, transport::default_socket_path, AlertState, Courier,
    SystemClock,
};

use crate::server::{DaemonServer, ServerConfig};

/// Courier delivery daemon
#[derive(Debug, Parser)]
#[command(name = "courier-daemon", version, about)]
struct Args {
    /// Configuration file
    #[arg(long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Default log level for courier crates (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Accept channels on this TCP address
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Accept channels on a Unix socket (default path when no value is given)
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    listen_ipc: Option<Option<PathBuf>>,

    /// Refuse inbound channels above this count
    #[arg(long, default_value_t = 64)]
    max_channels: usize,

    /// Refuse inbound requests instead of echoing them
    #[arg(long)]
    no_echo: bool,

    /// Seconds between SLA reports (0 disables)
    #[arg(long, default_value_t = 60)]
    report_interval_secs: u64,

    /// Write the process id here while running
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("courier_daemon={level}").parse()?)
                .add_directive(format!("courier_core={level}").parse()?),
        )
        .with_target(true)
        .init();
    Ok(())
}

fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let pid = std::process::id();
    let mut file = fs::File::create(path)?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Periodically log per-channel SLA compliance
async fn report_loop(courier: Arc<Courier>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let metrics = courier.get_metrics();
        let sla = courier.get_sla_status();

        for metric in &metrics {
            let compliant = sla.get(&metric.channel_id).and_then(|s| s.is_compliant());
            info!(
                channel = %metric.channel_id,
                sent = metric.messages_sent,
                received = metric.messages_received,
                failures = metric.failures,
                p95_ms = metric.p95_latency_ms,
                availability = metric.availability,
                compliant = ?compliant,
                "Channel report"
            );
        }

        match serde_json::to_string(&courier.get_performance_comparison()) {
            Ok(json) => tracing::debug!(comparison = %json, "Performance comparison"),
            Err(e) => warn!(error = %e, "Failed to serialize performance comparison"),
        }
    }
}

/// Log alert transitions as they happen
async fn alert_loop(mut alerts: broadcast::Receiver<courier_core::AlertEvent>) {
    loop {
        match alerts.recv().await {
            Ok(event) => match event.state {
                AlertState::Raised => warn!(
                    channel = %event.channel_id,
                    kind = ?event.kind,
                    value = event.value,
                    threshold = event.threshold,
                    "Alert raised"
                ),
                AlertState::Resolved => info!(
                    channel = %event.channel_id,
                    kind = ?event.kind,
                    value = event.value,
                    "Alert resolved"
                ),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Alert subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Starting Courier Daemon");
    info!("PID: {}", std::process::id());

    let config = load_config_from_path(args.config.clone()).context("Failed to load configuration")?;
    info!(
        source = ?config.source(),
        path = ?config.config_file_path(),
        channels = config.channels.len(),
        "Configuration loaded"
    );

    if let Some(pid_path) = &args.pid_file {
        write_pid_file(pid_path)
            .with_context(|| format!("Failed to write PID file at {}", pid_path.display()))?;
    }

    let courier = Arc::new(Courier::new(config.clone(), SystemClock::shared()));

    for descriptor in &config.channels {
        match courier.register_channel(descriptor).await {
            Ok(()) => info!(channel = %descriptor.id, kind = %descriptor.kind, "Channel connected"),
            Err(e) => warn!(channel = %descriptor.id, error = %e, "Failed to connect channel"),
        }
    }

    let mut server = DaemonServer::new(
        Arc::clone(&courier),
        ServerConfig {
            max_channels: args.max_channels,
            echo_requests: !args.no_echo,
        },
    );
    if let Some(address) = &args.listen {
        let endpoint = server.listen_tcp(address).await?;
        info!(endpoint = %endpoint, "TCP listener bound");
    }
    #[cfg(unix)]
    {
        if let Some(path) = &args.listen_ipc {
            let path = path.clone().unwrap_or_else(default_socket_path);
            let endpoint = server.listen_ipc(&path)?;
            info!(endpoint = %endpoint, "IPC listener bound");
        }
    }

    let mut background = vec![tokio::spawn(alert_loop(courier.alerts()))];
    if args.report_interval_secs > 0 {
        background.push(tokio::spawn(report_loop(
            Arc::clone(&courier),
            Duration::from_secs(args.report_interval_secs),
        )));
    }

    let shutdown = Arc::new(Notify::new());
    let server_task = tokio::spawn(server.run(Arc::clone(&shutdown)));

    wait_for_signal().await;
    shutdown.notify_one();

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Server stopped with error"),
        Err(e) => error!(error = %e, "Server task failed"),
    }

    info!("Performing graceful shutdown...");
    courier.shutdown().await;
    for task in background {
        task.abort();
    }

    if let Some(pid_path) = &args.pid_file {
        remove_pid_file(pid_path);
    }

    info!("Courier daemon stopped cleanly");
    Ok(())
}
