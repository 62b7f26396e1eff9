// SITREP node daemon: LAN discovery, position/chat/order relay, event log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sitrep_node::config;
use sitrep_node::{CoordinatorError, TransportCoordinator, TransportMode};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sitrep-node", version, about = "SITREP tactical messaging node")]
struct Cli {
    /// Config file (default: ~/.config/sitrep/config.toml, then /etc/sitrep/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    callsign: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Extra unicast peer, "host" or "host:port". Repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,
    /// "local" or "broker".
    #[arg(long)]
    mode: Option<TransportMode>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut cfg = match &cli.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };
    if let Some(c) = cli.callsign {
        cfg.callsign = c;
    }
    if let Some(p) = cli.port {
        cfg.port = p;
    }
    if let Some(m) = cli.mode {
        cfg.mode = m;
    }
    cfg.peers.extend(cli.peers);

    let settings = cfg.settings();
    info!(
        device_id = %settings.local.device_id,
        callsign = %settings.local.callsign,
        mode = %settings.mode,
        port = settings.udp.port,
        "starting sitrep-node"
    );
    // No broker client ships with the daemon; embedders supply one through the library.
    let coordinator = Arc::new(TransportCoordinator::new(settings, None));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        log_events(&coordinator);
        match coordinator.start().await {
            Err(CoordinatorError::BrokerUnavailable) => {
                anyhow::bail!("broker mode needs a broker client; run with --mode local")
            }
            other => other.context("starting transport")?,
        }
        if let Err(e) = coordinator.publish_profile().await {
            warn!(error = %e, "initial profile broadcast failed");
        }
        shutdown_signal().await?;
        info!("shutting down");
        coordinator.stop().await;
        Ok(())
    })
}

fn log_events(coordinator: &TransportCoordinator) {
    let bus = coordinator.events();
    spawn_logger("hello", bus.subscribe_hello());
    spawn_logger("position", bus.subscribe_positions());
    spawn_logger("profile", bus.subscribe_profiles());
    spawn_logger("pin", bus.subscribe_pins());
    spawn_logger("chat", bus.subscribe_chat());
    spawn_logger("order", bus.subscribe_orders());
    spawn_logger("linked_form", bus.subscribe_linked_forms());
    spawn_logger("form_ack", bus.subscribe_form_acks());
}

fn spawn_logger<T>(category: &'static str, mut rx: broadcast::Receiver<T>)
where
    T: std::fmt::Debug + Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => info!(category, ?event, "event"),
                Err(RecvError::Lagged(skipped)) => warn!(category, skipped, "event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
