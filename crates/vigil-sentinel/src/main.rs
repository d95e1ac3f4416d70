//! Vigil Sentinel
//!
//! The sentinel keeps a long-lived IRC session alive across network
//! failures and hot-swaps the worker process that drives it without ever
//! dropping the session. It owns the upstream link, the local relay
//! rendezvous and the worker lifecycle.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use vigil_core::config::{ConfigStore, default_config_path};
use vigil_core::control::RelayAddress;
use vigil_core::net::RelayListener;
use vigil_sentinel::link::{Link, LinkConfig};
use vigil_sentinel::relay::Relay;
use vigil_sentinel::supervisor::{
    NotifyExhaustedPolicy, Supervisor, SupervisorCommand, SupervisorConfig,
};

#[derive(Parser, Debug)]
#[command(name = "vigil-sentinel")]
#[command(version, about = "Vigil sentinel - persistent IRC link and worker supervisor")]
struct Args {
    /// Configuration file path
    #[arg(long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the upstream server from the config file
    #[arg(long, env = "VIGIL_SERVER")]
    server: Option<String>,

    /// Override the upstream port from the config file
    #[arg(long, env = "VIGIL_PORT")]
    port: Option<u16>,

    /// Connect with TLS regardless of the config file
    #[arg(long)]
    tls: bool,

    /// Skip TLS peer verification (self-signed upstream certificates)
    #[arg(long)]
    allow_insecure_tls: bool,

    /// Local address to bind the outgoing connection to
    #[arg(long, env = "VIGIL_BIND")]
    bind: Option<IpAddr>,

    /// Path to the worker executable spawned each generation
    #[arg(long, default_value = "vigil-worker", env = "VIGIL_WORKER_BIN")]
    worker_bin: PathBuf,

    /// Behavior when connection-notification retries are exhausted
    #[arg(
        long,
        default_value = "respawn",
        env = "VIGIL_ON_NOTIFY_EXHAUSTED",
        value_parser = ["respawn", "fatal"]
    )]
    on_notify_exhausted: String,

    /// Log level filter for the sentinel (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "VIGIL_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "VIGIL_LOG_JSON")]
    log_json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("vigil_sentinel={}", args.log_level);
    vigil_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting vigil-sentinel");

    // A startup config failure is fatal with a diagnostic; everything
    // after this point recovers on its own.
    let config_path = args.config.unwrap_or_else(default_config_path);
    let store = ConfigStore::new(&config_path);
    let mut config = store
        .load()
        .map_err(|e| anyhow::anyhow!("Cannot start without configuration: {e}"))?;

    if let Some(server) = args.server {
        config.server = server;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.tls {
        config.tls = true;
    }
    if args.allow_insecure_tls {
        config.allow_insecure_tls = true;
    }
    if args.bind.is_some() {
        config.bind = args.bind;
    }

    // The rendezvous address is fixed for our entire lifetime; every
    // worker generation dials the same one.
    let (relay_listener, relay_address) = RelayListener::bind().await?;
    info!(relay = %relay_address, "Relay transport online");

    let (link_to_relay_tx, link_to_relay_rx) = mpsc::channel::<Vec<u8>>(128);
    let (relay_to_link_tx, relay_to_link_rx) = mpsc::channel::<Vec<u8>>(128);
    let (link_events_tx, link_events_rx) = mpsc::channel(16);

    tokio::spawn(Relay::new(relay_listener, link_to_relay_rx, relay_to_link_tx).run());
    tokio::spawn(
        Link::new(
            LinkConfig::from_config(&config),
            link_to_relay_tx,
            relay_to_link_rx,
            link_events_tx,
        )
        .run(),
    );

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    #[cfg(unix)]
    {
        let cmd_tx = cmd_tx.clone();
        let mut sighup =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        tokio::spawn(async move {
            while sighup.recv().await.is_some() {
                info!("Received SIGHUP, requesting reload");
                if cmd_tx.send(SupervisorCommand::Reload).await.is_err() {
                    return;
                }
            }
        });
    }

    let on_notify_exhausted = match args.on_notify_exhausted.as_str() {
        "fatal" => NotifyExhaustedPolicy::Fatal,
        _ => NotifyExhaustedPolicy::Respawn,
    };
    let mut supervisor_config = SupervisorConfig::new(args.worker_bin);
    supervisor_config.on_notify_exhausted = on_notify_exhausted;

    let supervisor = Supervisor::new(
        supervisor_config,
        store,
        config,
        relay_address.clone(),
        link_events_rx,
        cmd_rx,
    );

    // Notify systemd that the sentinel is up (unix only). The `true`
    // parameter unsets $NOTIFY_SOCKET so worker processes don't
    // accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let result = tokio::select! {
        result = supervisor.run() => result.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            Ok(())
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            Ok(())
        }
    };

    if let RelayAddress::Path(path) = &relay_address {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(error = %e, "Failed to remove relay socket");
        }
    }

    info!("Sentinel stopped");
    result
}
