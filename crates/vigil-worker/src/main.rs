//! Vigil Worker
//!
//! One worker process per generation. Announces readiness on stdout
//! immediately, waits for the init control message, then bridges the relay
//! connection into the protocol engine and configured modules. Logs go to
//! stderr; stdout is the control channel and stays clean NDJSON.

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use vigil_core::control::{SentinelMessage, WorkerMessage};
use vigil_worker::bridge;

#[derive(Parser, Debug)]
#[command(name = "vigil-worker")]
#[command(version, about = "Vigil worker - protocol engine and bot modules")]
struct Args {
    /// Log level filter for the worker (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "VIGIL_WORKER_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "VIGIL_LOG_JSON")]
    log_json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("vigil_worker={}", args.log_level);
    vigil_core::tracing_init::init_tracing_stderr(&log_filter, args.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting vigil-worker");

    // Control messages towards the sentinel, written by a dedicated task.
    let (out_tx, mut out_rx) = mpsc::channel::<WorkerMessage>(32);
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(msg) = out_rx.recv().await {
            let line = match msg.to_line() {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "Failed to encode control message");
                    continue;
                }
            };
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                error!("Control channel write failed");
                break;
            }
        }
    });

    // Readiness means "process started", not "relay connected": announce
    // before anything else.
    out_tx.send(WorkerMessage::Ready).await?;

    // Control messages from the sentinel, parsed off stdin.
    let (control_tx, mut control_rx) = mpsc::channel::<SentinelMessage>(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match SentinelMessage::parse(&line) {
                Ok(msg) => {
                    if control_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Unparseable control line from sentinel"),
            }
        }
        debug!("Sentinel control channel closed");
    });

    // Wait for init. A connection signal may legitimately arrive first;
    // buffer it and replay after initialization.
    let mut pending_connected = false;
    let (config, relay) = loop {
        match control_rx.recv().await {
            Some(SentinelMessage::Init { config, relay }) => break (config, relay),
            Some(SentinelMessage::Connection) => {
                debug!("Connection signal before init, buffering");
                pending_connected = true;
            }
            None => {
                warn!("Sentinel closed the control channel before init, exiting");
                return Ok(());
            }
        }
    };

    info!("Initializing worker");
    bridge::run(*config, relay, control_rx, out_tx, pending_connected).await
}
