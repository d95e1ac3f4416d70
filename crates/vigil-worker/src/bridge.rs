//! Worker bridge: wires the relay connection into the protocol engine.
//!
//! One bridge per generation. The relay connection is bridged as two
//! independent legs with independent termination: end-of-stream on the
//! read side never stops outbound writes, and a write failure never stops
//! inbound parsing. The bridge only ends when the worker is killed.

use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vigil_core::Config;
use vigil_core::control::{RelayAddress, SentinelMessage, WorkerMessage};
use vigil_core::net::RelayStream;
use vigil_proto::{LineSplitter, Message};

use crate::engine::{Engine, EngineOutput, Event};
use crate::modules;

/// Run the bridge for this generation.
///
/// `control_rx` carries the remaining control messages from the sentinel
/// (the init has already been consumed); `requests_tx` is the upward path
/// to the sentinel for module save/reload requests. `pending_connected`
/// replays a connection signal that arrived before init: cross-channel
/// ordering between the control channel and the relay is not guaranteed.
pub async fn run(
    config: Config,
    relay: RelayAddress,
    mut control_rx: mpsc::Receiver<SentinelMessage>,
    requests_tx: mpsc::Sender<WorkerMessage>,
    pending_connected: bool,
) -> anyhow::Result<()> {
    let mut engine = Engine::new(config);
    for name in engine.config().modules.clone() {
        match modules::resolve(&name) {
            Some(module) => {
                debug!(module = %name, "Attaching module");
                engine.attach(module);
            }
            None => warn!(module = %name, "Unknown module, skipping"),
        }
    }

    info!(%relay, "Dialing relay transport");
    let stream = vigil_core::net::connect(&relay).await?;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut splitter = LineSplitter::new();
    let mut buf = vec![0u8; 8192];
    let mut read_open = true;
    let mut write_open = true;
    let mut control_open = true;

    if pending_connected {
        let output = engine.dispatch(&Event::Connected);
        flush(output, &mut writer, &mut write_open, &requests_tx).await;
    }

    loop {
        if !read_open && !control_open {
            // Nothing left that could produce events; park until the
            // sentinel kills us rather than exiting (an exit would read
            // as a deliberate stop).
            info!("All bridge inputs closed, parking");
            std::future::pending::<()>().await;
        }

        tokio::select! {
            read = reader.read(&mut buf), if read_open => match read {
                Ok(0) => {
                    warn!("Relay connection closed its read side");
                    read_open = false;
                }
                Ok(n) => {
                    splitter.push(&buf[..n]);
                    while let Some(line) = splitter.next_line() {
                        let Some(msg) = Message::parse(&line) else {
                            debug!(%line, "Skipping malformed line");
                            continue;
                        };
                        let output = engine.dispatch(&Event::Message(msg));
                        flush(output, &mut writer, &mut write_open, &requests_tx).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Relay read failed");
                    read_open = false;
                }
            },
            ctl = control_rx.recv(), if control_open => match ctl {
                Some(SentinelMessage::Connection) => {
                    debug!("Connection signal, emitting connect event");
                    let output = engine.dispatch(&Event::Connected);
                    flush(output, &mut writer, &mut write_open, &requests_tx).await;
                }
                Some(SentinelMessage::Init { .. }) => {
                    warn!("Duplicate init message, ignoring");
                }
                None => {
                    warn!("Control channel closed");
                    control_open = false;
                }
            },
        }
    }
}

/// Write queued lines to the relay and forward supervisor requests.
async fn flush(
    output: EngineOutput,
    writer: &mut WriteHalf<RelayStream>,
    write_open: &mut bool,
    requests_tx: &mpsc::Sender<WorkerMessage>,
) {
    for line in output.lines {
        if !*write_open {
            debug!("Write leg closed, dropping outbound line");
            break;
        }
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(error = %e, "Relay write failed");
            *write_open = false;
        }
    }
    for request in output.requests {
        if requests_tx.send(request).await.is_err() {
            warn!("Request channel closed, dropping supervisor request");
        }
    }
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
