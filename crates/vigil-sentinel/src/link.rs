//! Persistent upstream link.
//!
//! Maintains exactly one active IRC session and hides transient failures
//! from everything downstream. The socket is exclusively owned by the link
//! task and replaced wholesale on every reconnect; it never escapes.
//!
//! Bytes are bridged to the relay transport through a pair of chunk
//! channels that outlive both the socket and any relay connection, so
//! end-of-stream on one side never implicitly terminates the other.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, trace, warn};

use vigil_core::Config;
use vigil_proto::{LineSplitter, Message};

use crate::transport::{LinkStream, connect_tcp, connect_tls};

/// Fixed idle timeout before ping probing starts.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Fixed delay between reconnect attempts.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Immutable snapshot of connection parameters, taken per attempt.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub allow_insecure_tls: bool,
    pub local_bind: Option<IpAddr>,
    pub ca_cert: Option<PathBuf>,
    pub reconnect_delay: Duration,
    pub idle_timeout: Duration,
}

impl LinkConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            port: config.port,
            use_tls: config.tls,
            allow_insecure_tls: config.allow_insecure_tls,
            local_bind: config.bind,
            ca_cert: config.ca_cert.clone(),
            reconnect_delay: config
                .reconnect_delay_secs
                .map_or(DEFAULT_RECONNECT_DELAY, Duration::from_secs),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Events surfaced by the link to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A fresh upstream session was established.
    Connected,
}

/// Errors from a single connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Failed to resolve {0}")]
    Resolve(String),
}

/// Why a session loop ended. Every variant leads to the same place: a
/// delayed, unconditional reconnect.
#[derive(Debug)]
enum SessionEnd {
    RemoteClosed,
    ReadError(std::io::Error),
    WriteError(std::io::Error),
    PingTimeout,
}

/// The persistent network link task.
pub struct Link {
    config: LinkConfig,
    /// Raw inbound socket bytes, towards the relay transport.
    to_relay: mpsc::Sender<Vec<u8>>,
    /// Raw outbound bytes from the relay transport, towards the socket.
    from_relay: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<LinkEvent>,
}

impl Link {
    pub fn new(
        config: LinkConfig,
        to_relay: mpsc::Sender<Vec<u8>>,
        from_relay: mpsc::Receiver<Vec<u8>>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            config,
            to_relay,
            from_relay,
            events,
        }
    }

    /// Run the link forever: connect, relay, reconnect on any failure.
    ///
    /// Socket errors are observability events, not propagated failures;
    /// there is no backoff growth and no terminal give-up state. Returns
    /// only when the relay side has shut down.
    pub async fn run(mut self) {
        loop {
            match self.connect().await {
                Ok(stream) => {
                    info!(
                        server = %self.config.server,
                        port = self.config.port,
                        tls = self.config.use_tls,
                        "Upstream link established"
                    );
                    if self.events.send(LinkEvent::Connected).await.is_err() {
                        debug!("Supervisor gone, stopping link");
                        return;
                    }
                    match self.session(stream).await {
                        Some(reason) => warn!(?reason, "Upstream session ended"),
                        None => {
                            debug!("Relay side shut down, stopping link");
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, server = %self.config.server, "Upstream connect failed");
                }
            }

            if !self.wait_reconnect().await {
                debug!("Relay side shut down during reconnect wait, stopping link");
                return;
            }
        }
    }

    /// One connection attempt from an immutable config snapshot.
    async fn connect(&self) -> Result<LinkStream, LinkError> {
        let target = (self.config.server.as_str(), self.config.port);
        let addr = tokio::net::lookup_host(target)
            .await?
            .next()
            .ok_or_else(|| {
                LinkError::Resolve(format!("{}:{}", self.config.server, self.config.port))
            })?;

        let tcp = connect_tcp(addr, self.config.local_bind).await?;
        if self.config.use_tls {
            connect_tls(
                tcp,
                &self.config.server,
                self.config.allow_insecure_tls,
                self.config.ca_cert.as_deref(),
            )
            .await
        } else {
            Ok(LinkStream::Plain(tcp))
        }
    }

    /// Session loop for one socket: relay bytes both ways, probe liveness.
    ///
    /// Returns `None` when the relay channels are gone (shutdown), or the
    /// reason the session ended otherwise.
    async fn session(&mut self, stream: LinkStream) -> Option<SessionEnd> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut scanner = LineSplitter::new();
        let mut buf = vec![0u8; 8192];
        let mut pending_pings: u32 = 0;
        let mut deadline = Instant::now() + self.config.idle_timeout;

        let end = loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break SessionEnd::RemoteClosed,
                    Ok(n) => {
                        deadline = Instant::now() + self.config.idle_timeout;
                        scanner.push(&buf[..n]);
                        while let Some(line) = scanner.next_line() {
                            trace!(%line, "Incoming upstream line");
                            if let Some(msg) = Message::parse(&line) {
                                if msg.command == "PONG" {
                                    trace!("Received pong from upstream");
                                    pending_pings = pending_pings.saturating_sub(1);
                                }
                            }
                        }
                        if self.to_relay.send(buf[..n].to_vec()).await.is_err() {
                            return None;
                        }
                    }
                    Err(e) => break SessionEnd::ReadError(e),
                },
                chunk = self.from_relay.recv() => match chunk {
                    Some(chunk) => {
                        trace!(len = chunk.len(), "Outgoing bytes to upstream");
                        deadline = Instant::now() + self.config.idle_timeout;
                        if let Err(e) = writer.write_all(&chunk).await {
                            break SessionEnd::WriteError(e);
                        }
                    }
                    None => return None,
                },
                () = sleep_until(deadline) => {
                    if pending_pings >= 1 {
                        warn!("No pong since last probe, destroying connection");
                        break SessionEnd::PingTimeout;
                    }
                    pending_pings += 1;
                    debug!("Idle timeout, pinging upstream");
                    let ping = Message::new("PING", [unix_millis().to_string()]).to_line();
                    if let Err(e) = writer.write_all(ping.as_bytes()).await {
                        break SessionEnd::WriteError(e);
                    }
                    deadline = Instant::now() + self.config.idle_timeout;
                }
            }
        };
        Some(end)
    }

    /// Sleep out the reconnect delay, draining and discarding outbound
    /// chunks so the relay side never backs up against a dead socket.
    ///
    /// Returns `false` when the relay side has shut down.
    async fn wait_reconnect(&mut self) -> bool {
        debug!(
            delay_ms = self.config.reconnect_delay.as_millis(),
            "Reconnecting after delay"
        );
        let wait = sleep(self.config.reconnect_delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                () = &mut wait => return true,
                chunk = self.from_relay.recv() => match chunk {
                    Some(chunk) => trace!(len = chunk.len(), "Discarding chunk while disconnected"),
                    None => return false,
                },
            }
        }
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
#[path = "link_tests.rs"]
mod tests;
