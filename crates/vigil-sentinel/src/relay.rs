//! Local relay transport.
//!
//! An address-stable rendezvous bridging the link's byte stream to
//! whichever worker is currently connected. The listener lives for the
//! sentinel's entire lifetime; at most one accepted connection matters at
//! a time and a newly accepted one replaces the previous outright.
//!
//! Each connection is bridged as two independent one-directional legs
//! with independent termination: end-of-stream on the worker side stops
//! only the read leg, a write failure stops only the write leg. Neither
//! ever propagates across the seam to the link.

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use vigil_core::net::{RelayListener, RelayStream};

/// One accepted worker connection with per-leg liveness.
struct Conn {
    reader: ReadHalf<RelayStream>,
    writer: WriteHalf<RelayStream>,
    read_open: bool,
    write_open: bool,
}

impl Conn {
    fn new(stream: RelayStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            read_open: true,
            write_open: true,
        }
    }
}

/// The relay transport task.
pub struct Relay {
    listener: RelayListener,
    /// Inbound link bytes, towards the current worker connection.
    from_link: mpsc::Receiver<Vec<u8>>,
    /// Bytes from the current worker connection, towards the link.
    to_link: mpsc::Sender<Vec<u8>>,
}

impl Relay {
    pub fn new(
        listener: RelayListener,
        from_link: mpsc::Receiver<Vec<u8>>,
        to_link: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            listener,
            from_link,
            to_link,
        }
    }

    /// Run the relay until the link side shuts down.
    pub async fn run(mut self) {
        let mut buf = vec![0u8; 8192];

        // No worker connected yet: drain link bytes so the link never
        // backs up, and wait for the first accept.
        let mut conn = loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => break Conn::new(stream),
                    Err(e) => warn!(error = %e, "Relay accept failed"),
                },
                chunk = self.from_link.recv() => match chunk {
                    Some(chunk) => trace!(len = chunk.len(), "No worker connected, dropping chunk"),
                    None => {
                        debug!("Link side gone, relay stopping");
                        return;
                    }
                },
            }
        };
        debug!("Worker connected to relay");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => {
                        debug!("New worker connection, abandoning stale one");
                        conn = Conn::new(stream);
                    }
                    Err(e) => warn!(error = %e, "Relay accept failed"),
                },
                chunk = self.from_link.recv() => match chunk {
                    Some(chunk) => {
                        if conn.write_open {
                            if let Err(e) = conn.writer.write_all(&chunk).await {
                                debug!(error = %e, "Relay write leg closed");
                                conn.write_open = false;
                            }
                        } else {
                            trace!(len = chunk.len(), "Write leg closed, dropping chunk");
                        }
                    }
                    None => {
                        debug!("Link side gone, relay stopping");
                        return;
                    }
                },
                read = conn.reader.read(&mut buf), if conn.read_open => match read {
                    Ok(0) => {
                        debug!("Worker closed its relay write side");
                        conn.read_open = false;
                    }
                    Ok(n) => {
                        if self.to_link.send(buf[..n].to_vec()).await.is_err() {
                            debug!("Link side gone, relay stopping");
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "Relay read leg closed");
                        conn.read_open = false;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
