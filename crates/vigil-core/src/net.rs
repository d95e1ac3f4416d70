//! Relay rendezvous plumbing shared by the sentinel (listen/accept side)
//! and the worker (dial side).
//!
//! The relay is a trusted local byte-stream channel: a Unix domain socket
//! where available, a loopback TCP socket otherwise. Either way the stream
//! is exposed through one unified type so the bridging code is agnostic.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::control::RelayAddress;

/// Unified relay stream type: Unix domain socket or loopback TCP.
pub enum RelayStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Listening side of the relay rendezvous.
pub enum RelayListener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl RelayListener {
    /// Bind the rendezvous for this process: a Unix socket named after our
    /// own PID, or an ephemeral loopback port elsewhere. The returned
    /// address is fixed for the lifetime of the listener.
    pub async fn bind() -> io::Result<(Self, RelayAddress)> {
        #[cfg(unix)]
        {
            let address = RelayAddress::socket_path_for_pid(std::process::id());
            let RelayAddress::Path(path) = &address else {
                unreachable!("socket_path_for_pid returns a path");
            };
            if path.exists() {
                tracing::debug!(path = %path.display(), "Removing stale relay socket");
                std::fs::remove_file(path)?;
            }
            let listener = UnixListener::bind(path)?;
            Ok((Self::Unix(listener), address))
        }
        #[cfg(not(unix))]
        {
            Self::bind_loopback().await
        }
    }

    /// Bind an ephemeral loopback TCP rendezvous.
    pub async fn bind_loopback() -> io::Result<(Self, RelayAddress)> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        Ok((Self::Tcp(listener), RelayAddress::Port(port)))
    }

    /// Accept the next worker connection.
    pub async fn accept(&self) -> io::Result<RelayStream> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(RelayStream::Unix(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(RelayStream::Tcp(stream))
            }
        }
    }
}

/// Dial the relay rendezvous (worker side).
pub async fn connect(address: &RelayAddress) -> io::Result<RelayStream> {
    match address {
        #[cfg(unix)]
        RelayAddress::Path(path) => Ok(RelayStream::Unix(UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        RelayAddress::Path(path) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("Unix socket relay unavailable: {}", path.display()),
        )),
        RelayAddress::Port(port) => Ok(RelayStream::Tcp(
            TcpStream::connect(("127.0.0.1", *port)).await?,
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn loopback_rendezvous_accepts_and_relays() {
        let (listener, address) = RelayListener::bind_loopback().await.unwrap();
        let mut client = connect(&address).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();

        client.write_all(b"NICK vigil\r\n").await.unwrap();
        let mut buf = [0u8; 32];
        let n = accepted.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"NICK vigil\r\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_rendezvous_accepts_and_relays() {
        let (listener, address) = RelayListener::bind().await.unwrap();
        let mut client = connect(&address).await.unwrap();
        let mut accepted = listener.accept().await.unwrap();

        accepted.write_all(b"PING :1\r\n").await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PING :1\r\n");

        if let RelayAddress::Path(path) = address {
            std::fs::remove_file(path).ok();
        }
    }
}
