//! TCP and TLS transport for the upstream link.
//!
//! Plain and TLS connections are unified behind one stream type so the link
//! session loop does not care which is in use. TLS uses rustls with webpki
//! trust anchors, optionally extended by an operator-supplied CA file;
//! verification can be disabled outright for self-signed upstreams.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::link::LinkError;

/// Unified upstream stream type: plain TCP or TLS over TCP.
pub enum LinkStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for LinkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LinkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Open a TCP connection, optionally bound to a local address.
pub async fn connect_tcp(
    addr: SocketAddr,
    local_bind: Option<IpAddr>,
) -> Result<TcpStream, LinkError> {
    let stream = match local_bind {
        Some(local) => {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(local, 0))?;
            debug!(%local, "Bound local address for upstream connection");
            socket.connect(addr).await?
        }
        None => TcpStream::connect(addr).await?,
    };
    Ok(stream)
}

/// Wrap an established TCP stream in TLS.
pub async fn connect_tls(
    stream: TcpStream,
    server: &str,
    allow_insecure: bool,
    ca_cert: Option<&Path>,
) -> Result<LinkStream, LinkError> {
    let config = client_config(allow_insecure, ca_cert)?;
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(server.to_owned())
        .map_err(|_| LinkError::Tls(format!("Invalid server name: {server}")))?;
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| LinkError::Tls(format!("TLS handshake with {server} failed: {e}")))?;
    Ok(LinkStream::Tls(Box::new(tls_stream)))
}

/// Build the rustls client configuration.
fn client_config(allow_insecure: bool, ca_cert: Option<&Path>) -> Result<ClientConfig, LinkError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    if allow_insecure {
        warn!("TLS peer verification disabled (allow_insecure_tls)");
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(insecure::NoVerification::new()))
            .with_no_client_auth();
        return Ok(config);
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = ca_cert {
        let pem = std::fs::read(path).map_err(|e| {
            LinkError::Tls(format!("Failed to read CA cert {}: {}", path.display(), e))
        })?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| {
                LinkError::Tls(format!("Failed to parse CA cert {}: {}", path.display(), e))
            })?;
            roots.add(cert).map_err(|e| {
                LinkError::Tls(format!("Rejected CA cert {}: {}", path.display(), e))
            })?;
        }
        debug!(ca_cert = %path.display(), "Loaded additional trust anchors");
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Certificate verifier that accepts any peer, for `allow_insecure_tls`.
mod insecure {
    use rustls::DigitallySignedStruct;
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    /// Skips certificate chain and hostname checks; signatures are still
    /// verified against whatever certificate the peer presented.
    #[derive(Debug)]
    pub struct NoVerification {
        provider: CryptoProvider,
    }

    impl NoVerification {
        pub fn new() -> Self {
            Self {
                provider: rustls::crypto::ring::default_provider(),
            }
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
