//! Per-call connections to the destination
//!
//! Every round trip opens its own connection (plain TCP or TLS), writes the
//! request, reads one response and drops the connection. A peer hanging up
//! at any point is a normal completion, not an error.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::response;

const READ_CHUNK: usize = 8 * 1024;

/// An open connection to the destination
pub(crate) enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_flush(cx),
            Connection::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Opens connections to one destination
pub(crate) struct Connector {
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
    connect_timeout: Option<Duration>,
    timeout: Option<Duration>,
    max_response_size: usize,
}

impl Connector {
    pub fn new(endpoint: &Endpoint, config: &ClientConfig) -> Self {
        Self {
            host: endpoint.connect_host().to_string(),
            port: endpoint.port(),
            tls: endpoint.use_tls().then(|| tls_connector(config.tls_verify)),
            connect_timeout: config.connect_timeout(),
            timeout: config.timeout(),
            max_response_size: config.max_response_size,
        }
    }

    fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Connect, and complete the TLS handshake if needed
    ///
    /// `Ok(None)` means the peer hung up during the handshake.
    async fn connect(&self) -> Result<Option<Connection>> {
        let at = self.connect_timeout.map(|t| Instant::now() + t);

        let stream = deadline(at, TcpStream::connect((self.host.as_str(), self.port)))
            .await?
            .map_err(|source| Error::Connect { addr: self.addr(), source })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(addr = %self.addr(), "Failed to set TCP_NODELAY: {}", e);
        }

        let connector = match &self.tls {
            Some(connector) => connector,
            None => return Ok(Some(Connection::Plain(stream))),
        };

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| Error::Tls(format!("invalid server name {}: {}", self.host, e)))?;

        match deadline(at, connector.connect(server_name, stream)).await? {
            Ok(tls) => Ok(Some(Connection::Tls(Box::new(tls)))),
            Err(e) if is_disconnect(&e) => Ok(None),
            Err(e) => Err(Error::Tls(format!("handshake with {} failed: {}", self.addr(), e))),
        }
    }

    /// Write `request` on a fresh connection and read back one response
    ///
    /// Reading stops at the response's framing boundary, when the peer
    /// closes, or once `max_response_size` bytes are buffered. If the
    /// deadline passes after part of the response arrived, that part is
    /// returned.
    pub async fn round_trip(&self, call: u64, request: &[u8], is_head: bool) -> Result<Vec<u8>> {
        let mut conn = match self.connect().await? {
            Some(conn) => conn,
            None => {
                debug!(call, addr = %self.addr(), "Peer closed during TLS handshake");
                return Ok(Vec::new());
            }
        };
        let at = self.timeout.map(|t| Instant::now() + t);

        let write = async {
            conn.write_all(request).await?;
            conn.flush().await?;
            Ok::<_, io::Error>(())
        };
        match deadline(at, write).await? {
            Ok(()) => {}
            Err(e) if is_disconnect(&e) => {
                debug!(call, addr = %self.addr(), "Peer closed before request was written: {}", e);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        }

        let mut response = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = match deadline(at, conn.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) if is_disconnect(&e) => {
                    debug!(call, addr = %self.addr(), "Peer disconnected: {}", e);
                    break;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(Error::Timeout) if !response.is_empty() => {
                    warn!(
                        call,
                        bytes = response.len(),
                        "Timed out mid-response, keeping what arrived"
                    );
                    break;
                }
                Err(e) => return Err(e),
            };
            response.extend_from_slice(&chunk[..n]);

            if let Some(len) = response::message_len(&response, is_head) {
                response.truncate(len);
                break;
            }
            if response.len() >= self.max_response_size {
                warn!(call, limit = self.max_response_size, "Response too large, truncating");
                response.truncate(self.max_response_size);
                break;
            }
        }

        Ok(response)
    }
}

/// Resolve `fut` unless the deadline passes first
async fn deadline<F: Future>(at: Option<Instant>, fut: F) -> Result<F::Output> {
    match at {
        Some(at) => timeout_at(at, fut).await.map_err(|_| Error::Timeout),
        None => Ok(fut.await),
    }
}

/// Errors that mean the peer went away rather than something broke
fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

fn tls_connector(verify: bool) -> TlsConnector {
    let config = if verify {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerification))
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

/// Accepts any server certificate
#[derive(Debug)]
struct NoServerVerification;

impl rustls::client::danger::ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_kinds() {
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_disconnect(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn test_connector_uses_tls_for_https() {
        let config = ClientConfig::default();
        let plain = Connector::new(&Endpoint::resolve("example.com"), &config);
        assert!(plain.tls.is_none());
        assert_eq!(plain.addr(), "example.com:80");

        let tls = Connector::new(&Endpoint::resolve("https://[::1]:8443"), &config);
        assert!(tls.tls.is_some());
        assert_eq!(tls.addr(), "[::1]:8443");
    }
}
