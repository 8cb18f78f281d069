//! TLS transport over TCP, using rustls with the ring provider.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Error, Result};
use crate::packet::stream::StreamCodec;
use crate::transport::tcp::{read_stream_frame, write_stream_frame};
use crate::transport::{Link, LinkListener, LinkStatus, Transport};

/// A verifier that accepts any certificate.
///
/// Needed when the switch runs with a self-signed certificate; gated behind
/// the `skip_verify` configuration flag.
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA512,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA384,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

/// TLS byte-stream transport.
pub struct TlsTransport {
    addr: String,
    host: String,
    skip_verify: bool,
    timeout: Duration,
    codec: StreamCodec,
    link: Link,
    reader: Mutex<Option<ReadHalf<TlsStream<TcpStream>>>>,
    writer: Mutex<Option<WriteHalf<TlsStream<TcpStream>>>>,
}

impl TlsTransport {
    /// Create a transport for `host:port`, not yet connected.
    pub fn new(
        addr: impl Into<String>,
        host: impl Into<String>,
        skip_verify: bool,
        timeout: Duration,
        codec: StreamCodec,
    ) -> Self {
        Self {
            addr: addr.into(),
            host: host.into(),
            skip_verify,
            timeout,
            codec,
            link: Link::default(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    fn tls_config(&self) -> Result<ClientConfig> {
        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let config = if self.skip_verify {
            ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|e| Error::Tls(e.to_string()))?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|e| Error::Tls(e.to_string()))?
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        Ok(config)
    }

    async fn open_stream(&self) -> Result<TlsStream<TcpStream>> {
        let tcp = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::connection(format!("TCP connect {}: {e}", self.addr)))?;
        tcp.set_nodelay(true)?;

        let connector = TlsConnector::from(Arc::new(self.tls_config()?));
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| Error::Tls(format!("bad server name {}: {e}", self.host)))?;

        let stream = tokio::time::timeout(self.timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Tls(format!("handshake with {}: {e}", self.addr)))?;
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn connect(&self) -> Result<()> {
        self.link.set_status(LinkStatus::Connecting);
        debug!(addr = %self.addr, host = %self.host, "tls connecting");

        let stream = match self.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                self.link.set_status(LinkStatus::Closed);
                return Err(e);
            }
        };

        let tcp = stream.get_ref().0;
        let local = tcp.local_addr().ok();
        let remote = tcp.peer_addr().ok();
        let (read_half, write_half) = tokio::io::split(stream);
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);

        self.link.mark_connected(local, remote);
        Ok(())
    }

    async fn close(&self) {
        self.reader.lock().await.take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.link.mark_closed();
    }

    async fn read_frame(&self) -> Result<Vec<u8>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::NotConnected)?;
        match read_stream_frame(reader, &self.codec).await {
            Ok(frame) => Ok(frame),
            Err(e) => {
                drop(guard);
                self.link.mark_closed();
                Err(e)
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        match write_stream_frame(writer, frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(guard);
                self.link.mark_closed();
                Err(e)
            }
        }
    }

    fn status(&self) -> LinkStatus {
        self.link.status()
    }

    fn set_status(&self, status: LinkStatus) {
        self.link.set_status(status);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.link.remote_addr()
    }

    fn set_listener(&self, listener: Arc<dyn LinkListener>) {
        self.link.set_listener(listener);
    }
}
