//! TLS links to relays using rustls
//!
//! Relays present self-signed certificates, so the TLS layer accepts any
//! certificate. Authenticity comes from the CERTS cell, which binds the
//! relay's Ed25519 identity to the certificate captured here.

use crate::error::{Result, TorError};
use crate::protocol::relay::Relay;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures_rustls::client::TlsStream;
use futures_rustls::TlsConnector;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

/// Label for the RFC 5705 exporter used by Ed25519 link authentication
pub const TLS_EXPORTER_LABEL: &[u8] = b"EXPORTER FOR TOR TLS CLIENT BINDING AUTH0003";

/// An established, encrypted link to a relay
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// DER encoding of the peer's end-entity certificate
    fn peer_certificate(&self) -> Option<Vec<u8>>;

    /// RFC 5705 keying material bound to this session
    fn export_keying_material(&self, label: &[u8], context: &[u8]) -> Result<[u8; 32]>;
}

/// Opens links to relays
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, relay: &Relay) -> Result<Box<dyn LinkStream>>;
}

/// Certificate verifier that accepts all certificates.
#[derive(Debug)]
struct TorRelayVerifier;

impl ServerCertVerifier for TorRelayVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// rustls session over a tokio TCP socket
pub struct TlsLink {
    inner: TlsStream<Compat<TcpStream>>,
}

impl TlsLink {
    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.inner.get_ref().1.protocol_version()
    }
}

impl LinkStream for TlsLink {
    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.inner
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|c| c.as_ref().to_vec())
    }

    fn export_keying_material(&self, label: &[u8], context: &[u8]) -> Result<[u8; 32]> {
        self.inner
            .get_ref()
            .1
            .export_keying_material([0u8; 32], label, Some(context))
            .map_err(|e| TorError::Crypto(format!("TLS exporter: {}", e)))
    }
}

impl AsyncRead for TlsLink {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsLink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

/// Connects to a relay's OR port over TCP and TLS
#[derive(Clone)]
pub struct TlsRelayConnector {
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl TlsRelayConnector {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| TorError::Config(format!("TLS init failed: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TorRelayVerifier))
        .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            connect_timeout,
        })
    }
}

#[async_trait]
impl RelayConnector for TlsRelayConnector {
    async fn connect(&self, relay: &Relay) -> Result<Box<dyn LinkStream>> {
        let addr = relay.socket_addr();
        log::debug!("🔌 Connecting to {} ({})", relay.nickname, addr);

        let link = tokio::time::timeout(self.connect_timeout, async {
            let tcp = TcpStream::connect(addr)
                .await
                .map_err(|e| TorError::ConnectionFailed(format!("{}: {}", addr, e)))?;
            tcp.set_nodelay(true)?;

            // SNI is irrelevant to relays; the IP address form skips it.
            let server_name = ServerName::IpAddress(addr.ip().into());
            let tls = self
                .connector
                .connect(server_name, tcp.compat())
                .await
                .map_err(|e| TorError::ConnectionFailed(format!("TLS with {}: {}", addr, e)))?;
            Ok::<_, TorError>(TlsLink { inner: tls })
        })
        .await
        .map_err(|_| TorError::Timeout(format!("connecting to {}", addr)))??;

        log::info!(
            "🔒 TLS established with {} ({:?})",
            relay.nickname,
            link.protocol_version()
        );
        Ok(Box::new(link))
    }
}
