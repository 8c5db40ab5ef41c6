//! In-process links over `tokio::io::duplex`
//!
//! Used to run the engine against a relay living in the same process. The
//! "TLS" certificate is a fixed byte string and exporter output is an HMAC
//! of a shared secret, so both ends agree without a real TLS session.

use super::tls::LinkStream;
use crate::error::{Result, TorError};
use futures::io::{AsyncRead, AsyncWrite};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::DuplexStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

/// Buffer size of each duplex direction
const DUPLEX_BUFFER: usize = 64 * 1024;

pub struct MemoryLink<S> {
    inner: S,
    peer_certificate: Option<Vec<u8>>,
    exporter_secret: [u8; 32],
}

impl<S> MemoryLink<S> {
    pub fn new(inner: S, peer_certificate: Option<Vec<u8>>, exporter_secret: [u8; 32]) -> Self {
        Self {
            inner,
            peer_certificate,
            exporter_secret,
        }
    }

    /// Exporter output both ends of a memory link derive
    pub fn exporter(secret: &[u8; 32], label: &[u8], context: &[u8]) -> Result<[u8; 32]> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret)
            .map_err(|_| TorError::Crypto("HMAC key rejected".into()))?;
        mac.update(label);
        mac.update(context);
        Ok(mac.finalize().into_bytes().into())
    }
}

/// A connected client link and the raw peer end
pub fn memory_link_pair(
    peer_certificate: Vec<u8>,
    exporter_secret: [u8; 32],
) -> (MemoryLink<Compat<DuplexStream>>, Compat<DuplexStream>) {
    let (client, relay) = tokio::io::duplex(DUPLEX_BUFFER);
    (
        MemoryLink::new(client.compat(), Some(peer_certificate), exporter_secret),
        relay.compat(),
    )
}

impl<S> LinkStream for MemoryLink<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.peer_certificate.clone()
    }

    fn export_keying_material(&self, label: &[u8], context: &[u8]) -> Result<[u8; 32]> {
        Self::exporter(&self.exporter_secret, label, context)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MemoryLink<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MemoryLink<S> {
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
