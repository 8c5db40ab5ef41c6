//! Cell framing
//!
//! Before VERSIONS has been answered every cell uses a 2-byte circuit id.
//! Link protocol 4 and later widen it to 4 bytes. Fixed cells always carry
//! 509 body bytes; VERSIONS and commands >= 128 carry a 2-byte length.

use super::cell::{is_variable_length, Cell, CellBody, CELL_BODY_LEN};
use crate::error::{Result, TorError};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use sha2::{Digest, Sha256};

/// Link version used for framing before negotiation completes
pub const PRE_NEGOTIATION_VERSION: u16 = 0;

const READ_CHUNK: usize = 4096;

/// Width of the circuit id for a link version
pub fn circ_id_len(link_version: u16) -> usize {
    if link_version >= 4 {
        4
    } else {
        2
    }
}

/// Total on-wire size of a fixed cell
pub fn fixed_cell_len(link_version: u16) -> usize {
    circ_id_len(link_version) + 1 + CELL_BODY_LEN
}

/// Serialize a cell for the given link version
pub fn encode_cell(cell: &Cell, link_version: u16) -> Result<Vec<u8>> {
    let command = cell.command();
    let body = cell.body.encode()?;
    let id_len = circ_id_len(link_version);

    let mut out = Vec::with_capacity(fixed_cell_len(link_version));
    if id_len == 4 {
        out.extend_from_slice(&cell.circ_id.to_be_bytes());
    } else {
        let narrow = u16::try_from(cell.circ_id).map_err(|_| {
            TorError::ProtocolError(format!(
                "circuit id {:#x} does not fit a 2-byte header",
                cell.circ_id
            ))
        })?;
        out.extend_from_slice(&narrow.to_be_bytes());
    }
    out.push(command);

    if is_variable_length(command) {
        let len = u16::try_from(body.len())
            .map_err(|_| TorError::ProtocolError("variable cell too long".into()))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&body);
    } else {
        out.extend_from_slice(&body);
        out.resize(fixed_cell_len(link_version), 0);
    }
    Ok(out)
}

/// Try to decode one cell from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the cell and the
/// number of bytes it occupied.
pub fn decode_cell(buf: &[u8], link_version: u16) -> Result<Option<(Cell, usize)>> {
    let id_len = circ_id_len(link_version);
    if buf.len() < id_len + 1 {
        return Ok(None);
    }

    let circ_id = if id_len == 4 {
        u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
    } else {
        u16::from_be_bytes([buf[0], buf[1]]) as u32
    };
    let command = buf[id_len];

    let (body_start, body_len) = if is_variable_length(command) {
        if buf.len() < id_len + 3 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([buf[id_len + 1], buf[id_len + 2]]) as usize;
        (id_len + 3, len)
    } else {
        (id_len + 1, CELL_BODY_LEN)
    };

    let total = body_start + body_len;
    if buf.len() < total {
        return Ok(None);
    }

    let body = CellBody::decode(command, &buf[body_start..total])?;
    Ok(Some((Cell::new(circ_id, body), total)))
}

/// Accumulates partial reads until a whole cell is available.
///
/// The reader does not own the stream, so the link handshake can interleave
/// reads and writes on the same connection before it is split.
#[derive(Debug)]
pub struct CellReader {
    buf: Vec<u8>,
    link_version: u16,
    transcript: Option<Sha256>,
}

impl CellReader {
    pub fn new(link_version: u16) -> Self {
        Self {
            buf: Vec::with_capacity(READ_CHUNK),
            link_version,
            transcript: None,
        }
    }

    pub fn link_version(&self) -> u16 {
        self.link_version
    }

    pub fn set_link_version(&mut self, version: u16) {
        self.link_version = version;
    }

    /// Start hashing every byte of every cell returned from now on
    pub fn record_transcript(&mut self, seed: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        self.transcript = Some(hasher);
    }

    /// Digest of the transcript so far
    pub fn transcript_digest(&self) -> Option<[u8; 32]> {
        self.transcript.as_ref().map(|h| h.clone().finalize().into())
    }

    pub fn stop_transcript(&mut self) {
        self.transcript = None;
    }

    /// Decode a cell from already-buffered bytes, if one is complete
    pub fn try_next(&mut self) -> Result<Option<Cell>> {
        match decode_cell(&self.buf, self.link_version)? {
            Some((cell, used)) => {
                if let Some(t) = self.transcript.as_mut() {
                    t.update(&self.buf[..used]);
                }
                self.buf.drain(..used);
                Ok(Some(cell))
            }
            None => Ok(None),
        }
    }

    /// Read until one complete cell is available
    pub async fn read_cell<R>(&mut self, stream: &mut R) -> Result<Cell>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(cell) = self.try_next()? {
                return Ok(cell);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(TorError::ConnectionClosed(if self.buf.is_empty() {
                    "peer closed the link".into()
                } else {
                    format!("peer closed the link mid-cell ({} bytes buffered)", self.buf.len())
                }));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Write side counterpart of [`CellReader`]
#[derive(Debug)]
pub struct CellWriter {
    link_version: u16,
    transcript: Option<Sha256>,
}

impl CellWriter {
    pub fn new(link_version: u16) -> Self {
        Self {
            link_version,
            transcript: None,
        }
    }

    pub fn link_version(&self) -> u16 {
        self.link_version
    }

    pub fn set_link_version(&mut self, version: u16) {
        self.link_version = version;
    }

    pub fn record_transcript(&mut self, seed: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        self.transcript = Some(hasher);
    }

    pub fn transcript_digest(&self) -> Option<[u8; 32]> {
        self.transcript.as_ref().map(|h| h.clone().finalize().into())
    }

    pub fn stop_transcript(&mut self) {
        self.transcript = None;
    }

    /// Encode and write one whole cell, then flush
    pub async fn write_cell<W>(&mut self, stream: &mut W, cell: &Cell) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let bytes = encode_cell(cell, self.link_version)?;
        if let Some(t) = self.transcript.as_mut() {
            t.update(&bytes);
        }
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        Ok(())
    }
}
