//! Tor cell protocol
//!
//! Typed cell bodies and the relay cell layout. Framing (circuit id width,
//! fixed vs variable length) lives in [`super::codec`] because it depends on
//! the negotiated link version.

use crate::error::{Result, TorError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Body length of a fixed-size cell
pub const CELL_BODY_LEN: usize = 509;

/// An unencrypted or encrypted relay cell body
pub type RelayPayload = Box<[u8; CELL_BODY_LEN]>;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
    CreateFast = 5,
    CreatedFast = 6,
    /// VERSIONS - always variable length, even before negotiation
    Versions = 7,
    Netinfo = 8,
    /// RELAY_EARLY - carries EXTEND2 while the circuit still has budget
    RelayEarly = 9,
    Create2 = 10,
    Created2 = 11,
    PaddingNegotiate = 12,
    Vpadding = 128,
    Certs = 129,
    AuthChallenge = 130,
    Authenticate = 131,
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }
}

/// Whether a command byte is framed with a 2-byte length
pub fn is_variable_length(command: u8) -> bool {
    command == CellCommand::Versions as u8 || command >= 128
}

/// One certificate from a CERTS cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertEntry {
    pub cert_type: u8,
    pub body: Vec<u8>,
}

/// NETINFO body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Netinfo {
    pub timestamp: u32,
    /// The sender's view of the receiver's address
    pub other_addr: Option<IpAddr>,
    /// The sender's own addresses
    pub my_addrs: Vec<IpAddr>,
}

/// A decoded cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub circ_id: u32,
    pub body: CellBody,
}

/// Command-specific cell contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellBody {
    Padding,
    Vpadding(Vec<u8>),
    Versions(Vec<u16>),
    Certs(Vec<CertEntry>),
    AuthChallenge {
        challenge: [u8; 32],
        methods: Vec<u16>,
    },
    Authenticate {
        auth_type: u16,
        auth: Vec<u8>,
    },
    Netinfo(Netinfo),
    Create2 {
        handshake_type: u16,
        handshake: Vec<u8>,
    },
    Created2 {
        handshake: Vec<u8>,
    },
    Relay(RelayPayload),
    RelayEarly(RelayPayload),
    Destroy {
        reason: u8,
    },
    /// Anything we don't interpret; kept so it can be logged and dropped
    Unrecognized {
        command: u8,
        body: Vec<u8>,
    },
}

impl Cell {
    pub fn new(circ_id: u32, body: CellBody) -> Self {
        Self { circ_id, body }
    }

    pub fn command(&self) -> u8 {
        self.body.command()
    }
}

impl CellBody {
    /// Command byte for this body
    pub fn command(&self) -> u8 {
        match self {
            CellBody::Padding => CellCommand::Padding as u8,
            CellBody::Vpadding(_) => CellCommand::Vpadding as u8,
            CellBody::Versions(_) => CellCommand::Versions as u8,
            CellBody::Certs(_) => CellCommand::Certs as u8,
            CellBody::AuthChallenge { .. } => CellCommand::AuthChallenge as u8,
            CellBody::Authenticate { .. } => CellCommand::Authenticate as u8,
            CellBody::Netinfo(_) => CellCommand::Netinfo as u8,
            CellBody::Create2 { .. } => CellCommand::Create2 as u8,
            CellBody::Created2 { .. } => CellCommand::Created2 as u8,
            CellBody::Relay(_) => CellCommand::Relay as u8,
            CellBody::RelayEarly(_) => CellCommand::RelayEarly as u8,
            CellBody::Destroy { .. } => CellCommand::Destroy as u8,
            CellBody::Unrecognized { command, .. } => *command,
        }
    }

    /// Human-readable command name for logs and errors
    pub fn name(&self) -> String {
        match CellCommand::from_u8(self.command()) {
            Some(cmd) => format!("{:?}", cmd),
            None => format!("Unknown({})", self.command()),
        }
    }

    /// Serialize the body. Fixed-size bodies are not padded here.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            CellBody::Padding => {}
            CellBody::Vpadding(bytes) => buf.extend_from_slice(bytes),
            CellBody::Versions(versions) => {
                for v in versions {
                    buf.extend_from_slice(&v.to_be_bytes());
                }
            }
            CellBody::Certs(certs) => {
                buf.push(u8_len(certs.len(), "certificate count")?);
                for cert in certs {
                    buf.push(cert.cert_type);
                    buf.extend_from_slice(&u16_len(cert.body.len(), "certificate")?.to_be_bytes());
                    buf.extend_from_slice(&cert.body);
                }
            }
            CellBody::AuthChallenge { challenge, methods } => {
                buf.extend_from_slice(challenge);
                buf.extend_from_slice(&u16_len(methods.len(), "auth methods")?.to_be_bytes());
                for m in methods {
                    buf.extend_from_slice(&m.to_be_bytes());
                }
            }
            CellBody::Authenticate { auth_type, auth } => {
                buf.extend_from_slice(&auth_type.to_be_bytes());
                buf.extend_from_slice(&u16_len(auth.len(), "authenticator")?.to_be_bytes());
                buf.extend_from_slice(auth);
            }
            CellBody::Netinfo(info) => {
                buf.extend_from_slice(&info.timestamp.to_be_bytes());
                match info.other_addr {
                    Some(addr) => write_netinfo_addr(&mut buf, &addr),
                    None => buf.extend_from_slice(&[0, 0]),
                }
                buf.push(u8_len(info.my_addrs.len(), "netinfo addresses")?);
                for addr in &info.my_addrs {
                    write_netinfo_addr(&mut buf, addr);
                }
            }
            CellBody::Create2 {
                handshake_type,
                handshake,
            } => {
                buf.extend_from_slice(&handshake_type.to_be_bytes());
                buf.extend_from_slice(&u16_len(handshake.len(), "CREATE2 handshake")?.to_be_bytes());
                buf.extend_from_slice(handshake);
            }
            CellBody::Created2 { handshake } => {
                buf.extend_from_slice(&u16_len(handshake.len(), "CREATED2 handshake")?.to_be_bytes());
                buf.extend_from_slice(handshake);
            }
            CellBody::Relay(payload) | CellBody::RelayEarly(payload) => {
                buf.extend_from_slice(&payload[..]);
            }
            CellBody::Destroy { reason } => buf.push(*reason),
            CellBody::Unrecognized { body, .. } => buf.extend_from_slice(body),
        }

        if !is_variable_length(self.command()) && buf.len() > CELL_BODY_LEN {
            return Err(TorError::ProtocolError(format!(
                "{} body is {} bytes, limit is {}",
                self.name(),
                buf.len(),
                CELL_BODY_LEN
            )));
        }
        Ok(buf)
    }

    /// Parse a body for the given command byte
    pub fn decode(command: u8, body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let parsed = match CellCommand::from_u8(command) {
            Some(CellCommand::Padding) => CellBody::Padding,
            Some(CellCommand::Vpadding) => CellBody::Vpadding(body.to_vec()),
            Some(CellCommand::Versions) => {
                if body.len() % 2 != 0 {
                    return Err(TorError::ProtocolError(
                        "VERSIONS body has odd length".into(),
                    ));
                }
                CellBody::Versions(
                    body.chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
            Some(CellCommand::Certs) => {
                let n = r.u8()?;
                let mut certs = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let cert_type = r.u8()?;
                    let len = r.u16()? as usize;
                    certs.push(CertEntry {
                        cert_type,
                        body: r.take(len)?.to_vec(),
                    });
                }
                CellBody::Certs(certs)
            }
            Some(CellCommand::AuthChallenge) => {
                let challenge = r.array::<32>()?;
                let n = r.u16()?;
                let mut methods = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    methods.push(r.u16()?);
                }
                CellBody::AuthChallenge { challenge, methods }
            }
            Some(CellCommand::Authenticate) => {
                let auth_type = r.u16()?;
                let len = r.u16()? as usize;
                CellBody::Authenticate {
                    auth_type,
                    auth: r.take(len)?.to_vec(),
                }
            }
            Some(CellCommand::Netinfo) => {
                let timestamp = r.u32()?;
                let other_addr = read_netinfo_addr(&mut r)?;
                let n = r.u8()?;
                let mut my_addrs = Vec::new();
                for _ in 0..n {
                    if let Some(addr) = read_netinfo_addr(&mut r)? {
                        my_addrs.push(addr);
                    }
                }
                CellBody::Netinfo(Netinfo {
                    timestamp,
                    other_addr,
                    my_addrs,
                })
            }
            Some(CellCommand::Create2) => {
                let handshake_type = r.u16()?;
                let len = r.u16()? as usize;
                CellBody::Create2 {
                    handshake_type,
                    handshake: r.take(len)?.to_vec(),
                }
            }
            Some(CellCommand::Created2) => {
                let len = r.u16()? as usize;
                CellBody::Created2 {
                    handshake: r.take(len)?.to_vec(),
                }
            }
            Some(CellCommand::Relay) => CellBody::Relay(relay_payload(body)?),
            Some(CellCommand::RelayEarly) => CellBody::RelayEarly(relay_payload(body)?),
            Some(CellCommand::Destroy) => CellBody::Destroy { reason: r.u8()? },
            _ => CellBody::Unrecognized {
                command,
                body: body.to_vec(),
            },
        };
        Ok(parsed)
    }
}

fn relay_payload(body: &[u8]) -> Result<RelayPayload> {
    let arr: [u8; CELL_BODY_LEN] = body
        .get(..CELL_BODY_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TorError::ProtocolError("relay cell body truncated".into()))?;
    Ok(Box::new(arr))
}

fn write_netinfo_addr(buf: &mut Vec<u8>, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            buf.extend_from_slice(&[0x04, 4]);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.extend_from_slice(&[0x06, 16]);
            buf.extend_from_slice(&v6.octets());
        }
    }
}

fn read_netinfo_addr(r: &mut Reader<'_>) -> Result<Option<IpAddr>> {
    let atype = r.u8()?;
    let len = r.u8()? as usize;
    let value = r.take(len)?;
    Ok(match (atype, len) {
        (0x04, 4) => Some(IpAddr::V4(Ipv4Addr::new(
            value[0], value[1], value[2], value[3],
        ))),
        (0x06, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(value);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    })
}

fn u8_len(len: usize, what: &str) -> Result<u8> {
    u8::try_from(len).map_err(|_| TorError::ProtocolError(format!("too many {}", what)))
}

fn u16_len(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len).map_err(|_| TorError::ProtocolError(format!("{} too long", what)))
}

/// Bounds-checked big-endian cursor over a byte slice
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                TorError::ParseError(format!(
                    "need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.data.len()
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Sendme = 5,
    Extend = 6,
    Extended = 7,
    Truncate = 8,
    Truncated = 9,
    /// DROP - long-range padding, discarded by the receiver
    Drop = 10,
    Resolve = 11,
    Resolved = 12,
    BeginDir = 13,
    Extend2 = 14,
    Extended2 = 15,
    EstablishIntro = 32,
    EstablishRendezvous = 33,
    Introduce1 = 34,
    Introduce2 = 35,
    Rendezvous1 = 36,
    Rendezvous2 = 37,
    IntroEstablished = 38,
    RendezvousEstablished = 39,
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            32 => Some(RelayCommand::EstablishIntro),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            35 => Some(RelayCommand::Introduce2),
            36 => Some(RelayCommand::Rendezvous1),
            37 => Some(RelayCommand::Rendezvous2),
            38 => Some(RelayCommand::IntroEstablished),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }
}

/// Offsets inside a relay cell body
pub const RELAY_RECOGNIZED_OFFSET: usize = 1;
pub const RELAY_STREAM_ID_OFFSET: usize = 3;
pub const RELAY_DIGEST_OFFSET: usize = 5;
pub const RELAY_LENGTH_OFFSET: usize = 9;
pub const RELAY_HEADER_LEN: usize = 11;

/// Plaintext relay cell (payload within a RELAY or RELAY_EARLY cell)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    pub command: RelayCommand,
    pub stream_id: u16,
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Maximum data size in relay cell
    pub const MAX_DATA_SIZE: usize = CELL_BODY_LEN - RELAY_HEADER_LEN;

    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            stream_id,
            data,
        }
    }

    /// Lay the cell out with `recognized` and digest zeroed, ready for
    /// [`crate::protocol::crypto::originate`]
    pub fn to_payload(&self) -> Result<RelayPayload> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::ProtocolError(format!(
                "relay data is {} bytes, limit is {}",
                self.data.len(),
                Self::MAX_DATA_SIZE
            )));
        }
        let mut payload = Box::new([0u8; CELL_BODY_LEN]);
        payload[0] = self.command as u8;
        payload[RELAY_STREAM_ID_OFFSET..RELAY_STREAM_ID_OFFSET + 2]
            .copy_from_slice(&self.stream_id.to_be_bytes());
        payload[RELAY_LENGTH_OFFSET..RELAY_HEADER_LEN]
            .copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        payload[RELAY_HEADER_LEN..RELAY_HEADER_LEN + self.data.len()].copy_from_slice(&self.data);
        Ok(payload)
    }

    /// Parse a recognized (fully decrypted) relay body
    pub fn from_payload(payload: &[u8; CELL_BODY_LEN]) -> Result<Self> {
        let command = RelayCommand::from_u8(payload[0]).ok_or_else(|| {
            TorError::ProtocolError(format!("Unknown relay command: {}", payload[0]))
        })?;
        let stream_id = u16::from_be_bytes([
            payload[RELAY_STREAM_ID_OFFSET],
            payload[RELAY_STREAM_ID_OFFSET + 1],
        ]);
        let length = u16::from_be_bytes([
            payload[RELAY_LENGTH_OFFSET],
            payload[RELAY_LENGTH_OFFSET + 1],
        ]) as usize;
        if length > Self::MAX_DATA_SIZE {
            return Err(TorError::ProtocolError(format!(
                "relay length {} exceeds {}",
                length,
                Self::MAX_DATA_SIZE
            )));
        }
        Ok(Self {
            command,
            stream_id,
            data: payload[RELAY_HEADER_LEN..RELAY_HEADER_LEN + length].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_length_commands() {
        assert!(is_variable_length(CellCommand::Versions as u8));
        assert!(is_variable_length(CellCommand::Certs as u8));
        assert!(is_variable_length(200));
        assert!(!is_variable_length(CellCommand::Relay as u8));
        assert!(!is_variable_length(CellCommand::Netinfo as u8));
    }

    #[test]
    fn test_netinfo_body() {
        let body = CellBody::Netinfo(Netinfo {
            timestamp: 1_700_000_000,
            other_addr: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            my_addrs: vec![
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
        });
        let bytes = body.encode().unwrap();
        assert_eq!(&bytes[4..6], &[0x04, 4]);
        assert_eq!(CellBody::decode(CellCommand::Netinfo as u8, &bytes).unwrap(), body);
    }

    #[test]
    fn test_netinfo_skips_unknown_address_types() {
        let mut bytes = vec![0, 0, 0, 1];
        bytes.extend_from_slice(&[0xf0, 2, 0xaa, 0xbb]);
        bytes.push(1);
        bytes.extend_from_slice(&[0x04, 4, 127, 0, 0, 1]);
        match CellBody::decode(CellCommand::Netinfo as u8, &bytes).unwrap() {
            CellBody::Netinfo(info) => {
                assert_eq!(info.other_addr, None);
                assert_eq!(info.my_addrs, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_truncated_create2_rejected() {
        let mut bytes = vec![0x00, 0x02, 0x00, 84];
        bytes.extend_from_slice(&[0u8; 10]);
        assert!(CellBody::decode(CellCommand::Create2 as u8, &bytes).is_err());
    }

    #[test]
    fn test_oversized_fixed_body_rejected() {
        let body = CellBody::Create2 {
            handshake_type: 2,
            handshake: vec![0u8; 600],
        };
        assert!(body.encode().is_err());
    }

    #[test]
    fn test_relay_cell_layout() {
        let relay = RelayCell::new(RelayCommand::Begin, 100, vec![5, 6, 7]);
        let payload = relay.to_payload().unwrap();
        assert_eq!(payload[0], RelayCommand::Begin as u8);
        assert_eq!(&payload[1..3], &[0, 0]);
        assert_eq!(&payload[3..5], &100u16.to_be_bytes());
        assert_eq!(&payload[5..9], &[0, 0, 0, 0]);
        assert_eq!(&payload[9..11], &3u16.to_be_bytes());

        let parsed = RelayCell::from_payload(&payload).unwrap();
        assert_eq!(parsed, relay);
    }

    #[test]
    fn test_relay_cell_limits() {
        let too_big = RelayCell::new(RelayCommand::Data, 1, vec![0u8; RelayCell::MAX_DATA_SIZE + 1]);
        assert!(too_big.to_payload().is_err());

        let mut payload = [0u8; CELL_BODY_LEN];
        payload[0] = RelayCommand::Data as u8;
        payload[9..11].copy_from_slice(&600u16.to_be_bytes());
        assert!(RelayCell::from_payload(&payload).is_err());

        payload[0] = 0xee;
        payload[9..11].copy_from_slice(&0u16.to_be_bytes());
        assert!(RelayCell::from_payload(&payload).is_err());
    }
}
