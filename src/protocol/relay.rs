//! Relay records and link specifiers
//!
//! A [`Relay`] is immutable once loaded. Circuits hold `Arc<Relay>` and never
//! modify them. Directory collaborators hand relays over either directly or
//! as serde [`RelayDescriptor`]s with hex/base64 encoded keys.

use super::cell::Reader;
use crate::error::{Result, TorError};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// A relay usable as a circuit hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relay {
    pub nickname: String,
    /// SHA-1 of the RSA identity key
    pub identity: [u8; 20],
    /// Curve25519 ntor onion key
    pub ntor_onion_key: [u8; 32],
    pub address: Ipv4Addr,
    pub or_port: u16,
    pub dir_port: u16,
    pub flags: RelayFlags,
    /// Ed25519 master identity, when the directory supplied it
    pub ed25519_identity: Option<[u8; 32]>,
}

impl Relay {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.or_port))
    }

    /// Short printable identity for logs
    pub fn short_id(&self) -> String {
        hex::encode(&self.identity[..4])
    }

    pub fn fingerprint(&self) -> String {
        hex::encode_upper(self.identity)
    }

    /// Usable as any hop
    pub fn is_suitable(&self) -> bool {
        self.flags.running && self.flags.valid
    }

    /// Link specifiers an EXTEND2 cell carries for this relay
    pub fn link_specifiers(&self) -> Vec<LinkSpecifier> {
        let mut specs = vec![
            LinkSpecifier::Ipv4 {
                address: self.address,
                port: self.or_port,
            },
            LinkSpecifier::LegacyId(self.identity),
        ];
        if let Some(ed) = self.ed25519_identity {
            specs.push(LinkSpecifier::Ed25519Id(ed));
        }
        specs
    }

    /// Rebuild a relay from the link specifiers and onion key a peer sent us
    /// (INTRODUCE2 rendezvous point)
    pub fn from_link_specifiers(specs: &[LinkSpecifier], ntor_onion_key: [u8; 32]) -> Result<Self> {
        let mut addr = None;
        let mut identity = None;
        let mut ed25519_identity = None;
        for spec in specs {
            match spec {
                LinkSpecifier::Ipv4 { address, port } => addr = Some((*address, *port)),
                LinkSpecifier::LegacyId(id) => identity = Some(*id),
                LinkSpecifier::Ed25519Id(id) => ed25519_identity = Some(*id),
                LinkSpecifier::Unrecognized { .. } => {}
            }
        }
        let (address, or_port) =
            addr.ok_or_else(|| TorError::InvalidRelay("no IPv4 link specifier".into()))?;
        let identity =
            identity.ok_or_else(|| TorError::InvalidRelay("no legacy identity link specifier".into()))?;

        Ok(Relay {
            nickname: format!("${}", hex::encode_upper(identity)),
            identity,
            ntor_onion_key,
            address,
            or_port,
            dir_port: 0,
            flags: RelayFlags {
                running: true,
                valid: true,
                ..Default::default()
            },
            ed25519_identity,
        })
    }
}

/// Relay flags from the consensus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayFlags {
    pub exit: bool,
    pub fast: bool,
    pub guard: bool,
    pub hs_dir: bool,
    pub running: bool,
    pub stable: bool,
    pub valid: bool,
}

impl RelayFlags {
    /// Parse flags from a consensus "s" line
    pub fn from_string(flags: &str) -> Self {
        let mut relay_flags = RelayFlags::default();
        for flag in flags.split_whitespace() {
            match flag {
                "Exit" => relay_flags.exit = true,
                "Fast" => relay_flags.fast = true,
                "Guard" => relay_flags.guard = true,
                "HSDir" => relay_flags.hs_dir = true,
                "Running" => relay_flags.running = true,
                "Stable" => relay_flags.stable = true,
                "Valid" => relay_flags.valid = true,
                _ => {}
            }
        }
        relay_flags
    }
}

/// Relay record as supplied by a directory collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayDescriptor {
    pub nickname: String,
    /// 40 hex characters
    pub fingerprint: String,
    /// base64, padded or not
    pub ntor_onion_key: String,
    pub address: Ipv4Addr,
    pub or_port: u16,
    #[serde(default)]
    pub dir_port: u16,
    /// Space separated consensus flags
    #[serde(default)]
    pub flags: String,
    /// base64 Ed25519 identity
    #[serde(default)]
    pub ed25519_identity: Option<String>,
}

fn decode_b64_32(field: &str, value: &str) -> Result<[u8; 32]> {
    let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| TorError::InvalidRelay(format!("{}: {}", field, e)))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| TorError::InvalidRelay(format!("{} must decode to 32 bytes", field)))
}

impl TryFrom<RelayDescriptor> for Relay {
    type Error = TorError;

    fn try_from(desc: RelayDescriptor) -> Result<Self> {
        let id_bytes = hex::decode(&desc.fingerprint)
            .map_err(|e| TorError::InvalidRelay(format!("fingerprint: {}", e)))?;
        let identity = <[u8; 20]>::try_from(id_bytes.as_slice())
            .map_err(|_| TorError::InvalidRelay("fingerprint must be 20 bytes".into()))?;

        let ed25519_identity = desc
            .ed25519_identity
            .as_deref()
            .map(|v| decode_b64_32("ed25519_identity", v))
            .transpose()?;

        Ok(Relay {
            nickname: desc.nickname,
            identity,
            ntor_onion_key: decode_b64_32("ntor_onion_key", &desc.ntor_onion_key)?,
            address: desc.address,
            or_port: desc.or_port,
            dir_port: desc.dir_port,
            flags: RelayFlags::from_string(&desc.flags),
            ed25519_identity,
        })
    }
}

/// EXTEND2 / INTRODUCE link specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpecifier {
    /// type 0, 6 bytes
    Ipv4 { address: Ipv4Addr, port: u16 },
    /// type 2, 20 bytes
    LegacyId([u8; 20]),
    /// type 3, 32 bytes
    Ed25519Id([u8; 32]),
    Unrecognized { ls_type: u8, body: Vec<u8> },
}

impl LinkSpecifier {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            LinkSpecifier::Ipv4 { address, port } => {
                out.extend_from_slice(&[0, 6]);
                out.extend_from_slice(&address.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpecifier::LegacyId(id) => {
                out.extend_from_slice(&[2, 20]);
                out.extend_from_slice(id);
            }
            LinkSpecifier::Ed25519Id(id) => {
                out.extend_from_slice(&[3, 32]);
                out.extend_from_slice(id);
            }
            LinkSpecifier::Unrecognized { ls_type, body } => {
                out.push(*ls_type);
                out.push(body.len() as u8);
                out.extend_from_slice(body);
            }
        }
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let ls_type = r.u8()?;
        let len = r.u8()? as usize;
        let body = r.take(len)?;
        Ok(match (ls_type, len) {
            (0, 6) => LinkSpecifier::Ipv4 {
                address: Ipv4Addr::new(body[0], body[1], body[2], body[3]),
                port: u16::from_be_bytes([body[4], body[5]]),
            },
            (2, 20) => {
                let mut id = [0u8; 20];
                id.copy_from_slice(body);
                LinkSpecifier::LegacyId(id)
            }
            (3, 32) => {
                let mut id = [0u8; 32];
                id.copy_from_slice(body);
                LinkSpecifier::Ed25519Id(id)
            }
            (0, _) | (2, _) | (3, _) => {
                return Err(TorError::ParseError(format!(
                    "link specifier type {} has bad length {}",
                    ls_type, len
                )))
            }
            _ => LinkSpecifier::Unrecognized {
                ls_type,
                body: body.to_vec(),
            },
        })
    }
}

/// NSPEC | specifiers
pub fn encode_link_specifiers(specs: &[LinkSpecifier], out: &mut Vec<u8>) {
    out.push(specs.len() as u8);
    for spec in specs {
        spec.encode(out);
    }
}

pub(crate) fn decode_link_specifiers(r: &mut Reader<'_>) -> Result<Vec<LinkSpecifier>> {
    let n = r.u8()?;
    (0..n).map(|_| LinkSpecifier::decode(r)).collect()
}
