//! Link handshake
//!
//! Runs on a freshly connected [`LinkStream`] before it is split:
//!
//! 1. VERSIONS both ways (2-byte circuit ids), pick the highest common one
//! 2. CERTS from the relay, verified against the TLS certificate
//! 3. AUTH_CHALLENGE from the relay
//! 4. optionally our CERTS + AUTHENTICATE, when credentials are configured
//! 5. NETINFO from the relay, then ours

use super::cell::{Cell, CellBody, CertEntry, Netinfo};
use super::certs::{now_hours, verify_relay_certs, CertsCell, VerifiedRelay};
use super::codec::{CellReader, CellWriter, PRE_NEGOTIATION_VERSION};
use super::relay::Relay;
use crate::config::EngineConfig;
use crate::error::{Result, TorError};
use crate::network::{LinkStream, TLS_EXPORTER_LABEL};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Ed25519-SHA256-RFC5705 link authentication
pub const AUTH_METHOD_ED25519: u16 = 3;
const AUTH_TYPE_TAG: &[u8; 8] = b"AUTH0003";

/// Long-term identity used to authenticate the initiator side of a link
pub trait LinkCredentials: Send + Sync {
    /// Certificates for our CERTS cell
    fn certs(&self) -> Vec<CertEntry>;

    /// SHA-256 of our RSA identity key
    fn rsa_identity_digest(&self) -> [u8; 32];

    fn ed25519_identity(&self) -> [u8; 32];

    /// Sign with the link authentication key certified in [`Self::certs`]
    fn sign_authenticate(&self, message: &[u8]) -> Result<[u8; 64]>;
}

/// The fields of an AUTH0003 authenticator, excluding the signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTranscript {
    pub cid: [u8; 32],
    pub sid: [u8; 32],
    pub cid_ed: [u8; 32],
    pub sid_ed: [u8; 32],
    /// SHA-256 of everything the relay sent
    pub slog: [u8; 32],
    /// SHA-256 of everything we sent
    pub clog: [u8; 32],
    pub scert: [u8; 32],
    pub tls_secrets: [u8; 32],
    pub rand: [u8; 24],
}

impl AuthTranscript {
    /// Bytes covered by the signature
    pub fn signed_part(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 32 * 8 + 24);
        out.extend_from_slice(AUTH_TYPE_TAG);
        for field in [
            &self.cid,
            &self.sid,
            &self.cid_ed,
            &self.sid_ed,
            &self.slog,
            &self.clog,
            &self.scert,
            &self.tls_secrets,
        ] {
            out.extend_from_slice(field);
        }
        out.extend_from_slice(&self.rand);
        out
    }

    pub fn authenticator(&self, signature: &[u8; 64]) -> Vec<u8> {
        let mut out = self.signed_part();
        out.extend_from_slice(signature);
        out
    }
}

/// Outcome of a completed link handshake
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub link_version: u16,
    pub relay_keys: VerifiedRelay,
    /// Our address as the relay sees it
    pub our_address: Option<IpAddr>,
    pub authenticated: bool,
}

/// Highest version present in both lists and not below `min`
pub fn negotiate_version(ours: &[u16], theirs: &[u16], min: u16) -> Result<u16> {
    ours.iter()
        .filter(|v| **v >= min && theirs.contains(v))
        .max()
        .copied()
        .ok_or_else(|| {
            TorError::HandshakeFailed(format!(
                "no common link version (ours {:?}, theirs {:?}, minimum {})",
                ours, theirs, min
            ))
        })
}

async fn next_link_cell(link: &mut dyn LinkStream, reader: &mut CellReader) -> Result<Cell> {
    loop {
        let cell = reader.read_cell(link).await?;
        match cell.body {
            CellBody::Padding | CellBody::Vpadding(_) => continue,
            _ => return Ok(cell),
        }
    }
}

fn unexpected(expected: &str, cell: &Cell) -> TorError {
    TorError::UnexpectedCell {
        expected: expected.into(),
        got: cell.body.name(),
    }
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Run the initiator side of the link handshake.
///
/// Returns the negotiated link state together with the reader and writer
/// framing state, which the circuit keeps using after the split.
pub async fn handshake(
    link: &mut dyn LinkStream,
    relay: &Relay,
    config: &EngineConfig,
    credentials: Option<&dyn LinkCredentials>,
) -> Result<(LinkInfo, CellReader, CellWriter)> {
    let mut reader = CellReader::new(PRE_NEGOTIATION_VERSION);
    let mut writer = CellWriter::new(PRE_NEGOTIATION_VERSION);
    reader.record_transcript(&[]);
    writer.record_transcript(&[]);

    writer
        .write_cell(link, &Cell::new(0, CellBody::Versions(config.link_versions.clone())))
        .await?;

    let versions = next_link_cell(link, &mut reader).await?;
    let theirs = match &versions.body {
        CellBody::Versions(v) => v.clone(),
        _ => return Err(unexpected("VERSIONS", &versions)),
    };
    let version = negotiate_version(&config.link_versions, &theirs, config.min_link_version)?;
    reader.set_link_version(version);
    writer.set_link_version(version);
    log::debug!("🤝 {} negotiated link version {}", relay.nickname, version);

    let certs_cell = next_link_cell(link, &mut reader).await?;
    let certs = match &certs_cell.body {
        CellBody::Certs(certs) => CertsCell::new(certs.clone())?,
        _ => return Err(unexpected("CERTS", &certs_cell)),
    };
    let tls_cert = link.peer_certificate();
    let relay_keys = verify_relay_certs(
        &certs,
        tls_cert.as_deref(),
        &relay.identity,
        relay.ed25519_identity.as_ref(),
        now_hours(),
    )?;

    let challenge = next_link_cell(link, &mut reader).await?;
    let methods = match &challenge.body {
        CellBody::AuthChallenge { methods, .. } => methods.clone(),
        _ => return Err(unexpected("AUTH_CHALLENGE", &challenge)),
    };

    let mut authenticated = false;
    if let Some(creds) = credentials {
        if methods.contains(&AUTH_METHOD_ED25519) {
            writer
                .write_cell(link, &Cell::new(0, CellBody::Certs(creds.certs())))
                .await?;

            let scert: [u8; 32] = Sha256::digest(tls_cert.as_deref().unwrap_or_default()).into();
            let missing = || TorError::Internal("link transcript not recorded".into());
            let mut transcript = AuthTranscript {
                cid: creds.rsa_identity_digest(),
                sid: relay_keys.rsa_identity.sha256(),
                cid_ed: creds.ed25519_identity(),
                sid_ed: relay_keys.ed25519_identity,
                slog: reader.transcript_digest().ok_or_else(missing)?,
                clog: writer.transcript_digest().ok_or_else(missing)?,
                scert,
                tls_secrets: link.export_keying_material(TLS_EXPORTER_LABEL, &scert)?,
                rand: [0u8; 24],
            };
            rand::thread_rng().fill_bytes(&mut transcript.rand);

            let signature = creds.sign_authenticate(&transcript.signed_part())?;
            writer
                .write_cell(
                    link,
                    &Cell::new(
                        0,
                        CellBody::Authenticate {
                            auth_type: AUTH_METHOD_ED25519,
                            auth: transcript.authenticator(&signature),
                        },
                    ),
                )
                .await?;
            authenticated = true;
        } else {
            log::warn!(
                "⚠️ {} offers no supported auth method ({:?}), staying unauthenticated",
                relay.nickname,
                methods
            );
        }
    }
    reader.stop_transcript();
    writer.stop_transcript();

    let netinfo = next_link_cell(link, &mut reader).await?;
    let our_address = match &netinfo.body {
        CellBody::Netinfo(info) => info.other_addr,
        _ => return Err(unexpected("NETINFO", &netinfo)),
    };

    let reply = Netinfo {
        timestamp: unix_time(),
        other_addr: Some(IpAddr::V4(relay.address)),
        my_addrs: our_address.into_iter().collect(),
    };
    writer
        .write_cell(link, &Cell::new(0, CellBody::Netinfo(reply)))
        .await?;

    log::info!(
        "🤝 Link to {} ready (v{}, {})",
        relay.nickname,
        version,
        if authenticated { "authenticated" } else { "anonymous" }
    );
    Ok((
        LinkInfo {
            link_version: version,
            relay_keys,
            our_address,
            authenticated,
        },
        reader,
        writer,
    ))
}
