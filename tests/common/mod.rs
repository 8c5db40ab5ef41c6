//! In-process relays for integration tests
//!
//! A [`SimNetwork`] holds a handful of relays with real identity keys, cert
//! chains and ntor onion keys. Connecting to one opens a memory link whose
//! far end is served by a task that plays the whole chain behind that
//! relay: it answers CREATE2, peels one layer per hop, extends to other
//! simulated relays, echoes DATA and splices rendezvous traffic out to the
//! test.

#![allow(dead_code)]

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};
use tokio_util::compat::Compat;
use tor_embedded::network::{memory_link_pair, LinkStream, RelayConnector};
use tor_embedded::protocol::cell::{
    Cell, CellBody, CertEntry, Netinfo, RelayCell, RelayCommand, RelayPayload,
};
use tor_embedded::protocol::certs::{
    CertType, Ed25519Certificate, CERT_KEY_ED25519, CERT_KEY_SHA256_X509, RSA_ENCRYPTION,
};
use tor_embedded::protocol::codec::{CellReader, CellWriter, PRE_NEGOTIATION_VERSION};
use tor_embedded::protocol::crypto::{originate, recognize, HandshakeRole, HopCrypto};
use tor_embedded::protocol::extend::{encode_extended2, Extend2};
use tor_embedded::protocol::handshake::{negotiate_version, AUTH_METHOD_ED25519};
use tor_embedded::protocol::ntor;
use tor_embedded::protocol::onion_service::verify_establish_intro;
use tor_embedded::protocol::relay::RelayFlags;
use tor_embedded::{
    CircuitBuilder, CircuitContext, EngineConfig, LinkCredentials, Relay, Result,
    StaticDirectory, TorError,
};
use x25519_dalek::{PublicKey, StaticSecret};
use x509_cert::der::asn1::{BitString, GeneralizedTime, ObjectIdentifier};
use x509_cert::der::{DateTime, Encode};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};
use x509_cert::{Certificate, TbsCertificate, Version};

const LINK_VERSIONS: [u16; 2] = [4, 5];
const EXPORTER_SECRET: [u8; 32] = [0x5a; 32];

const REASON_PROTOCOL: u8 = 1;
const REASON_REQUESTED: u8 = 3;
const REASON_RESOURCELIMIT: u8 = 5;
const REASON_CONNECTFAILED: u8 = 6;

/// Things the relays report back to the test
#[derive(Debug)]
pub enum SimEvent {
    /// RENDEZVOUS1 body received by a rendezvous point
    Rendezvous1(Vec<u8>),
    /// A body no relay recognized, with every relay layer removed
    Spliced(RelayPayload),
}

/// PKCS#1 `RSAPublicKey` with a 1024-bit modulus derived from `n`
fn rsa_public_key(n: u8) -> Vec<u8> {
    let mut der = vec![0x30, 0x81, 0x89, 0x02, 0x81, 0x81, 0x00, 0x80 | n];
    der.extend((1..128u8).map(|i| n.wrapping_mul(17) ^ i));
    der.extend_from_slice(&[0x02, 0x03, 0x01, 0x00, 0x01]);
    der
}

/// Legacy identity certificate around `key`; nobody checks its signature
fn rsa_identity_cert(key: &[u8]) -> Vec<u8> {
    let sha256_with_rsa = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
    let time = |year: u16| {
        Time::GeneralTime(GeneralizedTime::from_date_time(
            DateTime::new(year, 6, 1, 0, 0, 0).unwrap(),
        ))
    };
    let signed_with = AlgorithmIdentifierOwned {
        oid: sha256_with_rsa,
        parameters: None,
    };
    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: SerialNumber::new(&[0x2a]).unwrap(),
        signature: signed_with.clone(),
        issuer: Name::default(),
        validity: Validity {
            not_before: time(2021),
            not_after: time(2041),
        },
        subject: Name::default(),
        subject_public_key_info: SubjectPublicKeyInfoOwned {
            algorithm: AlgorithmIdentifierOwned {
                oid: RSA_ENCRYPTION,
                parameters: None,
            },
            subject_public_key: BitString::from_bytes(key).unwrap(),
        },
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: None,
    };
    Certificate {
        tbs_certificate,
        signature_algorithm: signed_with,
        signature: BitString::from_bytes(&[0x77; 128]).unwrap(),
    }
    .to_der()
    .unwrap()
}

pub struct SimRelay {
    pub relay: Relay,
    /// SHA-256 of the RSA identity key, expected as SID in AUTHENTICATE
    rsa_sid: [u8; 32],
    onion_secret: StaticSecret,
    tls_cert: Vec<u8>,
    certs: Vec<CertEntry>,
}

impl SimRelay {
    fn new(n: u8) -> Self {
        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let identity = SigningKey::generate(&mut OsRng);
        let signing = SigningKey::generate(&mut OsRng);
        let tls_cert = format!("tls certificate of sim{}", n).into_bytes();
        let tls_digest: [u8; 32] = Sha256::digest(&tls_cert).into();
        let rsa_key = rsa_public_key(n);

        let certs = vec![
            CertEntry {
                cert_type: CertType::RsaId as u8,
                body: rsa_identity_cert(&rsa_key),
            },
            CertEntry {
                cert_type: CertType::Ed25519SigningKey as u8,
                body: Ed25519Certificate::issue(
                    CertType::Ed25519SigningKey,
                    CERT_KEY_ED25519,
                    signing.verifying_key().as_bytes(),
                    u32::MAX,
                    true,
                    &identity,
                ),
            },
            CertEntry {
                cert_type: CertType::Ed25519TlsLink as u8,
                body: Ed25519Certificate::issue(
                    CertType::Ed25519TlsLink,
                    CERT_KEY_SHA256_X509,
                    &tls_digest,
                    u32::MAX,
                    false,
                    &signing,
                ),
            },
        ];

        let relay = Relay {
            nickname: format!("sim{}", n),
            identity: Sha1::digest(&rsa_key).into(),
            ntor_onion_key: *PublicKey::from(&onion_secret).as_bytes(),
            address: Ipv4Addr::new(10, 0, 0, n),
            or_port: 9001,
            dir_port: 0,
            flags: RelayFlags {
                running: true,
                valid: true,
                guard: true,
                ..Default::default()
            },
            ed25519_identity: Some(*identity.verifying_key().as_bytes()),
        };

        Self {
            relay,
            rsa_sid: Sha256::digest(&rsa_key).into(),
            onion_secret,
            tls_cert,
            certs,
        }
    }
}

pub struct SimNetwork {
    relays: HashMap<[u8; 20], Arc<SimRelay>>,
    order: Vec<Arc<SimRelay>>,
    padding_seen: AtomicUsize,
    destroys_seen: AtomicUsize,
    authenticates_seen: AtomicUsize,
    /// CREATE2 cells still to be refused with DESTROY
    refuse_creates: AtomicUsize,
    corrupt_next: AtomicBool,
    kill: watch::Sender<bool>,
    events_tx: mpsc::UnboundedSender<SimEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SimEvent>>,
    to_service: Mutex<Option<mpsc::UnboundedSender<RelayPayload>>>,
}

impl SimNetwork {
    /// Relays `sim1` through `sim{count}`
    pub fn new(count: u8) -> Arc<Self> {
        let order: Vec<Arc<SimRelay>> = (1..=count).map(|n| Arc::new(SimRelay::new(n))).collect();
        let relays = order.iter().map(|r| (r.relay.identity, r.clone())).collect();
        let (kill, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            relays,
            order,
            padding_seen: AtomicUsize::new(0),
            destroys_seen: AtomicUsize::new(0),
            authenticates_seen: AtomicUsize::new(0),
            refuse_creates: AtomicUsize::new(0),
            corrupt_next: AtomicBool::new(false),
            kill,
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            to_service: Mutex::new(None),
        })
    }

    /// Relay record of `sim{n}`
    pub fn relay(&self, n: u8) -> Relay {
        self.order[n as usize - 1].relay.clone()
    }

    pub fn relays(&self) -> Vec<Relay> {
        self.order.iter().map(|r| r.relay.clone()).collect()
    }

    pub fn padding_seen(&self) -> usize {
        self.padding_seen.load(Ordering::SeqCst)
    }

    pub fn destroys_seen(&self) -> usize {
        self.destroys_seen.load(Ordering::SeqCst)
    }

    pub fn authenticates_seen(&self) -> usize {
        self.authenticates_seen.load(Ordering::SeqCst)
    }

    /// Answer the next `count` CREATE2 cells with DESTROY
    pub fn refuse_creates(&self, count: usize) {
        self.refuse_creates.store(count, Ordering::SeqCst);
    }

    /// Flip one ciphertext bit in the next cell sent towards a client
    pub fn corrupt_next_backward(&self) {
        self.corrupt_next.store(true, Ordering::SeqCst);
    }

    /// Close every link from the relay side
    pub fn sever_links(&self) {
        self.kill.send_replace(true);
    }

    pub async fn next_event(&self) -> SimEvent {
        let mut rx = self.events_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no relay event within 5s")
            .expect("event channel closed")
    }

    /// Inject a body at the rendezvous point, as if the client sent it
    pub fn send_to_service(&self, payload: RelayPayload) {
        let tx = self.to_service.lock().unwrap().clone();
        tx.expect("no rendezvous circuit joined")
            .send(payload)
            .expect("rendezvous link is gone");
    }

    fn emit(&self, event: SimEvent) {
        let _ = self.events_tx.send(event);
    }
}

pub struct SimConnector(pub Arc<SimNetwork>);

#[async_trait]
impl RelayConnector for SimConnector {
    async fn connect(&self, relay: &Relay) -> Result<Box<dyn LinkStream>> {
        let sim = self.0.relays.get(&relay.identity).cloned().ok_or_else(|| {
            TorError::ConnectionFailed(format!("no simulated relay {}", relay.nickname))
        })?;
        let (link, raw) = memory_link_pair(sim.tls_cert.clone(), EXPORTER_SECRET);
        tokio::spawn(serve_link(self.0.clone(), sim, raw));
        Ok(Box::new(link))
    }
}

/// Initiator identity for authenticated links
pub struct TestCredentials(pub SigningKey);

impl TestCredentials {
    pub fn generate() -> Self {
        Self(SigningKey::generate(&mut OsRng))
    }
}

impl LinkCredentials for TestCredentials {
    fn certs(&self) -> Vec<CertEntry> {
        Vec::new()
    }

    fn rsa_identity_digest(&self) -> [u8; 32] {
        [7; 32]
    }

    fn ed25519_identity(&self) -> [u8; 32] {
        *self.0.verifying_key().as_bytes()
    }

    fn sign_authenticate(&self, message: &[u8]) -> Result<[u8; 64]> {
        Ok(self.0.sign(message).to_bytes())
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        handshake_timeout_ms: 5_000,
        ..Default::default()
    }
}

pub fn context(net: &Arc<SimNetwork>, config: EngineConfig) -> (CircuitContext, Arc<StaticDirectory>) {
    let directory = Arc::new(StaticDirectory::new(net.relays()));
    let ctx = CircuitContext::new(config, Arc::new(SimConnector(net.clone())), directory.clone());
    (ctx, directory)
}

pub fn engine(net: &Arc<SimNetwork>) -> (CircuitBuilder, Arc<StaticDirectory>) {
    engine_with(net, test_config())
}

pub fn engine_with(net: &Arc<SimNetwork>, config: EngineConfig) -> (CircuitBuilder, Arc<StaticDirectory>) {
    let (ctx, directory) = context(net, config);
    (CircuitBuilder::new(Arc::new(ctx)), directory)
}

/// Poll `cond` for up to two seconds
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

// ===== relay side =====

struct SimHop {
    relay: Arc<SimRelay>,
    crypto: HopCrypto,
}

struct SimLink {
    net: Arc<SimNetwork>,
    first: Arc<SimRelay>,
    raw: Compat<DuplexStream>,
    reader: CellReader,
    writer: CellWriter,
    circ_id: u32,
    chain: Vec<SimHop>,
    spliced: bool,
    splice_tx: mpsc::UnboundedSender<RelayPayload>,
}

enum LinkEvent {
    Cell(Result<Cell>),
    FromClient(Option<RelayPayload>),
    Killed,
}

async fn serve_link(net: Arc<SimNetwork>, first: Arc<SimRelay>, raw: Compat<DuplexStream>) {
    let (splice_tx, splice_rx) = mpsc::unbounded_channel();
    let mut link = SimLink {
        net,
        first,
        raw,
        reader: CellReader::new(PRE_NEGOTIATION_VERSION),
        writer: CellWriter::new(PRE_NEGOTIATION_VERSION),
        circ_id: 0,
        chain: Vec::new(),
        spliced: false,
        splice_tx,
    };
    if let Err(e) = link.run(splice_rx).await {
        log::debug!("simulated link to {} ended: {}", link.first.relay.nickname, e);
    }
}

impl SimLink {
    async fn run(&mut self, mut from_client: mpsc::UnboundedReceiver<RelayPayload>) -> Result<()> {
        let mut kill = self.net.kill.subscribe();
        if *kill.borrow() {
            return Ok(());
        }
        self.handshake().await?;

        loop {
            let event = tokio::select! {
                cell = self.reader.read_cell(&mut self.raw) => LinkEvent::Cell(cell),
                payload = from_client.recv() => LinkEvent::FromClient(payload),
                _ = kill.changed() => LinkEvent::Killed,
            };
            let cell = match event {
                LinkEvent::Cell(cell) => cell?,
                LinkEvent::FromClient(Some(payload)) => {
                    self.splice_back(payload).await?;
                    continue;
                }
                LinkEvent::FromClient(None) | LinkEvent::Killed => return Ok(()),
            };
            if !self.on_cell(cell).await? {
                return Ok(());
            }
        }
    }

    /// Responder side of the link handshake. AUTHENTICATE is checked for
    /// the right SID only.
    async fn handshake(&mut self) -> Result<()> {
        let theirs = match self.reader.read_cell(&mut self.raw).await?.body {
            CellBody::Versions(v) => v,
            other => return Err(TorError::ProtocolError(format!("expected VERSIONS, got {}", other.name()))),
        };
        self.send(CellBody::Versions(LINK_VERSIONS.to_vec()), 0).await?;
        let version = negotiate_version(&LINK_VERSIONS, &theirs, 4)?;
        self.reader.set_link_version(version);
        self.writer.set_link_version(version);

        self.send(CellBody::Certs(self.first.certs.clone()), 0).await?;
        self.send(
            CellBody::AuthChallenge {
                challenge: [0x11; 32],
                methods: vec![AUTH_METHOD_ED25519],
            },
            0,
        )
        .await?;
        self.send(
            CellBody::Netinfo(Netinfo {
                timestamp: 0,
                other_addr: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
                my_addrs: vec![IpAddr::V4(self.first.relay.address)],
            }),
            0,
        )
        .await?;

        loop {
            match self.reader.read_cell(&mut self.raw).await?.body {
                CellBody::Netinfo(_) => return Ok(()),
                CellBody::Authenticate { auth, .. } => {
                    if auth.get(8 + 32..8 + 64) != Some(&self.first.rsa_sid[..]) {
                        return Err(TorError::ProtocolError("AUTHENTICATE names the wrong SID".into()));
                    }
                    self.net.authenticates_seen.fetch_add(1, Ordering::SeqCst);
                }
                CellBody::Certs(_) | CellBody::Padding => {}
                other => {
                    return Err(TorError::ProtocolError(format!(
                        "unexpected {} during handshake",
                        other.name()
                    )))
                }
            }
        }
    }

    async fn send(&mut self, body: CellBody, circ_id: u32) -> Result<()> {
        self.writer
            .write_cell(&mut self.raw, &Cell::new(circ_id, body))
            .await
    }

    /// Returns false once the circuit is gone
    async fn on_cell(&mut self, cell: Cell) -> Result<bool> {
        match cell.body {
            CellBody::Padding | CellBody::Vpadding(_) => {
                self.net.padding_seen.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            CellBody::Create2 { handshake, .. } => {
                self.circ_id = cell.circ_id;
                let refused = self
                    .net
                    .refuse_creates
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if refused {
                    self.send(CellBody::Destroy { reason: REASON_RESOURCELIMIT }, self.circ_id)
                        .await?;
                    return Ok(false);
                }
                let (reply, keys) =
                    ntor::server_handshake(&self.first.relay.identity, &self.first.onion_secret, &handshake)?;
                self.chain.push(SimHop {
                    relay: self.first.clone(),
                    crypto: HopCrypto::new(&keys, HandshakeRole::Responder)?,
                });
                self.send(CellBody::Created2 { handshake: reply }, self.circ_id)
                    .await?;
                Ok(true)
            }
            CellBody::Relay(payload) => self.on_relay(payload, false).await,
            CellBody::RelayEarly(payload) => self.on_relay(payload, true).await,
            CellBody::Destroy { .. } => {
                self.net.destroys_seen.fetch_add(1, Ordering::SeqCst);
                self.chain.clear();
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    async fn on_relay(&mut self, mut payload: RelayPayload, early: bool) -> Result<bool> {
        let mut target = None;
        for (index, hop) in self.chain.iter_mut().enumerate() {
            if recognize(&mut [&mut hop.crypto], &mut payload).is_ok() {
                target = Some(index);
                break;
            }
        }

        let index = match target {
            Some(index) => index,
            None if self.spliced => {
                self.net.emit(SimEvent::Spliced(payload));
                return Ok(true);
            }
            None => {
                self.send(CellBody::Destroy { reason: REASON_PROTOCOL }, self.circ_id)
                    .await?;
                return Ok(false);
            }
        };

        let cell = RelayCell::from_payload(&payload)?;
        match cell.command {
            RelayCommand::Data => {
                self.send_back(index, RelayCell::new(RelayCommand::Data, cell.stream_id, cell.data))
                    .await?;
            }
            RelayCommand::Extend2 => {
                if !early || index + 1 != self.chain.len() {
                    self.send(CellBody::Destroy { reason: REASON_PROTOCOL }, self.circ_id)
                        .await?;
                    return Ok(false);
                }
                let extend = Extend2::decode(&cell.data)?;
                let next = Relay::from_link_specifiers(&extend.link_specifiers, [0; 32])
                    .ok()
                    .and_then(|r| self.net.relays.get(&r.identity).cloned());
                let next = match next {
                    Some(next) => next,
                    None => {
                        self.send(CellBody::Destroy { reason: REASON_CONNECTFAILED }, self.circ_id)
                            .await?;
                        return Ok(false);
                    }
                };
                let (reply, keys) =
                    ntor::server_handshake(&next.relay.identity, &next.onion_secret, &extend.handshake)?;
                self.chain.push(SimHop {
                    relay: next,
                    crypto: HopCrypto::new(&keys, HandshakeRole::Responder)?,
                });
                self.send_back(
                    index,
                    RelayCell::new(RelayCommand::Extended2, 0, encode_extended2(&reply)),
                )
                .await?;
            }
            RelayCommand::Truncate => {
                self.chain.truncate(index + 1);
                self.spliced = false;
                self.send_back(
                    index,
                    RelayCell::new(RelayCommand::Truncated, 0, vec![REASON_REQUESTED]),
                )
                .await?;
            }
            RelayCommand::EstablishIntro => {
                let nonce = *self.chain[index]
                    .crypto
                    .nonce()
                    .ok_or_else(|| TorError::Internal("hop without nonce".into()))?;
                if verify_establish_intro(&cell.data, &nonce).is_err() {
                    self.send(CellBody::Destroy { reason: REASON_PROTOCOL }, self.circ_id)
                        .await?;
                    return Ok(false);
                }
                self.send_back(index, RelayCell::new(RelayCommand::IntroEstablished, 0, Vec::new()))
                    .await?;
            }
            RelayCommand::Rendezvous1 => {
                self.spliced = true;
                *self.net.to_service.lock().unwrap() = Some(self.splice_tx.clone());
                log::debug!("rendezvous joined at {}", self.chain[index].relay.relay.nickname);
                self.net.emit(SimEvent::Rendezvous1(cell.data));
            }
            _ => {}
        }
        Ok(true)
    }

    /// Originate a cell at hop `index` and wrap it in every nearer layer
    async fn send_back(&mut self, index: usize, cell: RelayCell) -> Result<()> {
        let mut payload = cell.to_payload()?;
        originate(&mut [&mut self.chain[index].crypto], &mut payload)?;
        for hop in self.chain[..index].iter_mut().rev() {
            hop.crypto.encrypt_forward(&mut payload);
        }
        if self.net.corrupt_next.swap(false, Ordering::SeqCst) {
            payload[60] ^= 0x40;
        }
        self.send(CellBody::Relay(payload), self.circ_id).await
    }

    /// A body from the other side of the rendezvous point: every hop only
    /// adds its layer
    async fn splice_back(&mut self, mut payload: RelayPayload) -> Result<()> {
        for hop in self.chain.iter_mut().rev() {
            hop.crypto.encrypt_forward(&mut payload);
        }
        self.send(CellBody::Relay(payload), self.circ_id).await
    }
}
