//! Onion service introduction and rendezvous cells
//!
//! The service side of v3 onion services, limited to what a circuit needs:
//! signing ESTABLISH_INTRO, checking and decrypting INTRODUCE2, and building
//! RENDEZVOUS1. Descriptor handling lives elsewhere.
//!
//! ```text
//! ESTABLISH_INTRO  = AUTH_KEY_TYPE(1) | AUTH_KEY_LEN(2) | AUTH_KEY | N_EXT(1) | exts
//!                    | HANDSHAKE_AUTH(32) | SIG_LEN(2) | SIG
//! INTRODUCE1/2     = LEGACY_KEY_ID(20) | AUTH_KEY_TYPE(1) | AUTH_KEY_LEN(2) | AUTH_KEY
//!                    | N_EXT(1) | exts | CLIENT_PK(32) | ENCRYPTED | MAC(32)
//! plaintext        = COOKIE(20) | N_EXT(1) | exts | ONION_KEY_TYPE(1) | ONION_KEY_LEN(2)
//!                    | ONION_KEY | NSPEC(1) | link specifiers | padding
//! RENDEZVOUS1      = COOKIE(20) | Y(32) | AUTH_INPUT_MAC(32)
//! ```

use super::cell::Reader;
use super::hs_ntor::{hs_mac, service_intro_keys, IntroKeys};
use super::relay::{decode_link_specifiers, encode_link_specifiers, Relay};
use crate::error::{Result, TorError};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::{HashSet, VecDeque};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Auth key type for Ed25519 introduction point keys
pub const AUTH_KEY_TYPE_ED25519: u8 = 0x02;

/// Onion key type for curve25519 ntor keys
pub const ONION_KEY_TYPE_NTOR: u8 = 0x01;

pub const REND_COOKIE_LEN: usize = 20;

const ESTABLISH_INTRO_SIG_PREFIX: &[u8] = b"Tor establish-intro cell v1";

/// Ed25519 signature length
const SIG_LEN: usize = 64;

/// Cookies remembered by [`ReplayCache::default`]
const DEFAULT_REPLAY_CAPACITY: usize = 1024;

/// Per introduction point key pair
pub struct IntroPointKeys {
    auth_key: SigningKey,
    enc_key: StaticSecret,
}

impl IntroPointKeys {
    pub fn generate() -> Self {
        Self {
            auth_key: SigningKey::generate(&mut OsRng),
            enc_key: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_parts(auth_key: SigningKey, enc_key: StaticSecret) -> Self {
        Self { auth_key, enc_key }
    }

    /// Ed25519 auth key published in the descriptor
    pub fn auth_public(&self) -> [u8; 32] {
        self.auth_key.verifying_key().to_bytes()
    }

    /// X25519 encryption key (B) published in the descriptor
    pub fn enc_public(&self) -> [u8; 32] {
        *PublicKey::from(&self.enc_key).as_bytes()
    }

    pub(crate) fn enc_secret(&self) -> &StaticSecret {
        &self.enc_key
    }
}

/// ESTABLISH_INTRO body bound to the circuit's last-hop nonce
pub fn establish_intro_body(keys: &IntroPointKeys, circuit_nonce: &[u8; 20]) -> Vec<u8> {
    let auth_key = keys.auth_public();

    let mut body = Vec::with_capacity(3 + 32 + 1 + 32 + 2 + SIG_LEN);
    body.push(AUTH_KEY_TYPE_ED25519);
    body.extend_from_slice(&(auth_key.len() as u16).to_be_bytes());
    body.extend_from_slice(&auth_key);
    body.push(0);

    let handshake_auth = hs_mac(circuit_nonce, &body);
    body.extend_from_slice(&handshake_auth);
    body.extend_from_slice(&(SIG_LEN as u16).to_be_bytes());

    let mut signed = Vec::with_capacity(ESTABLISH_INTRO_SIG_PREFIX.len() + body.len());
    signed.extend_from_slice(ESTABLISH_INTRO_SIG_PREFIX);
    signed.extend_from_slice(&body[..body.len() - 2]);
    let signature = keys.auth_key.sign(&signed);
    body.extend_from_slice(&signature.to_bytes());
    body
}

/// Introduction point side of ESTABLISH_INTRO: check the MAC and signature,
/// returning the auth key the cell registers.
pub fn verify_establish_intro(body: &[u8], circuit_nonce: &[u8; 20]) -> Result<[u8; 32]> {
    let mut r = Reader::new(body);
    let key_type = r.u8()?;
    let key_len = r.u16()? as usize;
    if key_type != AUTH_KEY_TYPE_ED25519 || key_len != 32 {
        return Err(TorError::ProtocolError(format!(
            "ESTABLISH_INTRO auth key type {} len {}",
            key_type, key_len
        )));
    }
    let auth_key: [u8; 32] = r.array()?;
    let n_ext = r.u8()?;
    for _ in 0..n_ext {
        let _ext_type = r.u8()?;
        let len = r.u8()? as usize;
        r.take(len)?;
    }
    let mac_end = r.position();
    let handshake_auth: [u8; 32] = r.array()?;
    let sig_end = r.position();
    let sig_len = r.u16()? as usize;
    if sig_len != SIG_LEN {
        return Err(TorError::ProtocolError(format!(
            "ESTABLISH_INTRO signature length {}",
            sig_len
        )));
    }
    let sig: [u8; SIG_LEN] = r.array()?;

    let expected = hs_mac(circuit_nonce, &body[..mac_end]);
    if !bool::from(expected.ct_eq(&handshake_auth)) {
        return Err(TorError::AuthVerificationFailed(
            "ESTABLISH_INTRO handshake MAC".into(),
        ));
    }

    let mut signed = Vec::with_capacity(ESTABLISH_INTRO_SIG_PREFIX.len() + sig_end);
    signed.extend_from_slice(ESTABLISH_INTRO_SIG_PREFIX);
    signed.extend_from_slice(&body[..sig_end]);
    let key = VerifyingKey::from_bytes(&auth_key)
        .map_err(|e| TorError::Crypto(format!("bad auth key: {}", e)))?;
    key.verify(&signed, &Signature::from_bytes(&sig))
        .map_err(|_| TorError::AuthVerificationFailed("ESTABLISH_INTRO signature".into()))?;

    Ok(auth_key)
}

/// A parsed, still encrypted INTRODUCE2 body
#[derive(Debug, Clone)]
pub struct Introduce2 {
    pub legacy_key_id: [u8; 20],
    pub auth_key_type: u8,
    pub auth_key: Vec<u8>,
    /// N_EXT followed by the raw extensions
    pub extensions: Vec<u8>,
    pub client_public: [u8; 32],
    pub encrypted: Vec<u8>,
    pub mac: [u8; 32],
}

/// A verified introduction, ready for the rendezvous join
#[derive(Debug, Clone)]
pub struct IntroduceRequest {
    pub rendezvous_cookie: [u8; REND_COOKIE_LEN],
    pub rendezvous_point: Relay,
    pub client_public: [u8; 32],
}

impl Introduce2 {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let legacy_key_id = r.array()?;
        let auth_key_type = r.u8()?;
        let auth_key_len = r.u16()? as usize;
        let auth_key = r.take(auth_key_len)?.to_vec();

        let ext_start = r.position();
        let n_ext = r.u8()?;
        for _ in 0..n_ext {
            let _ext_type = r.u8()?;
            let len = r.u8()? as usize;
            r.take(len)?;
        }
        let extensions = body[ext_start..r.position()].to_vec();
        let client_public = r.array()?;

        let rest = r.rest();
        if rest.len() < 32 {
            return Err(TorError::ParseError("INTRODUCE2 too short for MAC".into()));
        }
        let (encrypted, mac) = rest.split_at(rest.len() - 32);
        let mut mac_bytes = [0u8; 32];
        mac_bytes.copy_from_slice(mac);

        Ok(Self {
            legacy_key_id,
            auth_key_type,
            auth_key,
            extensions,
            client_public,
            encrypted: encrypted.to_vec(),
            mac: mac_bytes,
        })
    }

    /// Everything the MAC covers
    fn mac_input(&self) -> Vec<u8> {
        let mut input = Vec::with_capacity(
            20 + 3 + self.auth_key.len() + self.extensions.len() + 32 + self.encrypted.len(),
        );
        input.extend_from_slice(&self.legacy_key_id);
        input.push(self.auth_key_type);
        input.extend_from_slice(&(self.auth_key.len() as u16).to_be_bytes());
        input.extend_from_slice(&self.auth_key);
        input.extend_from_slice(&self.extensions);
        input.extend_from_slice(&self.client_public);
        input.extend_from_slice(&self.encrypted);
        input
    }

    /// Check the auth key and MAC, then decrypt.
    ///
    /// The MAC is tried under the current subcredential first, then the
    /// previous one.
    pub fn verify_and_decrypt(
        &self,
        keys: &IntroPointKeys,
        current_subcredential: &[u8; 32],
        previous_subcredential: &[u8; 32],
    ) -> Result<IntroduceRequest> {
        let auth_key = keys.auth_public();
        if self.auth_key_type != AUTH_KEY_TYPE_ED25519 || self.auth_key.as_slice() != auth_key {
            return Err(TorError::ProtocolError(
                "INTRODUCE2 auth key does not match this introduction point".into(),
            ));
        }

        let mac_input = self.mac_input();
        let mut matched = None;
        for subcredential in [current_subcredential, previous_subcredential] {
            let intro = service_intro_keys(
                keys.enc_secret(),
                &auth_key,
                &self.client_public,
                subcredential,
            )?;
            let mac = hs_mac(&intro.mac_key[..], &mac_input);
            if mac == self.mac {
                matched = Some(intro);
                break;
            }
        }
        let intro = matched.ok_or_else(|| {
            TorError::AuthVerificationFailed("INTRODUCE2 MAC matches no subcredential".into())
        })?;

        let plaintext = apply_intro_cipher(&intro, &self.encrypted)?;
        parse_plaintext(&plaintext, self.client_public)
    }
}

fn apply_intro_cipher(intro: &IntroKeys, encrypted: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut plaintext = Zeroizing::new(encrypted.to_vec());
    let mut cipher = Aes256Ctr::new_from_slices(&intro.enc_key[..], &[0u8; 16])
        .map_err(|_| TorError::Crypto("AES-256 key must be 32 bytes".into()))?;
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

fn parse_plaintext(plaintext: &[u8], client_public: [u8; 32]) -> Result<IntroduceRequest> {
    let mut r = Reader::new(plaintext);
    let rendezvous_cookie = r.array()?;
    let n_ext = r.u8()?;
    for _ in 0..n_ext {
        let _ext_type = r.u8()?;
        let len = r.u8()? as usize;
        r.take(len)?;
    }

    let onion_key_type = r.u8()?;
    let onion_key_len = r.u16()? as usize;
    if onion_key_type != ONION_KEY_TYPE_NTOR || onion_key_len != 32 {
        return Err(TorError::ProtocolError(format!(
            "INTRODUCE2 onion key type {} len {}",
            onion_key_type, onion_key_len
        )));
    }
    let onion_key = r.array()?;
    let specs = decode_link_specifiers(&mut r)?;
    let rendezvous_point = Relay::from_link_specifiers(&specs, onion_key)?;

    Ok(IntroduceRequest {
        rendezvous_cookie,
        rendezvous_point,
        client_public,
    })
}

/// Client side: INTRODUCE1 for `rendezvous_point`, encrypted and MACed with
/// the intro keys of an HS-NTOR client. The introduction point relays it
/// unchanged as INTRODUCE2.
pub fn encode_introduce1(
    intro: &IntroKeys,
    client_public: &[u8; 32],
    auth_key: &[u8; 32],
    rendezvous_cookie: &[u8; REND_COOKIE_LEN],
    rendezvous_point: &Relay,
) -> Result<Vec<u8>> {
    let mut plaintext = Vec::new();
    plaintext.extend_from_slice(rendezvous_cookie);
    plaintext.push(0);
    plaintext.push(ONION_KEY_TYPE_NTOR);
    plaintext.extend_from_slice(&32u16.to_be_bytes());
    plaintext.extend_from_slice(&rendezvous_point.ntor_onion_key);
    encode_link_specifiers(&rendezvous_point.link_specifiers(), &mut plaintext);

    let encrypted = apply_intro_cipher(intro, &plaintext)?;
    let cell = Introduce2 {
        legacy_key_id: [0; 20],
        auth_key_type: AUTH_KEY_TYPE_ED25519,
        auth_key: auth_key.to_vec(),
        extensions: vec![0],
        client_public: *client_public,
        encrypted: encrypted.to_vec(),
        mac: [0; 32],
    };
    let mut body = cell.mac_input();
    body.extend_from_slice(&hs_mac(&intro.mac_key[..], &body));
    Ok(body)
}

pub fn rendezvous1_body(
    cookie: &[u8; REND_COOKIE_LEN],
    service_public: &[u8; 32],
    auth_input_mac: &[u8; 32],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(REND_COOKIE_LEN + 64);
    body.extend_from_slice(cookie);
    body.extend_from_slice(service_public);
    body.extend_from_slice(auth_input_mac);
    body
}

/// Split a RENDEZVOUS1 body into cookie and the handshake info the
/// rendezvous point forwards in RENDEZVOUS2
pub fn parse_rendezvous1(body: &[u8]) -> Result<([u8; REND_COOKIE_LEN], [u8; 32], [u8; 32])> {
    let mut r = Reader::new(body);
    Ok((r.array()?, r.array()?, r.array()?))
}

/// Bounded set of rendezvous cookies already answered
pub struct ReplayCache {
    seen: HashSet<[u8; REND_COOKIE_LEN]>,
    order: VecDeque<[u8; REND_COOKIE_LEN]>,
    capacity: usize,
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

impl ReplayCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a cookie. Returns false if it was already seen.
    pub fn check_and_insert(&mut self, cookie: &[u8; REND_COOKIE_LEN]) -> bool {
        if self.seen.contains(cookie) {
            log::warn!("⚠️ Replayed rendezvous cookie {}", hex::encode(&cookie[..4]));
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(*cookie);
        self.order.push_back(*cookie);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Parse, verify and decrypt an INTRODUCE2, dropping replays (`Ok(None)`)
pub fn handle_introduce2(
    body: &[u8],
    keys: &IntroPointKeys,
    current_subcredential: &[u8; 32],
    previous_subcredential: &[u8; 32],
    replay_cache: &mut ReplayCache,
) -> Result<Option<IntroduceRequest>> {
    let request = Introduce2::parse(body)?.verify_and_decrypt(
        keys,
        current_subcredential,
        previous_subcredential,
    )?;
    if !replay_cache.check_and_insert(&request.rendezvous_cookie) {
        return Ok(None);
    }
    log::info!(
        "📨 INTRODUCE2 accepted, rendezvous at {}",
        request.rendezvous_point.fingerprint()
    );
    Ok(Some(request))
}

/// Random rendezvous cookie
pub fn new_rendezvous_cookie() -> [u8; REND_COOKIE_LEN] {
    let mut cookie = [0u8; REND_COOKIE_LEN];
    OsRng.fill_bytes(&mut cookie);
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::hs_ntor::HsNtorClient;
    use crate::protocol::relay::RelayFlags;
    use std::net::Ipv4Addr;

    fn rendezvous_point() -> Relay {
        Relay {
            nickname: "rp".into(),
            identity: [0x42; 20],
            ntor_onion_key: [0x24; 32],
            address: Ipv4Addr::new(198, 51, 100, 7),
            or_port: 9001,
            dir_port: 0,
            flags: RelayFlags::default(),
            ed25519_identity: None,
        }
    }

    fn introduce(keys: &IntroPointKeys, subcred: &[u8; 32], cookie: &[u8; 20]) -> Vec<u8> {
        let client = HsNtorClient::new(&keys.enc_public(), &keys.auth_public(), subcred);
        let intro = client.intro_keys().unwrap();
        encode_introduce1(
            &intro,
            client.client_public_key().as_bytes(),
            &keys.auth_public(),
            cookie,
            &rendezvous_point(),
        )
        .unwrap()
    }

    #[test]
    fn test_establish_intro_verifies() {
        let keys = IntroPointKeys::generate();
        let nonce = [7u8; 20];
        let body = establish_intro_body(&keys, &nonce);
        assert_eq!(body.len(), 3 + 32 + 1 + 32 + 2 + 64);
        assert_eq!(verify_establish_intro(&body, &nonce).unwrap(), keys.auth_public());
    }

    #[test]
    fn test_establish_intro_bound_to_nonce() {
        let keys = IntroPointKeys::generate();
        let body = establish_intro_body(&keys, &[7u8; 20]);
        assert!(verify_establish_intro(&body, &[8u8; 20]).is_err());
    }

    #[test]
    fn test_introduce2_current_subcredential() {
        let keys = IntroPointKeys::generate();
        let cookie = [9u8; 20];
        let body = introduce(&keys, &[1; 32], &cookie);

        let request = Introduce2::parse(&body)
            .unwrap()
            .verify_and_decrypt(&keys, &[1; 32], &[2; 32])
            .unwrap();
        assert_eq!(request.rendezvous_cookie, cookie);
        assert_eq!(request.rendezvous_point.identity, [0x42; 20]);
        assert_eq!(request.rendezvous_point.ntor_onion_key, [0x24; 32]);
        assert_eq!(request.rendezvous_point.or_port, 9001);
    }

    #[test]
    fn test_introduce2_previous_subcredential() {
        let keys = IntroPointKeys::generate();
        let body = introduce(&keys, &[2; 32], &[9u8; 20]);
        let parsed = Introduce2::parse(&body).unwrap();
        assert!(parsed.verify_and_decrypt(&keys, &[1; 32], &[2; 32]).is_ok());
    }

    #[test]
    fn test_introduce2_unknown_subcredential() {
        let keys = IntroPointKeys::generate();
        let body = introduce(&keys, &[3; 32], &[9u8; 20]);
        let err = Introduce2::parse(&body)
            .unwrap()
            .verify_and_decrypt(&keys, &[1; 32], &[2; 32])
            .unwrap_err();
        assert!(matches!(err, TorError::AuthVerificationFailed(_)));
    }

    #[test]
    fn test_introduce2_tampered_ciphertext() {
        let keys = IntroPointKeys::generate();
        let mut body = introduce(&keys, &[1; 32], &[9u8; 20]);
        let idx = body.len() - 40;
        body[idx] ^= 1;
        let parsed = Introduce2::parse(&body).unwrap();
        assert!(parsed.verify_and_decrypt(&keys, &[1; 32], &[2; 32]).is_err());
    }

    #[test]
    fn test_introduce2_wrong_auth_key() {
        let keys = IntroPointKeys::generate();
        let other = IntroPointKeys::generate();
        let body = introduce(&keys, &[1; 32], &[9u8; 20]);
        let err = Introduce2::parse(&body)
            .unwrap()
            .verify_and_decrypt(&other, &[1; 32], &[2; 32])
            .unwrap_err();
        assert!(matches!(err, TorError::ProtocolError(_)));
    }

    #[test]
    fn test_replayed_cookie_dropped() {
        let keys = IntroPointKeys::generate();
        let body = introduce(&keys, &[1; 32], &[9u8; 20]);
        let mut cache = ReplayCache::default();

        assert!(handle_introduce2(&body, &keys, &[1; 32], &[2; 32], &mut cache)
            .unwrap()
            .is_some());
        assert!(handle_introduce2(&body, &keys, &[1; 32], &[2; 32], &mut cache)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_replay_cache_evicts_oldest() {
        let mut cache = ReplayCache::new(2);
        assert!(cache.check_and_insert(&[1; 20]));
        assert!(cache.check_and_insert(&[2; 20]));
        assert!(cache.check_and_insert(&[3; 20]));
        assert_eq!(cache.len(), 2);
        assert!(cache.check_and_insert(&[1; 20]));
        assert!(!cache.check_and_insert(&[3; 20]));
    }

    #[test]
    fn test_rendezvous1_layout() {
        let body = rendezvous1_body(&[1; 20], &[2; 32], &[3; 32]);
        assert_eq!(body.len(), 84);
        let (cookie, y, mac) = parse_rendezvous1(&body).unwrap();
        assert_eq!(cookie, [1; 20]);
        assert_eq!(y, [2; 32]);
        assert_eq!(mac, [3; 32]);
    }
}
