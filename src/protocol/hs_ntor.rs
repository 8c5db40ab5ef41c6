//! HS-NTOR handshake (v3 onion services)
//!
//! Both parties derive two sets of keys:
//! - intro keys (ENC_KEY, MAC_KEY) protecting the INTRODUCE1/2 payload, bound
//!   to the service subcredential
//! - rendezvous keys for the end-to-end layer, plus AUTH_INPUT_MAC which the
//!   service sends in RENDEZVOUS1 so the client can authenticate it
//!
//! ```text
//! MAC(k, m) = SHA3-256(htonll(len(k)) | k | m)
//! intro_secret_hs_input = EXP(B,x) | AUTH_KEY | X | B | PROTOID
//! hs_keys = SHAKE256(intro_secret_hs_input | t_hsenc | m_hsexpand | subcredential)
//! rend_secret_hs_input = EXP(X,y) | EXP(X,b) | AUTH_KEY | B | X | Y | PROTOID
//! NTOR_KEY_SEED = MAC(rend_secret_hs_input, t_hsenc)
//! verify = MAC(rend_secret_hs_input, t_hsverify)
//! AUTH_INPUT_MAC = MAC(verify | AUTH_KEY | B | Y | X | PROTOID | "Server", t_hsmac)
//! K = SHAKE256(NTOR_KEY_SEED | m_hsexpand)
//! ```

#![allow(non_snake_case)]

use super::crypto::{CircuitKeys, HS_KEY_MATERIAL_LEN};
use crate::error::{Result, TorError};
use rand::rngs::OsRng;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Digest, Sha3_256, Shake256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

const PROTOID: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1";
const T_HSENC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_extract";
const T_HSVERIFY: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_verify";
const T_HSMAC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_mac";
const M_HSEXPAND: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_expand";

/// MAC(k, m) = SHA3-256(k_len | k | m) with k_len a big-endian u64
pub fn hs_mac(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut d = Sha3_256::new();
    Digest::update(&mut d, (key.len() as u64).to_be_bytes());
    Digest::update(&mut d, key);
    Digest::update(&mut d, message);
    d.finalize().into()
}

fn shake256(parts: &[&[u8]], out: &mut [u8]) {
    let mut shake = Shake256::default();
    for part in parts {
        Update::update(&mut shake, part);
    }
    shake.finalize_xof().read(out);
}

fn require_contributory(shared: &SharedSecret) -> Result<()> {
    if shared.was_contributory() {
        Ok(())
    } else {
        Err(TorError::Crypto("X25519 produced a non-contributory secret".into()))
    }
}

/// ENC_KEY and MAC_KEY for the INTRODUCE1/INTRODUCE2 encrypted section
pub struct IntroKeys {
    pub enc_key: Zeroizing<[u8; 32]>,
    pub mac_key: Zeroizing<[u8; 32]>,
}

fn intro_keys(
    bx: &SharedSecret,
    auth_key: &[u8; 32],
    X: &PublicKey,
    B: &PublicKey,
    subcredential: &[u8; 32],
) -> Result<IntroKeys> {
    require_contributory(bx)?;

    let mut hs_keys = Zeroizing::new([0u8; 64]);
    shake256(
        &[
            bx.as_bytes(),
            auth_key,
            X.as_bytes(),
            B.as_bytes(),
            PROTOID,
            T_HSENC,
            M_HSEXPAND,
            subcredential,
        ],
        &mut hs_keys[..],
    );

    let mut enc_key = Zeroizing::new([0u8; 32]);
    let mut mac_key = Zeroizing::new([0u8; 32]);
    enc_key.copy_from_slice(&hs_keys[..32]);
    mac_key.copy_from_slice(&hs_keys[32..]);
    Ok(IntroKeys { enc_key, mac_key })
}

/// End-to-end layer keys plus the MAC proving the service computed them
pub struct RendezvousKeys {
    pub keys: CircuitKeys,
    pub auth_input_mac: [u8; 32],
}

fn rendezvous_keys(
    xy: &SharedSecret,
    xb: &SharedSecret,
    auth_key: &[u8; 32],
    B: &PublicKey,
    X: &PublicKey,
    Y: &PublicKey,
) -> Result<RendezvousKeys> {
    require_contributory(xy)?;
    require_contributory(xb)?;

    let mut secret_input = Zeroizing::new(Vec::with_capacity(32 * 6 + PROTOID.len()));
    secret_input.extend_from_slice(xy.as_bytes());
    secret_input.extend_from_slice(xb.as_bytes());
    secret_input.extend_from_slice(auth_key);
    secret_input.extend_from_slice(B.as_bytes());
    secret_input.extend_from_slice(X.as_bytes());
    secret_input.extend_from_slice(Y.as_bytes());
    secret_input.extend_from_slice(PROTOID);

    let key_seed = Zeroizing::new(hs_mac(&secret_input, T_HSENC));
    let verify = Zeroizing::new(hs_mac(&secret_input, T_HSVERIFY));

    let mut auth_input = Vec::with_capacity(32 * 5 + PROTOID.len() + 6);
    auth_input.extend_from_slice(&verify[..]);
    auth_input.extend_from_slice(auth_key);
    auth_input.extend_from_slice(B.as_bytes());
    auth_input.extend_from_slice(Y.as_bytes());
    auth_input.extend_from_slice(X.as_bytes());
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(b"Server");
    let auth_input_mac = hs_mac(&auth_input, T_HSMAC);

    let mut okm = Zeroizing::new([0u8; HS_KEY_MATERIAL_LEN]);
    shake256(&[&key_seed[..], M_HSEXPAND], &mut okm[..]);

    Ok(RendezvousKeys {
        keys: CircuitKeys::from_hs_key_material(&okm),
        auth_input_mac,
    })
}

/// Client half, started when building an INTRODUCE1 cell
pub struct HsNtorClient {
    x: StaticSecret,
    X: PublicKey,
    B: PublicKey,
    auth_key: [u8; 32],
    subcredential: [u8; 32],
}

impl HsNtorClient {
    /// `intro_enc_key` is B, `auth_key` is the introduction point's
    /// Ed25519 auth key, both from the service descriptor.
    pub fn new(intro_enc_key: &[u8; 32], auth_key: &[u8; 32], subcredential: &[u8; 32]) -> Self {
        let x = StaticSecret::random_from_rng(OsRng);
        let X = PublicKey::from(&x);
        Self {
            x,
            X,
            B: PublicKey::from(*intro_enc_key),
            auth_key: *auth_key,
            subcredential: *subcredential,
        }
    }

    pub fn client_public_key(&self) -> &PublicKey {
        &self.X
    }

    pub fn intro_keys(&self) -> Result<IntroKeys> {
        let bx = self.x.diffie_hellman(&self.B);
        intro_keys(&bx, &self.auth_key, &self.X, &self.B, &self.subcredential)
    }

    /// Finish with the RENDEZVOUS2 handshake info (`Y | AUTH_INPUT_MAC`)
    pub fn complete(self, service_public: &[u8; 32], auth_input_mac: &[u8; 32]) -> Result<CircuitKeys> {
        let Y = PublicKey::from(*service_public);
        let xy = self.x.diffie_hellman(&Y);
        let xb = self.x.diffie_hellman(&self.B);
        let derived = rendezvous_keys(&xy, &xb, &self.auth_key, &self.B, &self.X, &Y)?;

        if !bool::from(derived.auth_input_mac.ct_eq(auth_input_mac)) {
            return Err(TorError::AuthVerificationFailed(
                "RENDEZVOUS2 AUTH_INPUT_MAC does not match".into(),
            ));
        }
        Ok(derived.keys)
    }
}

/// Service: derive intro keys for a client public key X under one subcredential
pub fn service_intro_keys(
    intro_enc_secret: &StaticSecret,
    auth_key: &[u8; 32],
    client_public: &[u8; 32],
    subcredential: &[u8; 32],
) -> Result<IntroKeys> {
    let X = PublicKey::from(*client_public);
    let B = PublicKey::from(intro_enc_secret);
    let bx = intro_enc_secret.diffie_hellman(&X);
    intro_keys(&bx, auth_key, &X, &B, subcredential)
}

/// Service: run the rendezvous half with a fresh ephemeral Y.
///
/// Returns Y, to be sent in RENDEZVOUS1, and the derived keys.
pub fn service_rendezvous(
    intro_enc_secret: &StaticSecret,
    auth_key: &[u8; 32],
    client_public: &[u8; 32],
) -> Result<(PublicKey, RendezvousKeys)> {
    let X = PublicKey::from(*client_public);
    let B = PublicKey::from(intro_enc_secret);

    let y = StaticSecret::random_from_rng(OsRng);
    let Y = PublicKey::from(&y);

    let xy = y.diffie_hellman(&X);
    let xb = intro_enc_secret.diffie_hellman(&X);
    let derived = rendezvous_keys(&xy, &xb, auth_key, &B, &X, &Y)?;
    Ok((Y, derived))
}
