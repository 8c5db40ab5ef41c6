//! ntor handshake implementation
//!
//! The ntor (ntor1) key exchange used for CREATE2 and EXTEND2, based on
//! X25519 Diffie-Hellman. Both halves live here: the client half drives
//! circuit construction, the relay half answers CREATE2/EXTEND2 requests
//! when the engine is exercised against a simulated relay.
//!
//! References:
//! - Tor Spec: https://spec.torproject.org/tor-spec/create-created-cells.html
//!
//! Security: AUTH is compared in constant time, and key derivation only
//! happens after AUTH has been verified.

use super::crypto::CircuitKeys;
use crate::error::{Result, TorError};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// CREATE2 handshake type for ntor
pub const NTOR_HANDSHAKE_TYPE: u16 = 0x0002;

/// ID | B | X
pub const NTOR_ONIONSKIN_LEN: usize = 20 + 32 + 32;

/// Y | AUTH
pub const NTOR_REPLY_LEN: usize = 32 + 32;

/// ntor handshake state held by the circuit originator between CREATE2
/// and CREATED2 (or EXTEND2 and EXTENDED2)
pub struct NtorHandshake {
    /// StaticSecret rather than EphemeralSecret because it is used for two
    /// Diffie-Hellman operations; it zeroizes on drop.
    client_secret: StaticSecret,
    client_public: PublicKey,
    relay_id: [u8; 20],
    relay_onion_key: PublicKey,
}

impl NtorHandshake {
    /// Start a handshake with a relay
    pub fn new(relay_id: &[u8; 20], relay_onion_key: &[u8; 32]) -> Self {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);
        Self {
            client_secret,
            client_public,
            relay_id: *relay_id,
            relay_onion_key: PublicKey::from(*relay_onion_key),
        }
    }

    pub fn client_public_key(&self) -> &PublicKey {
        &self.client_public
    }

    /// Handshake data for CREATE2 / EXTEND2
    ///
    /// Format: ID (20 bytes) | B (32 bytes) | X (32 bytes)
    pub fn onionskin(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(NTOR_ONIONSKIN_LEN);
        data.extend_from_slice(&self.relay_id);
        data.extend_from_slice(self.relay_onion_key.as_bytes());
        data.extend_from_slice(self.client_public.as_bytes());
        data
    }

    /// Finish the handshake with the relay's `Y | AUTH` reply.
    ///
    /// Consumes the handshake: the ephemeral secret is gone whether or not
    /// this succeeds.
    pub fn complete(self, reply: &[u8]) -> Result<CircuitKeys> {
        let (server_public, server_auth) = parse_reply(reply)?;

        // EXP(Y,x), EXP(B,x)
        let yx = self.client_secret.diffie_hellman(&server_public);
        let bx = self.client_secret.diffie_hellman(&self.relay_onion_key);
        require_contributory(&yx)?;
        require_contributory(&bx)?;

        let secret_input = secret_input(
            &yx,
            &bx,
            &self.relay_id,
            &self.relay_onion_key,
            &self.client_public,
            &server_public,
        );
        let expected = compute_auth(
            &secret_input,
            &self.relay_id,
            &self.relay_onion_key,
            &self.client_public,
            &server_public,
        )?;

        if !bool::from(expected.ct_eq(&server_auth)) {
            log::warn!("⚠️ ntor AUTH mismatch from relay {}", hex::encode(self.relay_id));
            return Err(TorError::AuthVerificationFailed(
                "ntor server AUTH does not match".into(),
            ));
        }
        log::debug!("✅ ntor AUTH verified for {}", hex::encode(&self.relay_id[..4]));

        derive_keys(&secret_input)
    }
}

/// Relay half: answer an onionskin addressed to us.
///
/// Returns the `Y | AUTH` reply and the key material. The caller installs
/// the keys with [`super::crypto::HandshakeRole::Responder`].
pub fn server_handshake(
    relay_id: &[u8; 20],
    onion_secret: &StaticSecret,
    onionskin: &[u8],
) -> Result<(Vec<u8>, CircuitKeys)> {
    if onionskin.len() < NTOR_ONIONSKIN_LEN {
        return Err(TorError::HandshakeFailed(format!(
            "ntor onionskin is {} bytes, need {}",
            onionskin.len(),
            NTOR_ONIONSKIN_LEN
        )));
    }
    let onion_public = PublicKey::from(onion_secret);
    if &onionskin[0..20] != relay_id || &onionskin[20..52] != onion_public.as_bytes() {
        return Err(TorError::HandshakeFailed(
            "onionskin is not addressed to this relay".into(),
        ));
    }
    let mut x = [0u8; 32];
    x.copy_from_slice(&onionskin[52..84]);
    let client_public = PublicKey::from(x);

    let y_secret = StaticSecret::random_from_rng(OsRng);
    let server_public = PublicKey::from(&y_secret);

    // EXP(X,y) == EXP(Y,x), EXP(X,b) == EXP(B,x)
    let xy = y_secret.diffie_hellman(&client_public);
    let xb = onion_secret.diffie_hellman(&client_public);
    require_contributory(&xy)?;
    require_contributory(&xb)?;

    let secret_input = secret_input(
        &xy,
        &xb,
        relay_id,
        &onion_public,
        &client_public,
        &server_public,
    );
    let auth = compute_auth(
        &secret_input,
        relay_id,
        &onion_public,
        &client_public,
        &server_public,
    )?;
    let keys = derive_keys(&secret_input)?;

    let mut reply = Vec::with_capacity(NTOR_REPLY_LEN);
    reply.extend_from_slice(server_public.as_bytes());
    reply.extend_from_slice(&auth);
    Ok((reply, keys))
}

/// Split a CREATED2 / EXTENDED2 handshake body into Y and AUTH
pub fn parse_reply(reply: &[u8]) -> Result<(PublicKey, [u8; 32])> {
    if reply.len() < NTOR_REPLY_LEN {
        return Err(TorError::HandshakeFailed(format!(
            "ntor reply is {} bytes, need {}",
            reply.len(),
            NTOR_REPLY_LEN
        )));
    }
    let mut y = [0u8; 32];
    y.copy_from_slice(&reply[0..32]);
    let mut auth = [0u8; 32];
    auth.copy_from_slice(&reply[32..64]);
    Ok((PublicKey::from(y), auth))
}

fn require_contributory(shared: &SharedSecret) -> Result<()> {
    if shared.was_contributory() {
        Ok(())
    } else {
        Err(TorError::Crypto("X25519 produced a non-contributory secret".into()))
    }
}

/// secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
fn secret_input(
    first: &SharedSecret,
    second: &SharedSecret,
    relay_id: &[u8; 20],
    b: &PublicKey,
    x: &PublicKey,
    y: &PublicKey,
) -> Zeroizing<Vec<u8>> {
    let mut input = Zeroizing::new(Vec::with_capacity(32 * 5 + 20 + PROTOID.len()));
    input.extend_from_slice(first.as_bytes());
    input.extend_from_slice(second.as_bytes());
    input.extend_from_slice(relay_id);
    input.extend_from_slice(b.as_bytes());
    input.extend_from_slice(x.as_bytes());
    input.extend_from_slice(y.as_bytes());
    input.extend_from_slice(PROTOID);
    input
}

fn hmac(key: &[u8], message: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| TorError::Crypto("HMAC key rejected".into()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

/// AUTH = H(verify | ID | B | Y | X | PROTOID | "Server", t_mac)
fn compute_auth(
    secret_input: &[u8],
    relay_id: &[u8; 20],
    b: &PublicKey,
    x: &PublicKey,
    y: &PublicKey,
) -> Result<[u8; 32]> {
    let verify = Zeroizing::new(hmac(T_VERIFY, secret_input)?);

    let mut auth_input = Vec::with_capacity(32 * 4 + 20 + PROTOID.len() + 6);
    auth_input.extend_from_slice(&verify[..]);
    auth_input.extend_from_slice(relay_id);
    auth_input.extend_from_slice(b.as_bytes());
    auth_input.extend_from_slice(y.as_bytes());
    auth_input.extend_from_slice(x.as_bytes());
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(b"Server");

    hmac(T_MAC, &auth_input)
}

/// KEY_SEED = H(secret_input, t_key), expanded into hop keys
fn derive_keys(secret_input: &[u8]) -> Result<CircuitKeys> {
    let key_seed = Zeroizing::new(hmac(T_KEY, secret_input)?);
    CircuitKeys::derive_from_secret(&key_seed[..])
}
