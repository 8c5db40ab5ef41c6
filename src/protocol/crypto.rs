//! Onion layer cryptography
//!
//! Each built hop owns a [`HopCrypto`]: a forward and backward stream cipher
//! plus a forward and backward running digest. Two flavors exist:
//! - NTOR hops: AES-128-CTR and SHA-1 digests, keys from HKDF-SHA256
//! - HS-NTOR rendezvous layers: AES-256-CTR and SHA3-256 digests, keys from SHAKE-256
//!
//! Ciphers are keyed with a zero IV and keep their counter for the life of the
//! hop. Dropping a `HopCrypto` scrubs cipher and digest state.

use super::cell::{CELL_BODY_LEN, RELAY_DIGEST_OFFSET, RELAY_RECOGNIZED_OFFSET};
use crate::error::{Result, TorError};
use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// Expansion label for NTOR key material
pub const NTOR_KEY_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Df | Db | Kf | Kb | KH
pub const NTOR_KEY_MATERIAL_LEN: usize = 20 + 20 + 16 + 16 + 20;

/// Df | Db | Kf | Kb for the rendezvous layer
pub const HS_KEY_MATERIAL_LEN: usize = 32 + 32 + 32 + 32;

/// Which cipher and digest a layer uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerFlavor {
    /// AES-128-CTR, SHA-1
    Tor1,
    /// AES-256-CTR, SHA3-256
    HsV3,
}

/// Which side of the handshake we were on.
///
/// The responder encrypts with the initiator's backward key and digests with
/// the initiator's backward seed, so its "forward" is the initiator's
/// "backward".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// Key material produced by a handshake
///
/// SECURITY: zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    #[zeroize(skip)]
    pub flavor: LayerFlavor,
    /// Forward digest seed (Df)
    pub forward_digest: Vec<u8>,
    /// Backward digest seed (Db)
    pub backward_digest: Vec<u8>,
    /// Forward key (Kf)
    pub forward_key: Vec<u8>,
    /// Backward key (Kb)
    pub backward_key: Vec<u8>,
    /// KH, only produced by NTOR
    pub nonce: Option<[u8; 20]>,
}

impl CircuitKeys {
    /// Expand an NTOR KEY_SEED
    ///
    /// ```text
    /// K = HKDF-SHA256-Expand(KEY_SEED, m_expand, 92)
    /// Df (20) | Db (20) | Kf (16) | Kb (16) | KH (20)
    /// ```
    pub fn derive_from_secret(key_seed: &[u8]) -> Result<Self> {
        // KEY_SEED is already an HMAC-SHA256 output, so it is used as the PRK
        // directly and the Extract step is skipped.
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| TorError::KeyDerivationFailed("invalid KEY_SEED length".into()))?;

        let mut okm = Zeroizing::new([0u8; NTOR_KEY_MATERIAL_LEN]);
        hkdf.expand(NTOR_KEY_EXPAND, &mut okm[..])
            .map_err(|_| TorError::KeyDerivationFailed("HKDF expand failed".into()))?;

        let mut nonce = [0u8; 20];
        nonce.copy_from_slice(&okm[72..92]);

        Ok(Self {
            flavor: LayerFlavor::Tor1,
            forward_digest: okm[0..20].to_vec(),
            backward_digest: okm[20..40].to_vec(),
            forward_key: okm[40..56].to_vec(),
            backward_key: okm[56..72].to_vec(),
            nonce: Some(nonce),
        })
    }

    /// Slice SHAKE-256 output from the HS-NTOR rendezvous handshake
    pub fn from_hs_key_material(okm: &[u8; HS_KEY_MATERIAL_LEN]) -> Self {
        Self {
            flavor: LayerFlavor::HsV3,
            forward_digest: okm[0..32].to_vec(),
            backward_digest: okm[32..64].to_vec(),
            forward_key: okm[64..96].to_vec(),
            backward_key: okm[96..128].to_vec(),
            nonce: None,
        }
    }
}

enum LayerCipher {
    Aes128(Aes128Ctr),
    Aes256(Aes256Ctr),
}

impl LayerCipher {
    fn new(flavor: LayerFlavor, key: &[u8]) -> Result<Self> {
        let iv = [0u8; 16];
        match flavor {
            LayerFlavor::Tor1 => Aes128Ctr::new_from_slices(key, &iv)
                .map(LayerCipher::Aes128)
                .map_err(|_| TorError::Crypto("AES-128 key must be 16 bytes".into())),
            LayerFlavor::HsV3 => Aes256Ctr::new_from_slices(key, &iv)
                .map(LayerCipher::Aes256)
                .map_err(|_| TorError::Crypto("AES-256 key must be 32 bytes".into())),
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            LayerCipher::Aes128(c) => c.apply_keystream(data),
            LayerCipher::Aes256(c) => c.apply_keystream(data),
        }
    }
}

enum RunningDigest {
    Sha1(Sha1),
    Sha3(Sha3_256),
}

impl RunningDigest {
    fn seeded(flavor: LayerFlavor, seed: &[u8]) -> Self {
        match flavor {
            LayerFlavor::Tor1 => {
                let mut h = Sha1::new();
                Digest::update(&mut h, seed);
                RunningDigest::Sha1(h)
            }
            LayerFlavor::HsV3 => {
                let mut h = Sha3_256::new();
                Digest::update(&mut h, seed);
                RunningDigest::Sha3(h)
            }
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            RunningDigest::Sha1(h) => Digest::update(h, data),
            RunningDigest::Sha3(h) => Digest::update(h, data),
        }
    }

    /// First four bytes of the digest so far, without consuming the state
    fn prefix(&self) -> [u8; 4] {
        let mut out = [0u8; 4];
        match self {
            RunningDigest::Sha1(h) => out.copy_from_slice(&h.clone().finalize()[..4]),
            RunningDigest::Sha3(h) => out.copy_from_slice(&h.clone().finalize()[..4]),
        }
        out
    }

    fn try_clone(&self) -> Self {
        match self {
            RunningDigest::Sha1(h) => RunningDigest::Sha1(h.clone()),
            RunningDigest::Sha3(h) => RunningDigest::Sha3(h.clone()),
        }
    }
}

impl Drop for RunningDigest {
    fn drop(&mut self) {
        match self {
            RunningDigest::Sha1(h) => Digest::reset(h),
            RunningDigest::Sha3(h) => Digest::reset(h),
        }
    }
}

/// Per-hop cipher and digest state
///
/// Created once when a hop's handshake completes. The ciphers come from
/// `aes`/`ctr` built with their `zeroize` feature, so key schedules and
/// keystream buffers are wiped when the hop is dropped.
pub struct HopCrypto {
    flavor: LayerFlavor,
    forward: LayerCipher,
    backward: LayerCipher,
    forward_digest: RunningDigest,
    backward_digest: RunningDigest,
    nonce: Option<Zeroizing<[u8; 20]>>,
}

impl std::fmt::Debug for CircuitKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitKeys")
            .field("flavor", &self.flavor)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for HopCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopCrypto")
            .field("flavor", &self.flavor)
            .finish_non_exhaustive()
    }
}

impl HopCrypto {
    pub fn new(keys: &CircuitKeys, role: HandshakeRole) -> Result<Self> {
        let (fwd_key, bwd_key, fwd_seed, bwd_seed) = match role {
            HandshakeRole::Initiator => (
                &keys.forward_key,
                &keys.backward_key,
                &keys.forward_digest,
                &keys.backward_digest,
            ),
            HandshakeRole::Responder => (
                &keys.backward_key,
                &keys.forward_key,
                &keys.backward_digest,
                &keys.forward_digest,
            ),
        };

        Ok(Self {
            flavor: keys.flavor,
            forward: LayerCipher::new(keys.flavor, fwd_key)?,
            backward: LayerCipher::new(keys.flavor, bwd_key)?,
            forward_digest: RunningDigest::seeded(keys.flavor, fwd_seed),
            backward_digest: RunningDigest::seeded(keys.flavor, bwd_seed),
            nonce: keys.nonce.map(Zeroizing::new),
        })
    }

    pub fn flavor(&self) -> LayerFlavor {
        self.flavor
    }

    /// KH from the NTOR handshake; binds ESTABLISH_INTRO to this hop
    pub fn nonce(&self) -> Option<&[u8; 20]> {
        self.nonce.as_deref()
    }

    /// Add this layer's forward encryption
    pub fn encrypt_forward(&mut self, payload: &mut [u8; CELL_BODY_LEN]) {
        self.forward.apply(payload);
    }

    /// Remove this layer's backward encryption
    pub fn decrypt_backward(&mut self, payload: &mut [u8; CELL_BODY_LEN]) {
        self.backward.apply(payload);
    }

    /// Stamp the digest field of a plaintext body with the forward digest.
    fn stamp_digest(&mut self, payload: &mut [u8; CELL_BODY_LEN]) {
        payload[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4].fill(0);
        self.forward_digest.update(&payload[..]);
        let prefix = self.forward_digest.prefix();
        payload[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4].copy_from_slice(&prefix);
    }

    /// Check whether a body with this layer already removed is addressed to
    /// us, committing the backward digest only on a match.
    fn check_recognized(&mut self, payload: &[u8; CELL_BODY_LEN]) -> bool {
        if payload[RELAY_RECOGNIZED_OFFSET..RELAY_RECOGNIZED_OFFSET + 2] != [0, 0] {
            return false;
        }

        let mut received = [0u8; 4];
        received.copy_from_slice(&payload[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4]);

        let mut zeroed = Zeroizing::new(*payload);
        zeroed[RELAY_DIGEST_OFFSET..RELAY_DIGEST_OFFSET + 4].fill(0);

        let mut candidate = self.backward_digest.try_clone();
        candidate.update(&zeroed[..]);

        if bool::from(candidate.prefix().ct_eq(&received)) {
            self.backward_digest = candidate;
            true
        } else {
            false
        }
    }
}

/// Encrypt an outbound relay body through `layers` (nearest hop first).
///
/// The last layer's forward digest stamps the body; then each layer's
/// forward cipher is applied from the farthest hop to the nearest.
pub fn originate(layers: &mut [&mut HopCrypto], payload: &mut [u8; CELL_BODY_LEN]) -> Result<()> {
    let (last, _) = layers
        .split_last_mut()
        .ok_or_else(|| TorError::InvalidState("no built hops to encrypt for".into()))?;
    last.stamp_digest(payload);

    for layer in layers.iter_mut().rev() {
        layer.encrypt_forward(payload);
    }
    Ok(())
}

/// Peel an inbound relay body layer by layer (nearest hop first).
///
/// Returns the index of the layer that recognized the cell. The body is left
/// fully decrypted up to that layer. No match is a protocol violation.
pub fn recognize(layers: &mut [&mut HopCrypto], payload: &mut [u8; CELL_BODY_LEN]) -> Result<usize> {
    for (idx, layer) in layers.iter_mut().enumerate() {
        layer.decrypt_backward(payload);
        if layer.check_recognized(payload) {
            return Ok(idx);
        }
    }
    Err(TorError::DigestMismatch)
}
