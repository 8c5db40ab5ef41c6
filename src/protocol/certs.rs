//! Tor certificate verification
//!
//! Parsing of the CERTS cell and verification of the relay's Ed25519
//! certificate chain:
//!
//! - type 4: signing key, signed by the Ed25519 identity carried in the
//!   signed-with-key extension
//! - type 5: TLS link certificate digest, signed by the signing key
//!
//! plus the legacy RSA identity key from the type 2 X.509 certificate,
//! which must hash to the relay's fingerprint.
//!
//! Without this check an attacker on the path could impersonate any relay.

use super::cell::CertEntry;
use crate::error::{Result, TorError};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use x509_cert::der::asn1::ObjectIdentifier;
use x509_cert::der::Decode;
use x509_cert::Certificate;

/// Certificate types carried in a CERTS cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CertType {
    RsaLink = 1,
    RsaId = 2,
    RsaAuth = 3,
    /// Ed25519 signing key, signed with the Ed25519 identity key
    Ed25519SigningKey = 4,
    /// TLS link certificate, signed with the signing key
    Ed25519TlsLink = 5,
    /// AUTHENTICATE cell key, signed with the signing key
    Ed25519AuthKey = 6,
    /// Ed25519 identity cross-certified by the RSA identity
    RsaCrossCert = 7,
}

impl CertType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(CertType::RsaLink),
            2 => Some(CertType::RsaId),
            3 => Some(CertType::RsaAuth),
            4 => Some(CertType::Ed25519SigningKey),
            5 => Some(CertType::Ed25519TlsLink),
            6 => Some(CertType::Ed25519AuthKey),
            7 => Some(CertType::RsaCrossCert),
            _ => None,
        }
    }
}

/// Key type for an Ed25519 public key
pub const CERT_KEY_ED25519: u8 = 0x01;
/// Key type for a SHA-256 digest of an X.509 certificate
pub const CERT_KEY_SHA256_X509: u8 = 0x03;

const EXT_SIGNED_WITH_KEY: u8 = 0x04;
const EXT_FLAG_AFFECTS_VALIDATION: u8 = 0x01;
const CERT_HEADER_LEN: usize = 40;
const SIGNATURE_LEN: usize = 64;

/// Parsed Ed25519 certificate (tor-cert format)
///
/// ```text
/// VERSION(1)=1 | CERT_TYPE(1) | EXPIRATION(4, hours) | CERT_KEY_TYPE(1)
/// | CERTIFIED_KEY(32) | N_EXTENSIONS(1) | EXTENSIONS | SIGNATURE(64)
/// ```
#[derive(Debug, Clone)]
pub struct Ed25519Certificate {
    pub cert_type: u8,
    /// Hours since the Unix epoch
    pub expiration_hours: u32,
    pub cert_key_type: u8,
    pub certified_key: [u8; 32],
    /// Key from the signed-with-key extension
    pub signed_with: Option<[u8; 32]>,
    /// Everything covered by the signature
    signed_bytes: Vec<u8>,
    signature: [u8; SIGNATURE_LEN],
}

impl Ed25519Certificate {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CERT_HEADER_LEN + SIGNATURE_LEN {
            return Err(TorError::CertificateError(format!(
                "Certificate too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != 0x01 {
            return Err(TorError::CertificateError(format!(
                "Unknown certificate version: {}",
                data[0]
            )));
        }

        let cert_type = data[1];
        let expiration_hours = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let cert_key_type = data[6];
        let mut certified_key = [0u8; 32];
        certified_key.copy_from_slice(&data[7..39]);

        let sig_start = data.len() - SIGNATURE_LEN;
        let n_extensions = data[39];
        let mut offset = CERT_HEADER_LEN;
        let mut signed_with = None;

        for _ in 0..n_extensions {
            if offset + 4 > sig_start {
                return Err(TorError::CertificateError("Extension header truncated".into()));
            }
            let ext_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            let ext_type = data[offset + 2];
            let ext_flags = data[offset + 3];
            let body_start = offset + 4;
            if body_start + ext_len > sig_start {
                return Err(TorError::CertificateError("Extension body truncated".into()));
            }
            let body = &data[body_start..body_start + ext_len];

            match ext_type {
                EXT_SIGNED_WITH_KEY if ext_len == 32 => {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(body);
                    signed_with = Some(key);
                }
                EXT_SIGNED_WITH_KEY => {
                    return Err(TorError::CertificateError(format!(
                        "signed-with-key extension has length {}",
                        ext_len
                    )))
                }
                _ if ext_flags & EXT_FLAG_AFFECTS_VALIDATION != 0 => {
                    return Err(TorError::CertificateError(format!(
                        "Unknown critical extension {}",
                        ext_type
                    )))
                }
                _ => {}
            }
            offset = body_start + ext_len;
        }

        if offset != sig_start {
            return Err(TorError::CertificateError(format!(
                "{} trailing bytes before signature",
                sig_start - offset
            )));
        }

        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&data[sig_start..]);

        Ok(Self {
            cert_type,
            expiration_hours,
            cert_key_type,
            certified_key,
            signed_with,
            signed_bytes: data[..sig_start].to_vec(),
            signature,
        })
    }

    /// Verify the signature against `signing_key`
    pub fn verify_signature(&self, signing_key: &[u8; 32]) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(signing_key)
            .map_err(|e| TorError::CertificateError(format!("Invalid signing key: {}", e)))?;
        let signature = Signature::from_bytes(&self.signature);
        verifying_key
            .verify(&self.signed_bytes, &signature)
            .map_err(|e| TorError::CertificateError(format!("Signature verification failed: {}", e)))
    }

    pub fn is_expired_at(&self, now_hours: u32) -> bool {
        self.expiration_hours < now_hours
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_hours())
    }

    /// Issue a certificate signed by `signer`. Relays and link credentials
    /// use this to produce their own chains.
    pub fn issue(
        cert_type: CertType,
        cert_key_type: u8,
        certified_key: &[u8; 32],
        expiration_hours: u32,
        include_signer: bool,
        signer: &SigningKey,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(CERT_HEADER_LEN + 36 + SIGNATURE_LEN);
        out.push(0x01);
        out.push(cert_type as u8);
        out.extend_from_slice(&expiration_hours.to_be_bytes());
        out.push(cert_key_type);
        out.extend_from_slice(certified_key);
        if include_signer {
            out.push(1);
            out.extend_from_slice(&32u16.to_be_bytes());
            out.push(EXT_SIGNED_WITH_KEY);
            out.push(0);
            out.extend_from_slice(signer.verifying_key().as_bytes());
        } else {
            out.push(0);
        }
        let signature = signer.sign(&out);
        out.extend_from_slice(&signature.to_bytes());
        out
    }
}

/// Current time in the certificate expiration unit
pub fn now_hours() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (secs / 3600) as u32
}

/// rsaEncryption
pub const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// A relay's legacy RSA identity key, PKCS#1 `RSAPublicKey` in DER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaIdentityKey(Vec<u8>);

impl RsaIdentityKey {
    /// Extract the subject key of the self-signed identity certificate.
    ///
    /// The certificate's own RSA signature is not checked; the key is bound
    /// to the relay by its fingerprint instead.
    pub fn from_x509(cert_der: &[u8]) -> Result<Self> {
        let cert = Certificate::from_der(cert_der).map_err(|e| {
            TorError::CertificateError(format!("Malformed RSA identity certificate: {}", e))
        })?;
        let spki = cert.tbs_certificate.subject_public_key_info;
        if spki.algorithm.oid != RSA_ENCRYPTION {
            return Err(TorError::CertificateError(format!(
                "Identity certificate carries a non-RSA key ({})",
                spki.algorithm.oid
            )));
        }
        let key = spki.subject_public_key.as_bytes().ok_or_else(|| {
            TorError::CertificateError("Identity key is not a whole number of bytes".into())
        })?;
        Ok(Self(key.to_vec()))
    }

    pub fn as_der(&self) -> &[u8] {
        &self.0
    }

    /// SHA-1 of the key: the relay fingerprint
    pub fn fingerprint(&self) -> [u8; 20] {
        Sha1::digest(&self.0).into()
    }

    /// SHA-256 of the key, as used for CID/SID in AUTHENTICATE
    pub fn sha256(&self) -> [u8; 32] {
        Sha256::digest(&self.0).into()
    }
}

/// Parsed CERTS cell
#[derive(Debug)]
pub struct CertsCell {
    pub certificates: Vec<CertEntry>,
}

impl CertsCell {
    pub fn new(certificates: Vec<CertEntry>) -> Result<Self> {
        let mut seen = [false; 256];
        for cert in &certificates {
            if std::mem::replace(&mut seen[cert.cert_type as usize], true) {
                return Err(TorError::CertificateError(format!(
                    "Duplicate certificate of type {}",
                    cert.cert_type
                )));
            }
        }
        Ok(Self { certificates })
    }

    pub fn get_cert(&self, cert_type: CertType) -> Option<&CertEntry> {
        self.certificates
            .iter()
            .find(|c| c.cert_type == cert_type as u8)
    }

    fn ed25519(&self, cert_type: CertType) -> Result<Ed25519Certificate> {
        let entry = self.get_cert(cert_type).ok_or_else(|| {
            TorError::CertificateError(format!("Missing certificate of type {}", cert_type as u8))
        })?;
        let cert = Ed25519Certificate::parse(&entry.body)?;
        if cert.cert_type != cert_type as u8 {
            return Err(TorError::CertificateError(format!(
                "Certificate slot {} holds a type {} certificate",
                cert_type as u8, cert.cert_type
            )));
        }
        Ok(cert)
    }
}

/// Identity keys proven by a verified CERTS cell
#[derive(Debug, Clone)]
pub struct VerifiedRelay {
    pub ed25519_identity: [u8; 32],
    pub ed25519_signing_key: [u8; 32],
    pub rsa_identity: RsaIdentityKey,
}

/// Verify a responder's CERTS cell against the TLS certificate it presented.
///
/// `rsa_fingerprint` is the relay's legacy identity digest. `expected_identity`
/// is the Ed25519 identity from the relay record, when the directory knows it.
pub fn verify_relay_certs(
    certs: &CertsCell,
    tls_cert_der: Option<&[u8]>,
    rsa_fingerprint: &[u8; 20],
    expected_identity: Option<&[u8; 32]>,
    now_hours: u32,
) -> Result<VerifiedRelay> {
    let rsa_cert = certs.get_cert(CertType::RsaId).ok_or_else(|| {
        TorError::CertificateError("Missing RSA identity certificate".into())
    })?;
    let rsa_identity = RsaIdentityKey::from_x509(&rsa_cert.body)?;
    if &rsa_identity.fingerprint() != rsa_fingerprint {
        return Err(TorError::CertificateError("RSA identity does not match relay fingerprint".into()));
    }

    let signing = certs.ed25519(CertType::Ed25519SigningKey)?;
    let identity = signing.signed_with.ok_or_else(|| {
        TorError::CertificateError("Signing key certificate lacks signed-with-key".into())
    })?;
    if signing.cert_key_type != CERT_KEY_ED25519 {
        return Err(TorError::CertificateError("Signing key certificate certifies a non-Ed25519 key".into()));
    }
    if signing.is_expired_at(now_hours) {
        return Err(TorError::CertificateError("Signing key certificate is expired".into()));
    }
    signing.verify_signature(&identity)?;

    let link = certs.ed25519(CertType::Ed25519TlsLink)?;
    if link.cert_key_type != CERT_KEY_SHA256_X509 {
        return Err(TorError::CertificateError("Link certificate does not certify a TLS digest".into()));
    }
    if link.is_expired_at(now_hours) {
        return Err(TorError::CertificateError("Link certificate is expired".into()));
    }
    link.verify_signature(&signing.certified_key)?;

    let tls_cert = tls_cert_der
        .ok_or_else(|| TorError::CertificateError("Peer presented no TLS certificate".into()))?;
    let digest: [u8; 32] = Sha256::digest(tls_cert).into();
    if digest != link.certified_key {
        return Err(TorError::CertificateError("Link certificate does not match the TLS certificate".into()));
    }

    if let Some(expected) = expected_identity {
        if expected != &identity {
            return Err(TorError::CertificateError("Relay Ed25519 identity mismatch".into()));
        }
    }

    log::debug!("🔐 Relay certificates verified (identity {})", hex::encode(&identity[..4]));
    Ok(VerifiedRelay {
        ed25519_identity: identity,
        ed25519_signing_key: signing.certified_key,
        rsa_identity,
    })
}


#[cfg(test)]
mod tests {
    use super::testing::{rsa_identity, rsa_identity_cert};
    use super::*;
    use rand::rngs::OsRng;

    struct Chain {
        identity: SigningKey,
        certs: Vec<CertEntry>,
        tls_cert: Vec<u8>,
        fingerprint: [u8; 20],
    }

    fn chain(expiry: u32) -> Chain {
        let identity = SigningKey::generate(&mut OsRng);
        let signing = SigningKey::generate(&mut OsRng);
        let tls_cert = b"not really DER".to_vec();
        let tls_digest: [u8; 32] = Sha256::digest(&tls_cert).into();
        let (rsa_key, rsa_cert) = rsa_identity(3);

        let type4 = Ed25519Certificate::issue(
            CertType::Ed25519SigningKey,
            CERT_KEY_ED25519,
            signing.verifying_key().as_bytes(),
            expiry,
            true,
            &identity,
        );
        let type5 = Ed25519Certificate::issue(
            CertType::Ed25519TlsLink,
            CERT_KEY_SHA256_X509,
            &tls_digest,
            expiry,
            false,
            &signing,
        );
        Chain {
            identity,
            certs: vec![
                CertEntry { cert_type: 2, body: rsa_cert },
                CertEntry { cert_type: 4, body: type4 },
                CertEntry { cert_type: 5, body: type5 },
            ],
            tls_cert,
            fingerprint: Sha1::digest(&rsa_key).into(),
        }
    }

    #[test]
    fn test_cert_type_parsing() {
        assert_eq!(CertType::from_u8(4), Some(CertType::Ed25519SigningKey));
        assert_eq!(CertType::from_u8(7), Some(CertType::RsaCrossCert));
        assert_eq!(CertType::from_u8(99), None);
    }

    #[test]
    fn test_issue_then_parse() {
        let c = chain(500_000);
        let cert = Ed25519Certificate::parse(&c.certs[1].body).unwrap();
        assert_eq!(cert.cert_type, 4);
        assert_eq!(cert.expiration_hours, 500_000);
        assert_eq!(cert.signed_with, Some(*c.identity.verifying_key().as_bytes()));
        assert!(cert.verify_signature(c.identity.verifying_key().as_bytes()).is_ok());
    }

    #[test]
    fn test_valid_chain() {
        let c = chain(500_000);
        let certs = CertsCell::new(c.certs).unwrap();
        let id = *c.identity.verifying_key().as_bytes();
        let verified =
            verify_relay_certs(&certs, Some(&c.tls_cert), &c.fingerprint, Some(&id), 400_000).unwrap();
        assert_eq!(verified.ed25519_identity, id);
        assert_eq!(verified.rsa_identity.fingerprint(), c.fingerprint);
    }

    #[test]
    fn test_expired_chain_rejected() {
        let c = chain(100);
        let certs = CertsCell::new(c.certs).unwrap();
        assert!(verify_relay_certs(&certs, Some(&c.tls_cert), &c.fingerprint, None, 400_000).is_err());
    }

    #[test]
    fn test_wrong_tls_cert_rejected() {
        let c = chain(500_000);
        let certs = CertsCell::new(c.certs).unwrap();
        let err = verify_relay_certs(&certs, Some(b"other"), &c.fingerprint, None, 400_000).unwrap_err();
        assert!(matches!(err, TorError::CertificateError(_)));
        assert!(verify_relay_certs(&certs, None, &c.fingerprint, None, 400_000).is_err());
    }

    #[test]
    fn test_identity_mismatch_rejected() {
        let c = chain(500_000);
        let certs = CertsCell::new(c.certs).unwrap();
        assert!(verify_relay_certs(&certs, Some(&c.tls_cert), &c.fingerprint, Some(&[9; 32]), 400_000).is_err());
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let mut c = chain(500_000);
        c.certs[2].body[10] ^= 0xff;
        let certs = CertsCell::new(c.certs).unwrap();
        assert!(verify_relay_certs(&certs, Some(&c.tls_cert), &c.fingerprint, None, 400_000).is_err());
    }

    #[test]
    fn test_duplicate_and_missing() {
        let c = chain(500_000);
        let mut dup = c.certs.clone();
        dup.push(c.certs[0].clone());
        assert!(CertsCell::new(dup).is_err());

        let certs = CertsCell::new(vec![c.certs[0].clone(), c.certs[1].clone()]).unwrap();
        assert!(verify_relay_certs(&certs, Some(&c.tls_cert), &c.fingerprint, None, 400_000).is_err());
    }

    #[test]
    fn test_rsa_identity_key_extracted() {
        let (key, cert) = rsa_identity(7);
        let identity = RsaIdentityKey::from_x509(&cert).unwrap();
        assert_eq!(identity.as_der(), &key[..]);
        assert_eq!(identity.as_der().len(), 140);
        assert_eq!(identity.sha256(), <[u8; 32]>::from(Sha256::digest(&key)));
        // the digest covers the key, not the certificate around it
        assert_ne!(identity.sha256(), <[u8; 32]>::from(Sha256::digest(&cert)));
    }

    #[test]
    fn test_rsa_identity_bound_to_fingerprint() {
        let c = chain(500_000);
        let certs = CertsCell::new(c.certs.clone()).unwrap();
        let err = verify_relay_certs(&certs, Some(&c.tls_cert), &[0xab; 20], None, 400_000).unwrap_err();
        assert!(matches!(err, TorError::CertificateError(msg) if msg.contains("fingerprint")));

        let without_rsa = CertsCell::new(c.certs[1..].to_vec()).unwrap();
        let err = verify_relay_certs(&without_rsa, Some(&c.tls_cert), &c.fingerprint, None, 400_000)
            .unwrap_err();
        assert!(matches!(err, TorError::CertificateError(_)));
    }

    #[test]
    fn test_non_rsa_identity_rejected() {
        let ed25519 = ObjectIdentifier::new_unwrap("1.3.101.112");
        let cert = rsa_identity_cert(&[4; 32], ed25519);
        assert!(RsaIdentityKey::from_x509(&cert).is_err());
        assert!(RsaIdentityKey::from_x509(b"not der").is_err());
    }

    #[test]
    fn test_short_certificate() {
        assert!(Ed25519Certificate::parse(&[1u8; 50]).is_err());
    }
}
