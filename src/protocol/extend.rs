//! EXTEND2 / EXTENDED2 relay message bodies

use super::cell::Reader;
use super::relay::{decode_link_specifiers, encode_link_specifiers, LinkSpecifier};
use crate::error::{Result, TorError};

/// RELAY_EXTEND2 body: NSPEC | specs | HTYPE | HLEN | HDATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extend2 {
    pub link_specifiers: Vec<LinkSpecifier>,
    pub handshake_type: u16,
    pub handshake: Vec<u8>,
}

impl Extend2 {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(128);
        encode_link_specifiers(&self.link_specifiers, &mut out);
        out.extend_from_slice(&self.handshake_type.to_be_bytes());
        let hlen = u16::try_from(self.handshake.len())
            .map_err(|_| TorError::ProtocolError("EXTEND2 handshake too long".into()))?;
        out.extend_from_slice(&hlen.to_be_bytes());
        out.extend_from_slice(&self.handshake);
        Ok(out)
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let link_specifiers = decode_link_specifiers(&mut r)?;
        let handshake_type = r.u16()?;
        let hlen = r.u16()? as usize;
        Ok(Self {
            link_specifiers,
            handshake_type,
            handshake: r.take(hlen)?.to_vec(),
        })
    }
}

/// RELAY_EXTENDED2 body: HLEN | HDATA, same layout as CREATED2
pub fn encode_extended2(handshake: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + handshake.len());
    out.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    out.extend_from_slice(handshake);
    out
}

pub fn decode_extended2(body: &[u8]) -> Result<Vec<u8>> {
    let mut r = Reader::new(body);
    let hlen = r.u16()? as usize;
    Ok(r.take(hlen)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_extend2_layout() {
        let msg = Extend2 {
            link_specifiers: vec![
                LinkSpecifier::Ipv4 {
                    address: Ipv4Addr::new(10, 1, 2, 3),
                    port: 443,
                },
                LinkSpecifier::LegacyId([7; 20]),
            ],
            handshake_type: 2,
            handshake: vec![1; 84],
        };
        let bytes = msg.encode().unwrap();
        // NSPEC, 2+6, 2+20, HTYPE, HLEN, HDATA
        assert_eq!(bytes.len(), 1 + 8 + 22 + 2 + 2 + 84);
        assert_eq!(&bytes[31..35], &[0, 2, 0, 84]);
        assert_eq!(Extend2::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_extended2_truncated() {
        let body = encode_extended2(&[3; 64]);
        assert_eq!(decode_extended2(&body).unwrap(), vec![3; 64]);
        assert!(decode_extended2(&body[..40]).is_err());
    }
}
