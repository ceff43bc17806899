//! CERTS cell parsing
//!
//! The responder's side of the link handshake carries a CERTS cell with a
//! short list of certificates. This module parses the cell body and the
//! ed25519 certificate envelope inside it. Chain trust is the transport
//! collaborator's decision and lives behind [`CertificateValidator`]; the
//! core only checks structure and exposes the keys.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::{Error, Result};

use super::cell::CellHeader;

/// Certificate types carried in a CERTS cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CertType {
    /// Type 1: link key certificate signed with the RSA identity (legacy)
    RsaLink = 1,
    /// Type 2: RSA1024 identity certificate (legacy)
    RsaId = 2,
    /// Type 3: RSA1024 AUTHENTICATE link certificate (legacy)
    RsaAuth = 3,
    /// Type 4: ed25519 signing key, signed with the ed25519 identity
    Ed25519SigningKey = 4,
    /// Type 5: TLS link certificate, signed with the ed25519 signing key
    Ed25519TlsLink = 5,
    /// Type 6: ed25519 AUTHENTICATE key, signed with the signing key
    Ed25519AuthKey = 6,
    /// Type 7: ed25519 identity, cross-signed by the RSA identity
    Ed25519Identity = 7,
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
            7 => Some(CertType::Ed25519Identity),
            _ => None,
        }
    }
}

/// One certificate entry from a CERTS cell, body left raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCert {
    pub cert_type: u8,
    pub data: Vec<u8>,
}

/// Parsed CERTS cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertsCell {
    pub header: CellHeader,
    pub certs: Vec<RawCert>,
}

impl CertsCell {
    /// Parse the body: a count byte, then (type, 2-byte length, data)
    /// entries.
    pub fn parse_body(header: CellHeader, body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Err(Error::BadPayloadData("empty CERTS cell".into()));
        }

        let n_certs = body[0] as usize;
        let mut offset = 1;
        let mut certs = Vec::with_capacity(n_certs);

        for i in 0..n_certs {
            if offset + 3 > body.len() {
                return Err(Error::BadPayloadData(format!(
                    "CERTS cell truncated at certificate {}",
                    i
                )));
            }
            let cert_type = body[offset];
            let cert_len = u16::from_be_bytes([body[offset + 1], body[offset + 2]]) as usize;
            offset += 3;

            if offset + cert_len > body.len() {
                return Err(Error::BadPayloadData(format!(
                    "certificate {} truncated: need {} bytes, have {}",
                    i,
                    cert_len,
                    body.len() - offset
                )));
            }
            certs.push(RawCert {
                cert_type,
                data: body[offset..offset + cert_len].to_vec(),
            });
            offset += cert_len;
        }

        Ok(Self { header, certs })
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = vec![self.certs.len() as u8];
        for cert in &self.certs {
            out.push(cert.cert_type);
            out.extend_from_slice(&(cert.data.len() as u16).to_be_bytes());
            out.extend_from_slice(&cert.data);
        }
        out
    }

    /// First certificate of a given type.
    pub fn get_cert(&self, cert_type: CertType) -> Option<&RawCert> {
        self.certs.iter().find(|c| c.cert_type == cert_type as u8)
    }

    /// The relay's ed25519 identity key, from the type-7 cross-cert.
    pub fn ed25519_identity(&self) -> Option<[u8; 32]> {
        let cert = self.get_cert(CertType::Ed25519Identity)?;
        Ed25519Cert::parse(&cert.data).ok().map(|c| c.certified_key)
    }

    /// The relay's ed25519 signing key, from the type-4 certificate.
    pub fn ed25519_signing_key(&self) -> Option<[u8; 32]> {
        let cert = self.get_cert(CertType::Ed25519SigningKey)?;
        Ed25519Cert::parse(&cert.data).ok().map(|c| c.certified_key)
    }

    /// Structural sanity check: a responder must present a signing-key
    /// certificate we can extract a key from.
    pub fn quick_check(&self) -> Result<()> {
        if self.get_cert(CertType::Ed25519SigningKey).is_none() {
            return Err(Error::BadPayloadData(
                "CERTS cell is missing the signing key certificate".into(),
            ));
        }
        if self.ed25519_signing_key().is_none() && self.ed25519_identity().is_none() {
            return Err(Error::BadPayloadData(
                "CERTS cell carries no usable ed25519 key".into(),
            ));
        }
        Ok(())
    }
}

/// The ed25519 certificate envelope:
/// VERSION (1) | CERT_TYPE (1) | EXPIRATION (4, hours since epoch) |
/// CERT_KEY_TYPE (1) | CERTIFIED_KEY (32) | N_EXTENSIONS (1) |
/// extensions | SIGNATURE (64).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ed25519Cert {
    pub version: u8,
    pub cert_type: u8,
    pub expiration_hours: u32,
    pub cert_key_type: u8,
    pub certified_key: [u8; 32],
    /// Everything the signature covers.
    pub signed_body: Vec<u8>,
    pub signature: [u8; 64],
}

impl Ed25519Cert {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 104 {
            return Err(Error::BadPayloadData(format!(
                "ed25519 certificate is {} bytes, need at least 104",
                data.len()
            )));
        }

        let version = data[0];
        if version != 0x01 {
            return Err(Error::BadPayloadData(format!(
                "unknown ed25519 certificate version: {}",
                version
            )));
        }

        let cert_type = data[1];
        let expiration_hours = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let cert_key_type = data[6];
        let mut certified_key = [0u8; 32];
        certified_key.copy_from_slice(&data[7..39]);

        let n_extensions = data[39];
        let mut offset = 40;
        for _ in 0..n_extensions {
            if offset + 4 > data.len() {
                return Err(Error::BadPayloadData(
                    "ed25519 certificate extension header truncated".into(),
                ));
            }
            let ext_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            offset += 4 + ext_len;
        }

        if data.len() < offset + 64 {
            return Err(Error::BadPayloadData(
                "ed25519 certificate signature truncated".into(),
            ));
        }

        let sig_start = data.len() - 64;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[sig_start..]);

        Ok(Self {
            version,
            cert_type,
            expiration_hours,
            cert_key_type,
            certified_key,
            signed_body: data[..sig_start].to_vec(),
            signature,
        })
    }

    /// Verify the envelope signature with the given ed25519 key.
    pub fn verify_signature(&self, signing_key: &[u8; 32]) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(signing_key)
            .map_err(|e| Error::BadPayloadData(format!("invalid ed25519 key: {}", e)))?;
        let signature = Signature::from_bytes(&self.signature);
        verifying_key
            .verify(&self.signed_body, &signature)
            .map_err(|_| Error::HandshakeFailed("certificate signature invalid".into()))
    }

    /// Whether the certificate has expired, given the current time in
    /// hours since the epoch. The caller supplies the clock.
    pub fn is_expired_at(&self, now_hours: u32) -> bool {
        self.expiration_hours < now_hours
    }
}

/// Trust decisions for a responder's certificate chain. The TLS transport
/// owns policy; the core hands it the parsed cell.
pub trait CertificateValidator {
    fn validate(&self, certs: &CertsCell, expected_fingerprint: &[u8; 20]) -> Result<()>;
}

/// A validator that only performs the structural check. Useful in tests
/// and for callers that pin trust elsewhere.
#[derive(Debug, Default)]
pub struct StructuralValidator;

impl CertificateValidator for StructuralValidator {
    fn validate(&self, certs: &CertsCell, _expected_fingerprint: &[u8; 20]) -> Result<()> {
        certs.quick_check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn make_ed_cert(signer: &SigningKey, cert_type: u8, certified_key: [u8; 32]) -> Vec<u8> {
        let mut body = vec![0x01, cert_type];
        body.extend_from_slice(&u32::MAX.to_be_bytes()); // far-future expiry
        body.push(0x01); // certified key type
        body.extend_from_slice(&certified_key);
        body.push(0); // no extensions
        let sig = signer.sign(&body);
        body.extend_from_slice(&sig.to_bytes());
        body
    }

    fn header() -> CellHeader {
        CellHeader::new(0, 3)
    }

    #[test]
    fn test_empty_certs_cell_rejected() {
        assert!(CertsCell::parse_body(header(), &[]).is_err());
    }

    #[test]
    fn test_zero_certs() {
        let cell = CertsCell::parse_body(header(), &[0]).unwrap();
        assert!(cell.certs.is_empty());
        assert_eq!(cell.encode_body(), vec![0]);
    }

    #[test]
    fn test_certs_round_trip() {
        let signer = SigningKey::from_bytes(&[7u8; 32]);
        let signing_key_cert = make_ed_cert(&signer, 4, [0x21; 32]);
        let mut body = vec![1u8, 4];
        body.extend_from_slice(&(signing_key_cert.len() as u16).to_be_bytes());
        body.extend_from_slice(&signing_key_cert);

        let cell = CertsCell::parse_body(header(), &body).unwrap();
        assert_eq!(cell.certs.len(), 1);
        assert_eq!(cell.encode_body(), body);
        assert_eq!(cell.ed25519_signing_key(), Some([0x21; 32]));
        assert!(cell.quick_check().is_ok());
    }

    #[test]
    fn test_truncated_cert_rejected() {
        let body = [1u8, 4, 0, 50, 0xaa];
        assert!(CertsCell::parse_body(header(), &body).is_err());
    }

    #[test]
    fn test_ed25519_cert_signature() {
        let identity = SigningKey::from_bytes(&[9u8; 32]);
        let identity_pub: [u8; 32] = identity.verifying_key().to_bytes();
        let cert_bytes = make_ed_cert(&identity, 4, [0x33; 32]);

        let cert = Ed25519Cert::parse(&cert_bytes).unwrap();
        assert_eq!(cert.certified_key, [0x33; 32]);
        assert!(cert.verify_signature(&identity_pub).is_ok());
        assert!(!cert.is_expired_at(1_000_000));

        let other = SigningKey::from_bytes(&[10u8; 32]).verifying_key().to_bytes();
        assert!(cert.verify_signature(&other).is_err());
    }

    #[test]
    fn test_expiry_check() {
        let signer = SigningKey::from_bytes(&[7u8; 32]);
        let mut body = vec![0x01, 4];
        body.extend_from_slice(&100u32.to_be_bytes()); // expired long ago
        body.push(0x01);
        body.extend_from_slice(&[0x44; 32]);
        body.push(0);
        let sig = signer.sign(&body);
        body.extend_from_slice(&sig.to_bytes());

        let cert = Ed25519Cert::parse(&body).unwrap();
        assert!(cert.is_expired_at(101));
        assert!(!cert.is_expired_at(99));
    }
}
