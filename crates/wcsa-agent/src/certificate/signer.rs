//! Signing through a store certificate

use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use der::asn1::Uint;
use der::{Decode, Sequence};
use ssh_key::Mpint;
use wcsa_protocol::{AgentSignature, PublicKeyEntry, SignFlags};

use super::oid;
use super::store::CertificateHandle;
use super::x509::{EcCurve, KeyFamily, ParsedCertificate};
use crate::backend::KeySigner;
use crate::error::{AgentError, Result, StoreError};

/// Signature algorithm requested from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    RsaSha1,
    RsaSha256,
    RsaSha384,
    RsaSha512,
    EcdsaSha256,
    EcdsaSha384,
    EcdsaSha512,
}

impl SignatureAlgorithm {
    pub fn oid(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaSha1 => oid::SHA1_WITH_RSA,
            SignatureAlgorithm::RsaSha256 => oid::SHA256_WITH_RSA,
            SignatureAlgorithm::RsaSha384 => oid::SHA384_WITH_RSA,
            SignatureAlgorithm::RsaSha512 => oid::SHA512_WITH_RSA,
            SignatureAlgorithm::EcdsaSha256 => oid::ECDSA_WITH_SHA256,
            SignatureAlgorithm::EcdsaSha384 => oid::ECDSA_WITH_SHA384,
            SignatureAlgorithm::EcdsaSha512 => oid::ECDSA_WITH_SHA512,
        }
    }

    /// Digest matching the curve size
    fn for_curve(curve: EcCurve) -> Self {
        match curve.bits() {
            0..=256 => SignatureAlgorithm::EcdsaSha256,
            257..=384 => SignatureAlgorithm::EcdsaSha384,
            _ => SignatureAlgorithm::EcdsaSha512,
        }
    }
}

/// A key living in the certificate store
pub struct CertificateSigner {
    handle: CertificateHandle,
    family: KeyFamily,
    entry: PublicKeyEntry,
}

impl CertificateSigner {
    /// Signer answering for the certificate's own public key
    pub fn new(handle: CertificateHandle, parsed: &ParsedCertificate) -> Result<Self> {
        let entry = PublicKeyEntry::from_blob(parsed.public_blob.clone(), parsed.common_name.clone())?;
        Ok(Self {
            handle,
            family: parsed.family,
            entry,
        })
    }

    /// Same key published under another identity (an OpenSSH certificate)
    pub fn with_identity(&self, blob: Vec<u8>, comment: String) -> Result<Self> {
        Ok(Self {
            handle: self.handle.try_clone(),
            family: self.family,
            entry: PublicKeyEntry::from_blob(blob, comment)?,
        })
    }

    /// Pick the store algorithm and SSH format for `flags`
    fn select(&self, flags: SignFlags) -> Result<(SignatureAlgorithm, &'static str)> {
        match self.family {
            KeyFamily::Rsa => match flags.bits() {
                0 => Ok((SignatureAlgorithm::RsaSha1, "ssh-rsa")),
                2 => Ok((SignatureAlgorithm::RsaSha256, "rsa-sha2-256")),
                4 => Ok((SignatureAlgorithm::RsaSha512, "rsa-sha2-512")),
                other => Err(AgentError::UnsupportedFlags(other)),
            },
            KeyFamily::Ecdsa(curve) if flags.is_default() => {
                Ok((SignatureAlgorithm::for_curve(curve), curve.key_format()))
            }
            KeyFamily::Ecdsa(curve) => Err(AgentError::AlgorithmSelectionUnsupported(
                curve.key_format().to_string(),
            )),
        }
    }
}

impl KeySigner for CertificateSigner {
    fn public_key(&self) -> &PublicKeyEntry {
        &self.entry
    }

    fn sign(&self, data: &[u8], flags: SignFlags) -> Result<AgentSignature> {
        let (algorithm, format) = self.select(flags)?;
        let envelope = self.handle.sign(algorithm.oid(), data)?;
        let signature = extract_signature(&envelope)?;

        let blob = match self.family {
            KeyFamily::Rsa => signature,
            KeyFamily::Ecdsa(_) => ecdsa_ssh_signature(&signature)?,
        };
        Ok(AgentSignature::new(format, blob))
    }
}

/// Encrypted digest of the first signer of a PKCS#7 SignedData envelope
pub fn extract_signature(envelope: &[u8]) -> std::result::Result<Vec<u8>, StoreError> {
    let envelope_err = |e: der::Error| StoreError::Envelope(e.to_string());

    let info = ContentInfo::from_der(envelope).map_err(envelope_err)?;
    if info.content_type != oid::SIGNED_DATA {
        return Err(StoreError::Envelope(format!(
            "unexpected content type {}",
            info.content_type
        )));
    }
    let signed: SignedData = info.content.decode_as().map_err(envelope_err)?;
    let signer = signed
        .signer_infos
        .0
        .iter()
        .next()
        .ok_or_else(|| StoreError::Envelope("no signer".to_string()))?;
    Ok(signer.signature.as_bytes().to_vec())
}

/// DER ECDSA-Sig-Value
#[derive(Sequence)]
struct EcdsaSigValue {
    r: Uint,
    s: Uint,
}

/// Re-encode a DER `(r, s)` pair as two SSH mpints
fn ecdsa_ssh_signature(der_sig: &[u8]) -> std::result::Result<Vec<u8>, StoreError> {
    use ssh_encoding::Encode;

    let sig = EcdsaSigValue::from_der(der_sig).map_err(|e| StoreError::Envelope(e.to_string()))?;
    let mut blob = Vec::new();
    for half in [sig.r, sig.s] {
        Mpint::from_positive_bytes(half.as_bytes())
            .and_then(|mpint| Ok(mpint.encode(&mut blob)?))
            .map_err(|e| StoreError::Envelope(e.to_string()))?;
    }
    Ok(blob)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::certificate::store::testing::MemoryProvider;
    use crate::certificate::store::CertificateStore;
    use crate::certificate::x509;
    use der::asn1::ObjectIdentifier;
    use der::Encode;
    use rcgen::ExtendedKeyUsagePurpose;

    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        match content.len() {
            n if n < 0x80 => out.push(n as u8),
            n if n < 0x100 => out.extend_from_slice(&[0x81, n as u8]),
            n => out.extend_from_slice(&[0x82, (n >> 8) as u8, n as u8]),
        }
        out.extend_from_slice(content);
        out
    }

    fn oid_der(s: &str) -> Vec<u8> {
        ObjectIdentifier::new(s).unwrap().to_der().unwrap()
    }

    fn seq(parts: &[Vec<u8>]) -> Vec<u8> {
        tlv(0x30, &parts.concat())
    }

    fn set(parts: &[Vec<u8>]) -> Vec<u8> {
        tlv(0x31, &parts.concat())
    }

    /// Minimal detached SignedData carrying one signer with `signature`
    pub(crate) fn pkcs7_envelope(signature: &[u8]) -> Vec<u8> {
        let one = vec![0x02, 0x01, 0x01];
        let sha256 = seq(&[oid_der("2.16.840.1.101.3.4.2.1")]);
        let signer_info = seq(&[
            one.clone(),
            seq(&[seq(&[]), one.clone()]),
            sha256.clone(),
            seq(&[oid_der("1.2.840.113549.1.1.1")]),
            tlv(0x04, signature),
        ]);
        let signed_data = seq(&[
            one,
            set(&[sha256]),
            seq(&[oid_der("1.2.840.113549.1.7.1")]),
            set(&[signer_info]),
        ]);
        seq(&[oid_der("1.2.840.113549.1.7.2"), tlv(0xA0, &signed_data)])
    }

    fn ecdsa_der(r: &[u8], s: &[u8]) -> Vec<u8> {
        EcdsaSigValue {
            r: Uint::new(r).unwrap(),
            s: Uint::new(s).unwrap(),
        }
        .to_der()
        .unwrap()
    }

    fn ec_signer(provider: Arc<MemoryProvider>) -> CertificateSigner {
        let store = CertificateStore::new(provider.clone());
        let handle = store.list().unwrap().pop().unwrap();
        let parsed = x509::parse(&handle.der()).unwrap();
        CertificateSigner::new(handle, &parsed).unwrap()
    }

    #[test]
    fn test_extract_signature() {
        let envelope = pkcs7_envelope(&[0xAA; 200]);
        assert_eq!(extract_signature(&envelope).unwrap(), vec![0xAA; 200]);
    }

    #[test]
    fn test_extract_rejects_other_content() {
        let data = seq(&[oid_der("1.2.840.113549.1.7.1"), tlv(0xA0, &tlv(0x04, b"x"))]);
        assert!(matches!(
            extract_signature(&data),
            Err(StoreError::Envelope(_))
        ));
        assert!(extract_signature(b"junk").is_err());
    }

    #[test]
    fn test_ecdsa_signature_conversion() {
        let blob = ecdsa_ssh_signature(&ecdsa_der(&[0x80, 0x01], &[0x00, 0x7F])).unwrap();
        let mut reader = &blob[..];
        let mut mpint = || <Vec<u8> as ssh_encoding::Decode>::decode(&mut reader).unwrap();
        assert_eq!(mpint(), [0x00, 0x80, 0x01]);
        assert_eq!(mpint(), [0x7F]);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_curve_digest_selection() {
        assert_eq!(
            SignatureAlgorithm::for_curve(EcCurve::NistP256).oid(),
            "1.2.840.10045.4.3.2"
        );
        assert_eq!(
            SignatureAlgorithm::for_curve(EcCurve::NistP384).oid(),
            "1.2.840.10045.4.3.3"
        );
        assert_eq!(
            SignatureAlgorithm::for_curve(EcCurve::NistP521).oid(),
            "1.2.840.10045.4.3.4"
        );
    }

    #[test]
    fn test_ecdsa_sign_through_store() {
        let (der, _) = x509::tests::ec_certificate(
            "card",
            &[9],
            vec![ExtendedKeyUsagePurpose::ClientAuth],
        );
        let mut provider = MemoryProvider::new(vec![der]);
        provider
            .envelopes
            .insert(0, pkcs7_envelope(&ecdsa_der(&[0x11; 32], &[0x22; 32])));
        let provider = Arc::new(provider);
        let signer = ec_signer(provider.clone());

        let sig = signer.sign(b"payload", SignFlags::default()).unwrap();
        assert_eq!(sig.format, "ecdsa-sha2-nistp256");
        let signed = provider.signed.lock().unwrap().clone();
        assert_eq!(
            signed,
            vec![(0, "1.2.840.10045.4.3.2".to_string(), b"payload".to_vec())]
        );

        assert!(matches!(
            signer.sign(b"payload", SignFlags::RSA_SHA2_512),
            Err(AgentError::AlgorithmSelectionUnsupported(_))
        ));
    }

    #[test]
    fn test_rsa_flag_selection() {
        let (der, _) = x509::tests::ec_certificate("rsa stand-in", &[1], Vec::new());
        let provider = Arc::new(MemoryProvider::new(vec![der]));
        let mut signer = ec_signer(provider);
        signer.family = KeyFamily::Rsa;

        let pick = |bits| signer.select(SignFlags::from_bits(bits));
        assert_eq!(pick(0).unwrap(), (SignatureAlgorithm::RsaSha1, "ssh-rsa"));
        assert_eq!(pick(2).unwrap(), (SignatureAlgorithm::RsaSha256, "rsa-sha2-256"));
        assert_eq!(pick(4).unwrap(), (SignatureAlgorithm::RsaSha512, "rsa-sha2-512"));
        assert!(matches!(pick(6), Err(AgentError::UnsupportedFlags(6))));
        assert!(matches!(pick(1), Err(AgentError::UnsupportedFlags(1))));
    }

    #[test]
    fn test_with_identity_duplicates_handle() {
        let (der, _) = x509::tests::ec_certificate("dup", &[2], Vec::new());
        let provider = Arc::new(MemoryProvider::new(vec![der]));
        let signer = ec_signer(provider.clone());
        assert_eq!(provider.live(), 1);

        let mut blob = Vec::new();
        ssh_encoding::Encode::encode(&"ecdsa-sha2-nistp256-cert-v01@openssh.com", &mut blob).unwrap();
        let cert_signer = signer
            .with_identity(blob, "key-id".to_string())
            .unwrap();
        assert_eq!(provider.live(), 2);
        assert_eq!(cert_signer.public_key().comment, "key-id");

        drop(signer);
        drop(cert_signer);
        assert_eq!(provider.live(), 0);
    }
}
