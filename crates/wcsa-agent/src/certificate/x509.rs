//! X.509 fields the agent needs

use der::asn1::{ObjectIdentifier, Uint};
use der::{Decode, Sequence};
use ssh_key::public::{EcdsaPublicKey, KeyData};
use ssh_key::Mpint;
use x509_cert::ext::pkix::ExtendedKeyUsage;
use x509_cert::Certificate;

use super::oid;
use crate::error::StoreError;

/// NIST curves usable for ECDSA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    NistP256,
    NistP384,
    NistP521,
}

impl EcCurve {
    fn from_oid(curve: &ObjectIdentifier) -> Option<Self> {
        [
            (oid::SECP256R1, EcCurve::NistP256),
            (oid::SECP384R1, EcCurve::NistP384),
            (oid::SECP521R1, EcCurve::NistP521),
        ]
        .into_iter()
        .find(|(id, _)| id == curve)
        .map(|(_, c)| c)
    }

    /// SSH key and signature format
    pub fn key_format(&self) -> &'static str {
        match self {
            EcCurve::NistP256 => "ecdsa-sha2-nistp256",
            EcCurve::NistP384 => "ecdsa-sha2-nistp384",
            EcCurve::NistP521 => "ecdsa-sha2-nistp521",
        }
    }

    pub fn bits(&self) -> usize {
        match self {
            EcCurve::NistP256 => 256,
            EcCurve::NistP384 => 384,
            EcCurve::NistP521 => 521,
        }
    }
}

/// Public key algorithm family of a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ecdsa(EcCurve),
}

/// Certificate fields extracted for the agent
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    pub family: KeyFamily,
    /// Public key in SSH wire encoding
    pub public_blob: Vec<u8>,
    /// `None` when the certificate has no EKU extension
    pub extended_key_usage: Option<Vec<ObjectIdentifier>>,
    /// Serial number as big-endian bytes
    pub serial: Vec<u8>,
    /// Last common name of the subject, empty if none
    pub common_name: String,
}

/// PKCS#1 RSAPublicKey
#[derive(Sequence)]
struct RsaPublicKey {
    modulus: Uint,
    public_exponent: Uint,
}

/// Parse a DER certificate
pub fn parse(der: &[u8]) -> Result<ParsedCertificate, StoreError> {
    let cert = Certificate::from_der(der)?;
    let tbs = &cert.tbs_certificate;
    let spki = &tbs.subject_public_key_info;

    let key_bytes = spki
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| StoreError::Certificate("public key is not octet aligned".to_string()))?;

    let algorithm = spki.algorithm.oid;
    let (family, public_blob) = if algorithm == oid::RSA_ENCRYPTION {
        (KeyFamily::Rsa, rsa_blob(key_bytes)?)
    } else if algorithm == oid::EC_PUBLIC_KEY {
        let curve_oid: ObjectIdentifier = spki
            .algorithm
            .parameters
            .as_ref()
            .ok_or_else(|| StoreError::Certificate("EC key without curve".to_string()))?
            .decode_as()?;
        let curve = EcCurve::from_oid(&curve_oid)
            .ok_or_else(|| StoreError::UnsupportedKey(format!("curve {}", curve_oid)))?;
        (KeyFamily::Ecdsa(curve), ecdsa_blob(key_bytes)?)
    } else {
        return Err(StoreError::UnsupportedKey(algorithm.to_string()));
    };

    let extended_key_usage = tbs
        .extensions
        .iter()
        .flatten()
        .find(|ext| ext.extn_id == oid::EXTENDED_KEY_USAGE)
        .map(|ext| ExtendedKeyUsage::from_der(ext.extn_value.as_bytes()))
        .transpose()?
        .map(|eku| eku.0);

    let common_name = tbs
        .subject
        .0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .filter(|atv| atv.oid == oid::COMMON_NAME)
        .last()
        .map(|atv| String::from_utf8_lossy(atv.value.value()).into_owned())
        .unwrap_or_default();

    Ok(ParsedCertificate {
        family,
        public_blob,
        extended_key_usage,
        serial: tbs.serial_number.as_bytes().to_vec(),
        common_name,
    })
}

fn key_error(e: ssh_key::Error) -> StoreError {
    StoreError::Certificate(e.to_string())
}

fn ssh_blob(key: KeyData) -> Result<Vec<u8>, StoreError> {
    ssh_key::PublicKey::from(key).to_bytes().map_err(key_error)
}

fn rsa_blob(key: &[u8]) -> Result<Vec<u8>, StoreError> {
    let rsa = RsaPublicKey::from_der(key)?;
    let public = ssh_key::public::RsaPublicKey {
        e: Mpint::from_positive_bytes(rsa.public_exponent.as_bytes()).map_err(key_error)?,
        n: Mpint::from_positive_bytes(rsa.modulus.as_bytes()).map_err(key_error)?,
    };
    ssh_blob(KeyData::Rsa(public))
}

/// `point` is the SEC1 encoding; its size picks the curve
fn ecdsa_blob(point: &[u8]) -> Result<Vec<u8>, StoreError> {
    let public = EcdsaPublicKey::from_sec1_bytes(point).map_err(key_error)?;
    ssh_blob(KeyData::Ecdsa(public))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use der::Encode;
    use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, SerialNumber};

    fn ssh_string(reader: &mut &[u8]) -> Vec<u8> {
        <Vec<u8> as ssh_encoding::Decode>::decode(reader).unwrap()
    }

    /// Self-signed P-256 certificate and its raw public point
    pub(crate) fn ec_certificate(
        common_name: &str,
        serial: &[u8],
        usages: Vec<ExtendedKeyUsagePurpose>,
    ) -> (Vec<u8>, Vec<u8>) {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));
        params.extended_key_usages = usages;
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.der().to_vec(), key.public_key_raw().to_vec())
    }

    #[test]
    fn test_parse_ec_certificate() {
        let (der, point) = ec_certificate(
            "Alice Card",
            &[0x01, 0x02],
            vec![ExtendedKeyUsagePurpose::ClientAuth],
        );
        let parsed = parse(&der).unwrap();

        assert_eq!(parsed.family, KeyFamily::Ecdsa(EcCurve::NistP256));
        assert_eq!(parsed.common_name, "Alice Card");
        assert_eq!(parsed.serial, vec![0x01, 0x02]);
        assert_eq!(parsed.extended_key_usage, Some(vec![oid::EKU_CLIENT_AUTH]));

        let mut reader = parsed.public_blob.as_slice();
        assert_eq!(ssh_string(&mut reader), b"ecdsa-sha2-nistp256");
        assert_eq!(ssh_string(&mut reader), b"nistp256");
        assert_eq!(ssh_string(&mut reader), point);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_missing_eku_is_none() {
        let (der, _) = ec_certificate("no usage", &[0x05], Vec::new());
        assert_eq!(parse(&der).unwrap().extended_key_usage, None);
    }

    #[test]
    fn test_ed25519_certificate_unsupported() {
        let params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let key = KeyPair::generate_for(&rcgen::PKCS_ED25519).unwrap();
        let der = params.self_signed(&key).unwrap().der().to_vec();
        assert!(matches!(parse(&der), Err(StoreError::UnsupportedKey(_))));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(parse(&[0x30, 0x03, 1, 2, 3]), Err(StoreError::Certificate(_))));
    }

    #[test]
    fn test_rsa_blob_layout() {
        let key = RsaPublicKey {
            modulus: Uint::new(&[0xC1, 0x00, 0x01]).unwrap(),
            public_exponent: Uint::new(&[0x01, 0x00, 0x01]).unwrap(),
        };
        let blob = rsa_blob(&key.to_der().unwrap()).unwrap();

        let mut reader = blob.as_slice();
        assert_eq!(ssh_string(&mut reader), b"ssh-rsa");
        assert_eq!(ssh_string(&mut reader), [0x01, 0x00, 0x01]);
        // High bit set, so the mpint gains a zero byte
        assert_eq!(ssh_string(&mut reader), [0x00, 0xC1, 0x00, 0x01]);
        assert!(reader.is_empty());
    }
}
