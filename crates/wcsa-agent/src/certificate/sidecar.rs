//! OpenSSH certificates stored next to the agent
//!
//! A smart card certificate can be paired with an OpenSSH certificate
//! issued for the same key. The agent looks for `<serial>-cert.pub` (serial
//! in decimal) and then `<common name>-cert.pub`.

use std::fs;
use std::path::{Path, PathBuf};

use ssh_key::{Certificate, PublicKey};

/// Render big-endian serial bytes as a decimal string
pub fn serial_to_decimal(serial: &[u8]) -> String {
    let mut digits = Vec::new();
    let mut value: Vec<u8> = serial.iter().copied().skip_while(|&b| b == 0).collect();

    while !value.is_empty() {
        let mut remainder = 0u32;
        let mut quotient = Vec::with_capacity(value.len());
        for byte in &value {
            let acc = (remainder << 8) | u32::from(*byte);
            let q = (acc / 10) as u8;
            remainder = acc % 10;
            if !(quotient.is_empty() && q == 0) {
                quotient.push(q);
            }
        }
        digits.push(b'0' + remainder as u8);
        value = quotient;
    }

    if digits.is_empty() {
        return "0".to_string();
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

fn candidates(dir: &Path, serial: &[u8], common_name: &str) -> Vec<PathBuf> {
    let mut paths = vec![dir.join(format!("{}-cert.pub", serial_to_decimal(serial)))];
    // A name with separators would point outside the directory
    if !common_name.is_empty() && !common_name.contains(['/', '\\']) && common_name != ".." {
        paths.push(dir.join(format!("{}-cert.pub", common_name)));
    }
    paths
}

/// Load an OpenSSH certificate for the key `public_blob`
///
/// Returns the certificate's wire encoding and its key id. A certificate
/// issued for a different key is ignored.
pub fn load(
    dir: &Path,
    serial: &[u8],
    common_name: &str,
    public_blob: &[u8],
) -> Option<(Vec<u8>, String)> {
    let (path, cert) = candidates(dir, serial, common_name)
        .into_iter()
        .find_map(|path| {
            let text = fs::read_to_string(&path).ok()?;
            match Certificate::from_openssh(text.trim()) {
                Ok(cert) => Some((path, cert)),
                Err(e) => {
                    tracing::warn!(?path, error = %e, "Ignoring unreadable OpenSSH certificate");
                    None
                }
            }
        })?;

    let embedded = PublicKey::from(cert.public_key().clone()).to_bytes().ok()?;
    if embedded != public_blob {
        tracing::warn!(?path, "OpenSSH certificate is for a different key, ignoring it");
        return None;
    }

    let blob = cert.to_bytes().ok()?;
    tracing::debug!(?path, key_id = cert.key_id(), "Loaded OpenSSH certificate");
    Some((blob, cert.key_id().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use ssh_key::certificate::{Builder, CertType};
    use ssh_key::{Algorithm, PrivateKey};
    use tempfile::TempDir;

    fn issue(subject: &PrivateKey, key_id: &str) -> Certificate {
        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            subject.public_key().key_data().clone(),
            0,
            u64::MAX - 1,
        )
        .unwrap();
        builder.serial(7).unwrap();
        builder.key_id(key_id).unwrap();
        builder.cert_type(CertType::User).unwrap();
        builder.valid_principal("alice").unwrap();
        builder.sign(&ca).unwrap()
    }

    fn blob(key: &PrivateKey) -> Vec<u8> {
        key.public_key().to_bytes().unwrap()
    }

    #[test]
    fn test_serial_to_decimal() {
        assert_eq!(serial_to_decimal(&[]), "0");
        assert_eq!(serial_to_decimal(&[0x00]), "0");
        assert_eq!(serial_to_decimal(&[0x01, 0x02]), "258");
        assert_eq!(serial_to_decimal(&[0x00, 0xFF]), "255");
        assert_eq!(
            serial_to_decimal(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
            "18446744073709551616"
        );
    }

    #[test]
    fn test_load_by_serial() {
        let dir = TempDir::new().unwrap();
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let cert = issue(&key, "alice@corp");
        fs::write(dir.path().join("258-cert.pub"), cert.to_openssh().unwrap()).unwrap();

        let (cert_blob, key_id) = load(dir.path(), &[1, 2], "Alice", &blob(&key)).unwrap();
        assert_eq!(key_id, "alice@corp");
        assert_eq!(cert_blob, cert.to_bytes().unwrap());
    }

    #[test]
    fn test_load_falls_back_to_common_name() {
        let dir = TempDir::new().unwrap();
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let cert = issue(&key, "by-name");
        fs::write(dir.path().join("Alice-cert.pub"), cert.to_openssh().unwrap()).unwrap();

        let (_, key_id) = load(dir.path(), &[1, 2], "Alice", &blob(&key)).unwrap();
        assert_eq!(key_id, "by-name");
    }

    #[test]
    fn test_mismatched_key_ignored() {
        let dir = TempDir::new().unwrap();
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let other = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let cert = issue(&other, "other");
        fs::write(dir.path().join("1-cert.pub"), cert.to_openssh().unwrap()).unwrap();

        assert!(load(dir.path(), &[1], "", &blob(&key)).is_none());
    }

    #[test]
    fn test_missing_files() {
        let dir = TempDir::new().unwrap();
        assert!(load(dir.path(), &[1], "nobody", b"blob").is_none());
        assert_eq!(candidates(dir.path(), &[1], "../evil").len(), 1);
    }
}
