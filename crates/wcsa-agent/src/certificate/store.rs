//! Owned handles over a system certificate store

use std::fmt;
use std::sync::Arc;

use crate::error::StoreError;

/// Opaque certificate reference issued by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawCertificate(pub usize);

/// Access to the operating system's certificate store
///
/// Every `RawCertificate` returned by `enumerate` or `duplicate` is owned
/// by the caller and must be released with `free` exactly once.
pub trait CertificateProvider: Send + Sync {
    /// Certificates that have an associated private key
    fn enumerate(&self) -> Result<Vec<RawCertificate>, StoreError>;

    /// DER encoding of the certificate
    fn encoded(&self, cert: RawCertificate) -> Vec<u8>;

    /// New reference to the same certificate
    fn duplicate(&self, cert: RawCertificate) -> RawCertificate;

    fn free(&self, cert: RawCertificate);

    /// Detached PKCS#7 signature over `data` using the signature algorithm `oid`
    fn sign(&self, cert: RawCertificate, oid: &str, data: &[u8]) -> Result<Vec<u8>, StoreError>;
}

/// A certificate reference released on drop
pub struct CertificateHandle {
    raw: RawCertificate,
    provider: Arc<dyn CertificateProvider>,
}

impl CertificateHandle {
    pub fn der(&self) -> Vec<u8> {
        self.provider.encoded(self.raw)
    }

    /// Second independently owned reference
    pub fn try_clone(&self) -> Self {
        Self {
            raw: self.provider.duplicate(self.raw),
            provider: self.provider.clone(),
        }
    }

    pub fn sign(&self, oid: &str, data: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.provider.sign(self.raw, oid, data)
    }
}

impl Drop for CertificateHandle {
    fn drop(&mut self) {
        self.provider.free(self.raw);
    }
}

impl fmt::Debug for CertificateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CertificateHandle").field(&self.raw.0).finish()
    }
}

/// The user's personal certificate store
#[derive(Clone)]
pub struct CertificateStore {
    provider: Option<Arc<dyn CertificateProvider>>,
}

impl CertificateStore {
    pub fn new(provider: Arc<dyn CertificateProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    /// A store that never yields certificates
    pub fn unavailable() -> Self {
        Self { provider: None }
    }

    /// The platform store: CryptoAPI on Windows, nothing elsewhere
    pub fn system() -> Self {
        #[cfg(windows)]
        {
            Self::new(Arc::new(super::capi::CryptoApiProvider::new()))
        }
        #[cfg(not(windows))]
        {
            Self::unavailable()
        }
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    /// Enumerate certificates with private keys
    pub fn list(&self) -> Result<Vec<CertificateHandle>, StoreError> {
        let Some(provider) = &self.provider else {
            return Ok(Vec::new());
        };
        Ok(provider
            .enumerate()?
            .into_iter()
            .map(|raw| CertificateHandle {
                raw,
                provider: provider.clone(),
            })
            .collect())
    }
}
