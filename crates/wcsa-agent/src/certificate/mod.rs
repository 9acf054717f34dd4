//! Agent backed by the user's certificate store
//!
//! Certificates with a private key (typically on a smart card) are exposed
//! as SSH identities. Each listing re-reads the store so inserted or removed
//! cards show up without restarting. Signing goes through the store, which
//! returns a PKCS#7 envelope; the raw signature is taken out of it.

#[cfg(windows)]
mod capi;
pub mod eku;
pub mod oid;
pub mod sidecar;
pub mod signer;
pub mod store;
pub mod x509;

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use wcsa_protocol::{AgentSignature, PublicKeyEntry, SignFlags};

pub use signer::CertificateSigner;
pub use store::{CertificateHandle, CertificateProvider, CertificateStore, RawCertificate};

use crate::backend::{AgentBackend, KeySigner};
use crate::error::{AgentError, Result};
use crate::notify::SharedNotifier;

struct Inner {
    store: CertificateStore,
    certificate_dir: PathBuf,
    /// Signers from the last load; `None` until the first list or sign
    keys: Mutex<Option<Vec<CertificateSigner>>>,
}

impl Inner {
    fn load(&self) -> Result<Vec<CertificateSigner>> {
        let mut keys = Vec::new();

        for handle in self.store.list()? {
            let parsed = match x509::parse(&handle.der()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping certificate");
                    continue;
                }
            };
            if !eku::accepts(parsed.extended_key_usage.as_deref()) {
                tracing::debug!(
                    subject = %parsed.common_name,
                    "Skipping certificate not meant for client authentication"
                );
                continue;
            }

            let signer = CertificateSigner::new(handle, &parsed)?;
            let sidecar = sidecar::load(
                &self.certificate_dir,
                &parsed.serial,
                &parsed.common_name,
                &signer.public_key().blob,
            );
            let with_cert = sidecar
                .map(|(blob, key_id)| signer.with_identity(blob, key_id))
                .transpose()?;

            keys.push(signer);
            keys.extend(with_cert);
        }

        tracing::debug!(count = keys.len(), "Loaded certificate identities");
        Ok(keys)
    }

    fn list(&self) -> Result<Vec<PublicKeyEntry>> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        // Release the previous handles before enumerating again
        *keys = None;
        let loaded = self.load()?;
        let entries = loaded.iter().map(|k| k.public_key().clone()).collect();
        *keys = Some(loaded);
        Ok(entries)
    }

    fn sign(&self, key_blob: &[u8], data: &[u8], flags: SignFlags) -> Result<(AgentSignature, String)> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if keys.is_none() {
            *keys = Some(self.load()?);
        }

        let signer = keys
            .iter()
            .flatten()
            .find(|k| k.public_key().matches(key_blob))
            .ok_or(AgentError::NotFound)?;
        let signature = signer.sign(data, flags)?;
        Ok((signature, signer.public_key().comment.clone()))
    }
}

/// Agent answering from the certificate store
pub struct CertificateAgent {
    inner: Arc<Inner>,
    notifier: SharedNotifier,
}

impl CertificateAgent {
    pub fn new(store: CertificateStore, certificate_dir: PathBuf, notifier: SharedNotifier) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                certificate_dir,
                keys: Mutex::new(None),
            }),
            notifier,
        }
    }

    /// Store calls block (PIN prompts, card I/O), so they run off the runtime
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| AgentError::Io(io::Error::other(e)))?
    }
}

#[async_trait]
impl AgentBackend for CertificateAgent {
    async fn list(&self) -> Result<Vec<PublicKeyEntry>> {
        self.blocking(|inner| inner.list()).await
    }

    async fn sign(&self, key_blob: &[u8], data: &[u8], flags: SignFlags) -> Result<AgentSignature> {
        let key_blob = key_blob.to_vec();
        let data = data.to_vec();
        let (signature, comment) = self
            .blocking(move |inner| inner.sign(&key_blob, &data, flags))
            .await?;

        self.notifier.notify(
            "Authenticated",
            &format!("Authentication Success by Certificate <{}>", comment),
        );
        Ok(signature)
    }
}
