//! In-memory keyring for keys added with ssh-add

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rsa::pkcs1v15::SigningKey;
use sha2::digest::const_oid::AssociatedOid;
use sha2::digest::Digest;
use signature::{SignatureEncoding, Signer};
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::PrivateKey;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use wcsa_protocol::{AddKey, AgentSignature, Constraint, PublicKeyEntry, SignFlags};
use zeroize::Zeroizing;

use crate::backend::{AgentBackend, KeySigner};
use crate::error::{AgentError, Result};
use crate::notify::{log_notifier, SharedNotifier};

/// A private key held by the keyring
pub struct KeyringSigner {
    entry: PublicKeyEntry,
    key: PrivateKey,
}

impl KeyringSigner {
    fn new(key: PrivateKey) -> Result<Self> {
        let blob = key
            .public_key()
            .to_bytes()
            .map_err(|e| AgentError::InvalidKey(e.to_string()))?;
        let entry = PublicKeyEntry::from_blob(blob, key.comment())?;
        Ok(Self { entry, key })
    }
}

impl KeySigner for KeyringSigner {
    fn public_key(&self) -> &PublicKeyEntry {
        &self.entry
    }

    fn sign(&self, data: &[u8], flags: SignFlags) -> Result<AgentSignature> {
        match self.key.key_data() {
            KeypairData::Rsa(rsa_key) => sign_rsa(rsa_key, data, flags),
            _ if !flags.is_default() => Err(AgentError::AlgorithmSelectionUnsupported(
                self.entry.format.clone(),
            )),
            _ => {
                let sig: ssh_key::Signature = self.key.try_sign(data)?;
                Ok(sig.into())
            }
        }
    }
}

/// Digest picked for an RSA signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RsaHash {
    Sha1,
    Sha256,
    Sha512,
}

impl RsaHash {
    fn from_flags(flags: SignFlags) -> Result<Self> {
        if flags.is_default() {
            Ok(RsaHash::Sha1)
        } else if flags.bits() & SignFlags::RSA_SHA2_256.bits() != 0 {
            Ok(RsaHash::Sha256)
        } else if flags.bits() & SignFlags::RSA_SHA2_512.bits() != 0 {
            Ok(RsaHash::Sha512)
        } else {
            Err(AgentError::UnsupportedFlags(flags.bits()))
        }
    }

    fn format(&self) -> &'static str {
        match self {
            RsaHash::Sha1 => "ssh-rsa",
            RsaHash::Sha256 => "rsa-sha2-256",
            RsaHash::Sha512 => "rsa-sha2-512",
        }
    }
}

fn sign_rsa(rsa_key: &RsaKeypair, data: &[u8], flags: SignFlags) -> Result<AgentSignature> {
    let hash = RsaHash::from_flags(flags)?;
    let private =
        rsa::RsaPrivateKey::try_from(rsa_key).map_err(|e| AgentError::Signing(e.to_string()))?;
    let blob = match hash {
        RsaHash::Sha1 => pkcs1v15::<sha1::Sha1>(private, data)?,
        RsaHash::Sha256 => pkcs1v15::<sha2::Sha256>(private, data)?,
        RsaHash::Sha512 => pkcs1v15::<sha2::Sha512>(private, data)?,
    };
    Ok(AgentSignature::new(hash.format(), blob))
}

fn pkcs1v15<D>(private: rsa::RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>>
where
    D: Digest + AssociatedOid,
{
    let signing_key = SigningKey::<D>::new(private);
    Ok(signing_key.try_sign(data)?.to_vec())
}

struct StoredKey {
    signer: Arc<KeyringSigner>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct KeyringState {
    keys: Vec<StoredKey>,
    /// Passphrase while locked
    locked: Option<Zeroizing<Vec<u8>>>,
}

impl KeyringState {
    fn expire(&mut self) {
        let now = Instant::now();
        self.keys.retain(|k| match k.expires_at {
            Some(deadline) if deadline <= now => {
                tracing::info!(comment = %k.signer.entry.comment, "Keyring key expired");
                false
            }
            _ => true,
        });
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.locked.is_some() {
            Err(AgentError::Locked)
        } else {
            Ok(())
        }
    }

    fn find(&self, key_blob: &[u8]) -> Option<usize> {
        self.keys.iter().position(|k| k.signer.entry.matches(key_blob))
    }
}

/// Keyring agent holding keys in process memory
///
/// Keys vanish when the process exits. Lock hides every key and refuses
/// every operation until unlocked with the same passphrase.
pub struct EphemeralKeyAgent {
    state: Mutex<KeyringState>,
    notifier: SharedNotifier,
}

impl EphemeralKeyAgent {
    pub fn new(notifier: SharedNotifier) -> Self {
        Self {
            state: Mutex::new(KeyringState::default()),
            notifier,
        }
    }

    fn state(&self) -> MutexGuard<'_, KeyringState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.expire();
        state
    }
}

impl Default for EphemeralKeyAgent {
    fn default() -> Self {
        Self::new(log_notifier())
    }
}

fn display_name(entry: &PublicKeyEntry) -> String {
    if entry.comment.is_empty() {
        entry.blob_base64()
    } else {
        entry.comment.clone()
    }
}

/// Only key types this agent can sign with are accepted
fn check_key_type(key: &PrivateKey) -> Result<()> {
    match key.key_data() {
        KeypairData::Ed25519(_) | KeypairData::Ecdsa(_) | KeypairData::Rsa(_) => Ok(()),
        _ => Err(AgentError::UnsupportedKeyType),
    }
}

fn lifetime(constraints: &[Constraint]) -> Result<Option<Duration>> {
    let mut lifetime = None;
    for constraint in constraints {
        match constraint {
            Constraint::Lifetime(0) => {}
            Constraint::Lifetime(secs) => lifetime = Some(Duration::from_secs(u64::from(*secs))),
            Constraint::Confirm | Constraint::Other(_) => {
                return Err(AgentError::UnsupportedConstraint)
            }
        }
    }
    Ok(lifetime)
}

#[async_trait]
impl AgentBackend for EphemeralKeyAgent {
    async fn list(&self) -> Result<Vec<PublicKeyEntry>> {
        let state = self.state();
        if state.locked.is_some() {
            return Ok(Vec::new());
        }
        Ok(state.keys.iter().map(|k| k.signer.entry.clone()).collect())
    }

    async fn sign(&self, key_blob: &[u8], data: &[u8], flags: SignFlags) -> Result<AgentSignature> {
        let signer = {
            let state = self.state();
            state.ensure_unlocked()?;
            let idx = state.find(key_blob).ok_or(AgentError::NotFound)?;
            state.keys[idx].signer.clone()
        };

        let signature = signer.sign(data, flags)?;
        self.notifier.notify(
            "Authenticated (Keyring)",
            &format!(
                "Authentication Success by Key <{}>",
                display_name(signer.public_key())
            ),
        );
        Ok(signature)
    }

    async fn add(&self, identity: AddKey) -> Result<()> {
        check_key_type(&identity.key)?;
        let lifetime = lifetime(&identity.constraints)?;
        let signer = Arc::new(KeyringSigner::new(identity.key)?);
        let name = display_name(signer.public_key());

        {
            let mut state = self.state();
            state.ensure_unlocked()?;
            let stored = StoredKey {
                expires_at: lifetime.map(|d| Instant::now() + d),
                signer,
            };
            match state.find(&stored.signer.entry.blob) {
                Some(idx) => state.keys[idx] = stored,
                None => state.keys.push(stored),
            }
        }

        tracing::debug!(key = %name, ?lifetime, "Key added to keyring");
        self.notifier
            .notify("Key Added", &format!("Key <{}> has been added to keyring", name));
        Ok(())
    }

    async fn remove(&self, key_blob: &[u8]) -> Result<()> {
        let removed = {
            let mut state = self.state();
            state.ensure_unlocked()?;
            let idx = state.find(key_blob).ok_or(AgentError::NotFound)?;
            state.keys.remove(idx)
        };

        self.notifier.notify(
            "Key Removed",
            &format!(
                "Key <{}> has been removed from keyring",
                display_name(removed.signer.public_key())
            ),
        );
        Ok(())
    }

    async fn remove_all(&self) -> Result<()> {
        {
            let mut state = self.state();
            state.ensure_unlocked()?;
            state.keys.clear();
        }
        self.notifier
            .notify("Key Removed", "All Keys have been removed from keyring");
        Ok(())
    }

    async fn lock(&self, passphrase: &[u8]) -> Result<()> {
        let mut state = self.state();
        state.ensure_unlocked()?;
        state.locked = Some(Zeroizing::new(passphrase.to_vec()));
        tracing::info!("Keyring locked");
        Ok(())
    }

    async fn unlock(&self, passphrase: &[u8]) -> Result<()> {
        let mut state = self.state();
        let stored = state.locked.as_ref().ok_or(AgentError::NotLocked)?;
        if !bool::from(stored.as_slice().ct_eq(passphrase)) {
            return Err(AgentError::IncorrectPassphrase);
        }
        state.locked = None;
        tracing::info!("Keyring unlocked");
        Ok(())
    }

    async fn signers(&self) -> Result<Vec<Arc<dyn KeySigner>>> {
        let state = self.state();
        state.ensure_unlocked()?;
        Ok(state
            .keys
            .iter()
            .map(|k| k.signer.clone() as Arc<dyn KeySigner>)
            .collect())
    }
}
