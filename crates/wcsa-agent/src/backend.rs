//! Agent backend abstraction

use std::sync::Arc;

use async_trait::async_trait;
use wcsa_protocol::{AddKey, AgentSignature, PublicKeyEntry, SignFlags};

use crate::certificate::CertificateAgent;
use crate::composite::CompositeAgent;
use crate::error::{AgentError, Result};
use crate::keyring::EphemeralKeyAgent;
use crate::remote::RemoteProxyAgent;

/// A key that can sign in this process
pub trait KeySigner: Send + Sync {
    /// Identity this signer answers for
    fn public_key(&self) -> &PublicKeyEntry;

    /// Sign `data`, honouring algorithm selection flags
    fn sign(&self, data: &[u8], flags: SignFlags) -> Result<AgentSignature>;
}

/// Operations every agent backend answers
///
/// Only `list` and `sign` are mandatory; the rest default to
/// [`AgentError::Unsupported`].
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Identities this backend can sign with
    async fn list(&self) -> Result<Vec<PublicKeyEntry>>;

    /// Sign `data` with the key whose blob is `key_blob`
    async fn sign(&self, key_blob: &[u8], data: &[u8], flags: SignFlags) -> Result<AgentSignature>;

    async fn add(&self, _key: AddKey) -> Result<()> {
        Err(AgentError::Unsupported("adding keys"))
    }

    async fn remove(&self, _key_blob: &[u8]) -> Result<()> {
        Err(AgentError::Unsupported("removing keys"))
    }

    async fn remove_all(&self) -> Result<()> {
        Err(AgentError::Unsupported("removing keys"))
    }

    async fn lock(&self, _passphrase: &[u8]) -> Result<()> {
        Err(AgentError::Unsupported("locking"))
    }

    async fn unlock(&self, _passphrase: &[u8]) -> Result<()> {
        Err(AgentError::Unsupported("unlocking"))
    }

    /// Signers living in this process
    async fn signers(&self) -> Result<Vec<Arc<dyn KeySigner>>> {
        Err(AgentError::Unsupported("listing signers"))
    }
}

/// The closed set of backends the daemon can serve
pub enum Agent {
    /// Keys from the Windows certificate store
    Certificate(CertificateAgent),
    /// In-memory keyring fed by ssh-add
    Ephemeral(EphemeralKeyAgent),
    /// Primary plus fallbacks
    Composite(CompositeAgent),
    /// Relay to an agent across a VM socket
    Remote(RemoteProxyAgent),
}

macro_rules! dispatch {
    ($self:ident, $agent:ident => $call:expr) => {
        match $self {
            Agent::Certificate($agent) => $call,
            Agent::Ephemeral($agent) => $call,
            Agent::Composite($agent) => $call,
            Agent::Remote($agent) => $call,
        }
    };
}

impl Agent {
    /// Variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Agent::Certificate(_) => "certificate",
            Agent::Ephemeral(_) => "keyring",
            Agent::Composite(_) => "composite",
            Agent::Remote(_) => "remote",
        }
    }
}

#[async_trait]
impl AgentBackend for Agent {
    async fn list(&self) -> Result<Vec<PublicKeyEntry>> {
        dispatch!(self, a => a.list().await)
    }

    async fn sign(&self, key_blob: &[u8], data: &[u8], flags: SignFlags) -> Result<AgentSignature> {
        dispatch!(self, a => a.sign(key_blob, data, flags).await)
    }

    async fn add(&self, key: AddKey) -> Result<()> {
        dispatch!(self, a => a.add(key).await)
    }

    async fn remove(&self, key_blob: &[u8]) -> Result<()> {
        dispatch!(self, a => a.remove(key_blob).await)
    }

    async fn remove_all(&self) -> Result<()> {
        dispatch!(self, a => a.remove_all().await)
    }

    async fn lock(&self, passphrase: &[u8]) -> Result<()> {
        dispatch!(self, a => a.lock(passphrase).await)
    }

    async fn unlock(&self, passphrase: &[u8]) -> Result<()> {
        dispatch!(self, a => a.unlock(passphrase).await)
    }

    async fn signers(&self) -> Result<Vec<Arc<dyn KeySigner>>> {
        dispatch!(self, a => a.signers().await)
    }
}

impl From<CertificateAgent> for Agent {
    fn from(agent: CertificateAgent) -> Self {
        Agent::Certificate(agent)
    }
}

impl From<EphemeralKeyAgent> for Agent {
    fn from(agent: EphemeralKeyAgent) -> Self {
        Agent::Ephemeral(agent)
    }
}

impl From<CompositeAgent> for Agent {
    fn from(agent: CompositeAgent) -> Self {
        Agent::Composite(agent)
    }
}

impl From<RemoteProxyAgent> for Agent {
    fn from(agent: RemoteProxyAgent) -> Self {
        Agent::Remote(agent)
    }
}
