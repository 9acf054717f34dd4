//! Primary agent with fallbacks

use std::sync::Arc;

use async_trait::async_trait;
use wcsa_protocol::{AddKey, AgentSignature, PublicKeyEntry, SignFlags};

use crate::backend::{Agent, AgentBackend, KeySigner};
use crate::error::{AgentError, Result};

/// Fans `list` and `sign` out over several agents
///
/// Key management always goes to the primary.
pub struct CompositeAgent {
    primary: Box<Agent>,
    secondary: Vec<Agent>,
}

impl CompositeAgent {
    pub fn new(primary: impl Into<Agent>, secondary: Vec<Agent>) -> Self {
        Self {
            primary: Box::new(primary.into()),
            secondary,
        }
    }

    fn members(&self) -> impl Iterator<Item = &Agent> {
        std::iter::once(self.primary.as_ref()).chain(self.secondary.iter())
    }
}

#[async_trait]
impl AgentBackend for CompositeAgent {
    async fn list(&self) -> Result<Vec<PublicKeyEntry>> {
        let mut keys = Vec::new();
        for member in self.members() {
            keys.extend(member.list().await?);
        }
        Ok(keys)
    }

    /// First success wins; when all fail the first error is returned
    async fn sign(&self, key_blob: &[u8], data: &[u8], flags: SignFlags) -> Result<AgentSignature> {
        let mut first_error = None;
        for member in self.members() {
            match member.sign(key_blob, data, flags).await {
                Ok(sig) => return Ok(sig),
                Err(e) => {
                    tracing::trace!(member = member.kind(), error = %e, "Member could not sign");
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or(AgentError::NotFound))
    }

    async fn add(&self, key: AddKey) -> Result<()> {
        self.primary.add(key).await
    }

    async fn remove(&self, key_blob: &[u8]) -> Result<()> {
        self.primary.remove(key_blob).await
    }

    async fn remove_all(&self) -> Result<()> {
        self.primary.remove_all().await
    }

    async fn lock(&self, passphrase: &[u8]) -> Result<()> {
        self.primary.lock(passphrase).await
    }

    async fn unlock(&self, passphrase: &[u8]) -> Result<()> {
        self.primary.unlock(passphrase).await
    }

    async fn signers(&self) -> Result<Vec<Arc<dyn KeySigner>>> {
        self.primary.signers().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::tests::{add_request, ed25519_key, public_blob};
    use crate::keyring::EphemeralKeyAgent;

    #[tokio::test]
    async fn test_list_concatenates_in_order() {
        let a = EphemeralKeyAgent::default();
        let b = EphemeralKeyAgent::default();
        a.add(add_request(&ed25519_key(), "a", &[])).await.unwrap();
        b.add(add_request(&ed25519_key(), "b", &[])).await.unwrap();

        let composite = CompositeAgent::new(a, vec![b.into()]);
        let comments: Vec<_> = composite
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.comment)
            .collect();
        assert_eq!(comments, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_sign_falls_through_to_second() {
        let a = EphemeralKeyAgent::default();
        let b = EphemeralKeyAgent::default();
        let key = ed25519_key();
        b.add(add_request(&key, "b", &[])).await.unwrap();

        let composite = CompositeAgent::new(a, vec![b.into()]);
        let sig = composite
            .sign(&public_blob(&key), b"data", SignFlags::default())
            .await
            .unwrap();
        assert_eq!(sig.format, "ssh-ed25519");
    }

    #[tokio::test]
    async fn test_sign_returns_first_error() {
        let a = EphemeralKeyAgent::default();
        a.lock(b"pw").await.unwrap();
        let b = EphemeralKeyAgent::default();

        let composite = CompositeAgent::new(a, vec![b.into()]);
        // a fails with Locked, b with NotFound
        assert!(matches!(
            composite.sign(b"blob", b"data", SignFlags::default()).await,
            Err(AgentError::Locked)
        ));
    }

    #[tokio::test]
    async fn test_mutations_go_to_primary() {
        let composite = CompositeAgent::new(
            EphemeralKeyAgent::default(),
            vec![EphemeralKeyAgent::default().into()],
        );
        let key = ed25519_key();
        composite.add(add_request(&key, "p", &[])).await.unwrap();

        assert_eq!(composite.primary.list().await.unwrap().len(), 1);
        assert!(composite.secondary[0].list().await.unwrap().is_empty());
        assert_eq!(composite.signers().await.unwrap().len(), 1);

        composite.lock(b"pw").await.unwrap();
        assert!(composite.list().await.unwrap().is_empty());
    }
}
