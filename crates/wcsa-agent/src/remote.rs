//! Agent that forwards to another agent instance
//!
//! A guest VM has no certificate store of its own; it relays list and sign
//! requests to the host agent over the Hyper-V socket.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use wcsa_protocol::{AgentSignature, PublicKeyEntry, SignFlags};

use crate::backend::AgentBackend;
use crate::client::{AgentClient, BoxedStream};
use crate::error::{AgentError, Result};

/// Opens a fresh connection to the remote agent
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<BoxedStream>;
}

enum Call {
    List,
    Sign {
        key_blob: Bytes,
        data: Bytes,
        flags: SignFlags,
    },
}

enum Reply {
    Keys(Vec<PublicKeyEntry>),
    Signature(AgentSignature),
}

impl Call {
    async fn perform(&self, client: &mut AgentClient) -> Result<Reply> {
        match self {
            Call::List => client.list().await.map(Reply::Keys),
            Call::Sign {
                key_blob,
                data,
                flags,
            } => client.sign(key_blob, data, *flags).await.map(Reply::Signature),
        }
    }
}

/// The connection is unusable after these
fn is_transport_error(e: &AgentError) -> bool {
    matches!(
        e,
        AgentError::Io(_) | AgentError::Protocol(_) | AgentError::Remote(_)
    )
}

/// Backend forwarding list and sign to a remote agent
pub struct RemoteProxyAgent {
    client: Mutex<Option<AgentClient>>,
    dialer: Option<Arc<dyn Dialer>>,
}

impl RemoteProxyAgent {
    /// Wrap an already connected client
    pub fn new(client: AgentClient) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            dialer: None,
        }
    }

    /// Reconnect through `dialer` after the connection fails
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    async fn redial(&self) -> Result<AgentClient> {
        let dialer = self
            .dialer
            .as_ref()
            .ok_or_else(|| AgentError::Remote("connection to remote agent lost".to_string()))?;
        let stream = dialer.dial().await?;
        tracing::debug!("Reconnected to remote agent");
        Ok(AgentClient::new(stream))
    }

    async fn call(&self, call: Call) -> Result<Reply> {
        let mut slot = self.client.lock().await;
        let mut redialed = false;

        loop {
            if slot.is_none() {
                redialed = true;
                *slot = Some(self.redial().await?);
            }
            let result = match slot.as_mut() {
                Some(client) => call.perform(client).await,
                None => continue,
            };

            match result {
                Err(e) if is_transport_error(&e) => {
                    tracing::debug!(error = %e, "Remote agent connection failed");
                    *slot = None;
                    if redialed || self.dialer.is_none() {
                        return Err(e);
                    }
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl AgentBackend for RemoteProxyAgent {
    async fn list(&self) -> Result<Vec<PublicKeyEntry>> {
        match self.call(Call::List).await? {
            Reply::Keys(keys) => Ok(keys),
            Reply::Signature(_) => Err(AgentError::Remote("mismatched reply".to_string())),
        }
    }

    async fn sign(&self, key_blob: &[u8], data: &[u8], flags: SignFlags) -> Result<AgentSignature> {
        let call = Call::Sign {
            key_blob: Bytes::copy_from_slice(key_blob),
            data: Bytes::copy_from_slice(data),
            flags,
        };
        match self.call(call).await? {
            Reply::Signature(signature) => Ok(signature),
            Reply::Keys(_) => Err(AgentError::Remote("mismatched reply".to_string())),
        }
    }
}
