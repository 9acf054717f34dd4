//! Agent protocol server for one connection
//!
//! Every transport ends up here once its handshake is done: the adapted
//! stream is framed with the agent codec and each request is answered from
//! the shared backend.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use wcsa_protocol::message::msg;
use wcsa_protocol::{agent_codec, Request, Response};

use crate::backend::{Agent, AgentBackend};
use crate::error::Result;

/// Serves the agent protocol against a shared backend
#[derive(Clone)]
pub struct ConnectionHandler {
    backend: Arc<Agent>,
    cancel: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(backend: Arc<Agent>, cancel: CancellationToken) -> Self {
        Self { backend, cancel }
    }

    pub fn backend(&self) -> &Arc<Agent> {
        &self.backend
    }

    /// Answer requests until EOF, a framing error or cancellation
    ///
    /// Only a bad length prefix ends the connection. A payload that does
    /// not decode is answered with `SSH_AGENT_FAILURE`. A request already
    /// read is answered before cancellation is honoured.
    pub async fn serve<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut framed = Framed::new(stream, agent_codec());

        loop {
            let payload = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = framed.next() => match next {
                    Some(Ok(payload)) => payload,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Dropping agent connection");
                        break;
                    }
                    None => break,
                },
            };
            if payload.is_empty() {
                tracing::debug!("Dropping agent connection after an empty frame");
                break;
            }

            let response = match Request::decode(&payload) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => {
                    tracing::debug!(message = payload[0], error = %e, "Undecodable agent request");
                    Response::Failure
                }
            };
            let encoded = response.to_payload().unwrap_or_else(|e| {
                tracing::debug!(error = %e, "Failed to encode agent response");
                vec![msg::FAILURE]
            });
            if let Err(e) = framed.send(Bytes::from(encoded)).await {
                tracing::debug!(error = %e, "Failed to write agent response");
                break;
            }
        }

        let _ = framed.get_mut().shutdown().await;
    }

    /// Answer one request
    pub async fn dispatch(&self, request: Request) -> Response {
        match self.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(backend = self.backend.kind(), error = %e, "Agent request failed");
                Response::Failure
            }
        }
    }

    async fn handle(&self, request: Request) -> Result<Response> {
        let backend = &self.backend;
        let response = match request {
            Request::RequestIdentities => Response::Identities(backend.list().await?),
            Request::Sign(sign) => Response::Signature(
                backend.sign(&sign.key_blob, &sign.data, sign.flags).await?,
            ),
            Request::Add(key) => {
                backend.add(key).await?;
                Response::Success
            }
            Request::Remove { key_blob } => {
                backend.remove(&key_blob).await?;
                Response::Success
            }
            Request::RemoveAll => {
                backend.remove_all().await?;
                Response::Success
            }
            Request::Lock { passphrase } => {
                backend.lock(passphrase.as_bytes()).await?;
                Response::Success
            }
            Request::Unlock { passphrase } => {
                backend.unlock(passphrase.as_bytes()).await?;
                Response::Success
            }
            Request::Unsupported(number) => {
                tracing::debug!(message = number, "Unsupported agent request");
                Response::Failure
            }
        };
        Ok(response)
    }
}
