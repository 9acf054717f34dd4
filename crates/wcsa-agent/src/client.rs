//! Minimal SSH agent client
//!
//! Used by the remote proxy to talk to an agent on the other side of a
//! Hyper-V socket.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use ssh_agent_lib::proto;
use ssh_encoding::Encode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use wcsa_protocol::{agent_codec, AgentSignature, ProtocolError, PublicKeyEntry, Response, SignFlags, SignRequest};

use crate::error::{AgentError, Result};

/// Any bidirectional byte stream an agent can be reached over
pub trait AgentStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AgentStream for T {}

pub type BoxedStream = Box<dyn AgentStream>;

/// Request/response client over one connection
pub struct AgentClient {
    framed: Framed<BoxedStream, LengthDelimitedCodec>,
}

impl AgentClient {
    pub fn new<S: AgentStream + 'static>(stream: S) -> Self {
        Self {
            framed: Framed::new(Box::new(stream), agent_codec()),
        }
    }

    /// Send one payload and wait for its response
    async fn exchange(&mut self, payload: Vec<u8>) -> Result<Response> {
        self.framed.send(Bytes::from(payload)).await?;
        match self.framed.next().await {
            Some(frame) => Ok(Response::from_payload(&frame?)?),
            None => Err(AgentError::Remote("connection closed by agent".to_string())),
        }
    }

    pub async fn list(&mut self) -> Result<Vec<PublicKeyEntry>> {
        let mut payload = Vec::new();
        proto::Request::RequestIdentities
            .encode(&mut payload)
            .map_err(ProtocolError::from)?;
        match self.exchange(payload).await? {
            Response::Identities(keys) => Ok(keys),
            Response::Failure => Err(AgentError::RemoteFailure),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn sign(&mut self, key_blob: &[u8], data: &[u8], flags: SignFlags) -> Result<AgentSignature> {
        let request = SignRequest {
            key_blob: Bytes::copy_from_slice(key_blob),
            data: Bytes::copy_from_slice(data),
            flags,
        };
        match self.exchange(request.to_payload()?).await? {
            Response::Signature(signature) => Ok(signature),
            Response::Failure => Err(AgentError::RemoteFailure),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> AgentError {
    AgentError::Remote(format!("unexpected response {:?}", response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wcsa_protocol::Request;

    #[tokio::test]
    async fn test_list_and_sign_round_trip() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let mut client = AgentClient::new(client_side);

        let server = tokio::spawn(async move {
            let mut framed = Framed::new(server_side, agent_codec());
            let payload = framed.next().await.unwrap().unwrap();
            assert!(matches!(Request::decode(&payload), Ok(Request::RequestIdentities)));
            let answer = Response::Identities(Vec::new()).to_payload().unwrap();
            framed.send(Bytes::from(answer)).await.unwrap();

            let payload = framed.next().await.unwrap().unwrap();
            let Ok(Request::Sign(sign)) = Request::decode(&payload) else {
                panic!("expected sign request");
            };
            assert_eq!(&sign.data[..], b"data");
            assert_eq!(sign.flags, SignFlags::RSA_SHA2_256);
            let failure = Response::Failure.to_payload().unwrap();
            framed.send(Bytes::from(failure)).await.unwrap();
        });

        assert!(client.list().await.unwrap().is_empty());
        assert!(matches!(
            client.sign(b"key", b"data", SignFlags::RSA_SHA2_256).await,
            Err(AgentError::RemoteFailure)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (client_side, server_side) = tokio::io::duplex(64);
        drop(server_side);
        let mut client = AgentClient::new(client_side);
        assert!(client.list().await.is_err());
    }
}
