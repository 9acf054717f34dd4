//! Accept loop, connection tracking and shutdown shared by every listener
//!
//! A listener binds its endpoint, then drives [`accept_loop`] until the
//! shared token is cancelled. Each accepted connection runs its handshake
//! and then the agent protocol on its own task, tracked by [`Connections`].
//! After the loop ends the listener drains those tasks (bounded by the
//! drain timeout) and only then releases its endpoint.

use std::fmt::Display;
use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use wcsa_agent::{AgentStream, ConnectionHandler};
use wcsa_core::TransportKind;

use crate::error::{HandshakeError, TransportError};
use crate::status::StatusBoard;

/// How long a single accept may block before cancellation is re-checked
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a listener needs from the process
#[derive(Clone)]
pub struct LifecycleContext {
    pub cancel: CancellationToken,
    pub handler: ConnectionHandler,
    pub status: StatusBoard,
    pub handshake_timeout: Duration,
    pub drain_timeout: Duration,
}

impl LifecycleContext {
    pub fn new(handler: ConnectionHandler, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            handler,
            status: StatusBoard::new(),
            handshake_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_status(mut self, status: StatusBoard) -> Self {
        self.status = status;
        self
    }

    pub fn with_timeouts(mut self, handshake: Duration, drain: Duration) -> Self {
        self.handshake_timeout = handshake;
        self.drain_timeout = drain;
        self
    }
}

/// A menu item a tray UI would render for a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    pub kind: TransportKind,
    pub label: String,
}

impl MenuEntry {
    /// The usual "<name> Help" entry
    pub fn help(kind: TransportKind) -> Self {
        Self {
            kind,
            label: format!("{} Help", kind),
        }
    }
}

/// One local IPC surface
#[async_trait]
pub trait Listener: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn menu(&self) -> Vec<MenuEntry> {
        vec![MenuEntry::help(self.kind())]
    }

    /// Serve until `ctx.cancel` fires
    ///
    /// Returns `Ok` after a clean shutdown; an error means the transport
    /// could not start or its accept failed fatally.
    async fn run(&self, ctx: LifecycleContext) -> Result<(), TransportError>;
}

/// Source of incoming connections
#[async_trait]
pub trait Acceptor: Send {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Next connection and a description of the peer for logs
    async fn accept(&mut self) -> io::Result<(Self::Stream, String)>;
}

#[async_trait]
impl Acceptor for tokio::net::TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&mut self) -> io::Result<(Self::Stream, String)> {
        let (stream, peer) = tokio::net::TcpListener::accept(self).await?;
        Ok((stream, peer.to_string()))
    }
}

#[cfg(unix)]
#[async_trait]
impl Acceptor for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;

    async fn accept(&mut self) -> io::Result<(Self::Stream, String)> {
        let (stream, _) = tokio::net::UnixListener::accept(self).await?;
        Ok((stream, "unix".to_string()))
    }
}

/// In-flight connections of one listener
pub struct Connections {
    kind: TransportKind,
    tracker: TaskTracker,
    handler: ConnectionHandler,
    handshake_timeout: Duration,
}

impl Connections {
    pub fn new(kind: TransportKind, ctx: &LifecycleContext) -> Self {
        Self {
            kind,
            tracker: TaskTracker::new(),
            handler: ctx.handler.clone(),
            handshake_timeout: ctx.handshake_timeout,
        }
    }

    /// Run `handshake`, then serve the agent protocol on its stream
    pub fn spawn<F, S>(&self, peer: impl Display, handshake: F)
    where
        F: Future<Output = Result<S, HandshakeError>> + Send + 'static,
        S: AgentStream + 'static,
    {
        let kind = self.kind;
        let peer = peer.to_string();
        let handler = self.handler.clone();
        let timeout = self.handshake_timeout;

        self.tracker.spawn(async move {
            let stream = match tokio::time::timeout(timeout, handshake).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::warn!(transport = %kind, %peer, error = %e, "Handshake rejected");
                    return;
                }
                Err(_) => {
                    tracing::warn!(
                        transport = %kind,
                        %peer,
                        error = %HandshakeError::Timeout,
                        "Handshake rejected"
                    );
                    return;
                }
            };

            tracing::debug!(transport = %kind, %peer, "Connection accepted");
            handler.serve(stream).await;
            tracing::debug!(transport = %kind, %peer, "Connection closed");
        });
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait for every connection task, up to `timeout`
    ///
    /// Returns `false` if stragglers were left running.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                transport = %self.kind,
                remaining = self.tracker.len(),
                "Abandoning connections still open at shutdown"
            );
            return false;
        }
        true
    }
}

/// Handshake for transports that have none
pub async fn no_handshake<S>(stream: S) -> Result<S, HandshakeError> {
    Ok(stream)
}

/// Accept until cancelled, handing each connection to `connections`
///
/// An accept that times out is retried. Any other accept error ends the
/// loop and is returned.
pub async fn accept_loop<A, H, F, S>(
    ctx: &LifecycleContext,
    acceptor: &mut A,
    connections: &Connections,
    handshake: H,
) -> Result<(), TransportError>
where
    A: Acceptor,
    H: Fn(A::Stream) -> F,
    F: Future<Output = Result<S, HandshakeError>> + Send + 'static,
    S: AgentStream + 'static,
{
    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Ok(()),
            accepted = tokio::time::timeout(ACCEPT_POLL_INTERVAL, acceptor.accept()) => accepted,
        };

        match accepted {
            Err(_elapsed) => continue,
            Ok(Ok((stream, peer))) => connections.spawn(peer, handshake(stream)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => continue,
            Ok(Err(e)) => return Err(TransportError::Accept(e)),
        }
    }
}
