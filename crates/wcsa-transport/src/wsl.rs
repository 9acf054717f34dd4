//! Windows Subsystem for Linux socket
//!
//! WSL processes can connect to a unix socket created by a Windows process
//! when it lives on a mounted drive. On Windows the socket is an AF_UNIX
//! socket served through a blocking bridge, since the async runtime has no
//! AF_UNIX support there. Where a unix socket cannot be bound the agent
//! listens on loopback TCP and tells the user how to bridge it with
//! `socat`. Neither mode has a handshake.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio_util::io::SyncIoBridge;
use wcsa_core::TransportKind;

use crate::error::TransportError;
use crate::lifecycle::{accept_loop, no_handshake, Acceptor, Connections, LifecycleContext, Listener};

/// Socket file name inside the socket directory
pub const SOCKET_FILE: &str = "wincrypt-wsl.sock";

/// Relay socket path suggested for the TCP fallback
const RELAY_SOCKET: &str = "/tmp/ssh-capi-agent.sock";

/// Buffer between a bridged socket and the agent
const BRIDGE_BUFFER: usize = 64 * 1024;

/// Translate a Windows path into its `/mnt/<drive>` form
///
/// Paths without a drive letter only have their separators changed.
pub fn windows_path_to_wsl(path: &str) -> String {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let drive = (bytes[0] as char).to_ascii_lowercase();
        format!("/mnt/{}{}", drive, path[2..].replace('\\', "/"))
    } else {
        path.replace('\\', "/")
    }
}

/// Connection help for a bound unix socket
pub fn socket_help(path: &Path) -> String {
    format!(
        "export SSH_AUTH_SOCK={}",
        windows_path_to_wsl(&path.display().to_string())
    )
}

/// Connection help for the TCP fallback
pub fn fallback_help(port: u16) -> String {
    format!(
        "socat -d UNIX-LISTEN:{relay},reuseaddr,fork TCP:localhost:{port} &\nexport SSH_AUTH_SOCK={relay}",
        relay = RELAY_SOCKET,
        port = port
    )
}

/// Connected blocking socket that can be split into two directions
pub trait BlockingSocket: Read + Write + Send + Sized + 'static {
    fn try_clone(&self) -> io::Result<Self>;

    /// Shut down both directions, waking a blocked reader
    fn shutdown(&self) -> io::Result<()>;
}

#[cfg(unix)]
impl BlockingSocket for std::os::unix::net::UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        std::os::unix::net::UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, std::net::Shutdown::Both)
    }
}

#[cfg(windows)]
impl BlockingSocket for uds_windows::UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        uds_windows::UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        uds_windows::UnixStream::shutdown(self, std::net::Shutdown::Both)
    }
}

/// Serve a blocking socket as an async stream
///
/// Two blocking tasks copy between the socket and the returned stream.
/// When the agent side closes, the socket is shut down so the inbound copy
/// stops too. Must be called from inside the runtime.
pub fn bridge<T: BlockingSocket>(socket: T) -> io::Result<DuplexStream> {
    let (agent_side, bridge_side) = tokio::io::duplex(BRIDGE_BUFFER);
    let (from_agent, to_agent) = tokio::io::split(bridge_side);
    let mut from_agent = SyncIoBridge::new(from_agent);
    let mut to_agent = SyncIoBridge::new(to_agent);
    let mut inbound = socket.try_clone()?;
    let mut outbound = socket;

    tokio::task::spawn_blocking(move || {
        if let Err(e) = io::copy(&mut inbound, &mut to_agent) {
            tracing::debug!(error = %e, "WSL socket read ended");
        }
        let _ = to_agent.shutdown();
    });
    tokio::task::spawn_blocking(move || {
        if let Err(e) = io::copy(&mut from_agent, &mut outbound) {
            tracing::debug!(error = %e, "WSL socket write ended");
        }
        let _ = outbound.flush();
        let _ = outbound.shutdown();
    });
    Ok(agent_side)
}

/// AF_UNIX listener polled without blocking the runtime
#[cfg(windows)]
struct AfUnixAcceptor(uds_windows::UnixListener);

#[cfg(windows)]
#[async_trait]
impl Acceptor for AfUnixAcceptor {
    type Stream = DuplexStream;

    async fn accept(&mut self) -> io::Result<(Self::Stream, String)> {
        loop {
            match self.0.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    return Ok((bridge(stream)?, "unix".to_string()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Bind the unix socket the platform offers
#[cfg(unix)]
fn bind_unix(path: &Path) -> io::Result<tokio::net::UnixListener> {
    tokio::net::UnixListener::bind(path)
}

#[cfg(windows)]
fn bind_unix(path: &Path) -> io::Result<AfUnixAcceptor> {
    let listener = uds_windows::UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(AfUnixAcceptor(listener))
}

/// Unix socket listener with a loopback TCP fallback
pub struct WslListener {
    path: PathBuf,
}

impl WslListener {
    pub fn new(socket_dir: &Path) -> Self {
        Self {
            path: socket_dir.join(SOCKET_FILE),
        }
    }

    #[cfg(any(unix, windows))]
    async fn run_unix<A: Acceptor>(
        &self,
        ctx: &LifecycleContext,
        mut listener: A,
    ) -> Result<(), TransportError> {
        tracing::info!(path = ?self.path, "WSL socket ready");
        let status = ctx.status.publish(self.kind(), socket_help(&self.path));

        let connections = Connections::new(self.kind(), ctx);
        let result = accept_loop(ctx, &mut listener, &connections, no_handshake).await;
        connections.drain(ctx.drain_timeout).await;

        drop(status);
        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = ?self.path, error = %e, "Failed to remove WSL socket");
        }
        result
    }

    async fn run_tcp(&self, ctx: &LifecycleContext) -> Result<(), TransportError> {
        let mut listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| TransportError::bind("127.0.0.1:0", e))?;
        let port = listener.local_addr()?.port();

        tracing::info!(port, "WSL relay port ready");
        let _status = ctx.status.publish(self.kind(), fallback_help(port));

        let connections = Connections::new(self.kind(), ctx);
        let result = accept_loop(ctx, &mut listener, &connections, no_handshake).await;
        connections.drain(ctx.drain_timeout).await;
        result
    }
}

#[async_trait]
impl Listener for WslListener {
    fn kind(&self) -> TransportKind {
        TransportKind::Wsl
    }

    async fn run(&self, ctx: LifecycleContext) -> Result<(), TransportError> {
        #[cfg(any(unix, windows))]
        {
            let _ = std::fs::remove_file(&self.path);
            match bind_unix(&self.path) {
                Ok(listener) => return self.run_unix(&ctx, listener).await,
                Err(e) => {
                    tracing::info!(path = ?self.path, error = %e, "Unix socket unavailable, using TCP");
                }
            }
        }

        self.run_tcp(&ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_path_to_wsl() {
        assert_eq!(
            windows_path_to_wsl(r"C:\Users\alice\wincrypt-wsl.sock"),
            "/mnt/c/Users/alice/wincrypt-wsl.sock"
        );
        assert_eq!(windows_path_to_wsl(r"d:\agent.sock"), "/mnt/d/agent.sock");
        assert_eq!(
            windows_path_to_wsl(r"\\server\share\agent.sock"),
            "//server/share/agent.sock"
        );
        assert_eq!(windows_path_to_wsl("/tmp/agent.sock"), "/tmp/agent.sock");
    }

    #[test]
    fn test_fallback_help() {
        assert_eq!(
            fallback_help(50001),
            "socat -d UNIX-LISTEN:/tmp/ssh-capi-agent.sock,reuseaddr,fork TCP:localhost:50001 &\n\
             export SSH_AUTH_SOCK=/tmp/ssh-capi-agent.sock"
        );
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bridged_socket_serves_agent() {
        use std::sync::Arc;

        use tokio_util::sync::CancellationToken;
        use wcsa_agent::{Agent, ConnectionHandler, EphemeralKeyAgent};

        let backend = Arc::new(Agent::from(EphemeralKeyAgent::default()));
        let handler = ConnectionHandler::new(backend, CancellationToken::new());

        let (mut client, server) = std::os::unix::net::UnixStream::pair().unwrap();
        let stream = bridge(server).unwrap();
        let serving = tokio::spawn(async move { handler.serve(stream).await });

        let reply = tokio::task::spawn_blocking(move || {
            client.write_all(&[0, 0, 0, 1, 11]).unwrap();
            let mut reply = [0u8; 9];
            client.read_exact(&mut reply).unwrap();
            drop(client);
            reply
        })
        .await
        .unwrap();
        assert_eq!(reply, [0, 0, 0, 5, 12, 0, 0, 0, 0]);

        tokio::time::timeout(std::time::Duration::from_secs(5), serving)
            .await
            .expect("agent kept the bridged connection open")
            .unwrap();
    }
}
