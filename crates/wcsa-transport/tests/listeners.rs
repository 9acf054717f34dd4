//! End-to-end tests: real sockets, real handshakes, the agent behind them

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use wcsa_agent::{Agent, AgentClient, AgentError, ConnectionHandler, EphemeralKeyAgent};
use wcsa_core::{TransportKind, XshellWriteMode};
use wcsa_protocol::SignFlags;
use wcsa_transport::cygwin::{self, CygwinListener};
use wcsa_transport::xshell::handshake::{connect_handshake, handshake};
use wcsa_transport::xshell::proxy::XshellProxy;
use wcsa_transport::{LifecycleContext, Listener, TransportError};

fn context() -> LifecycleContext {
    let cancel = CancellationToken::new();
    let backend = Arc::new(Agent::from(EphemeralKeyAgent::default()));
    LifecycleContext::new(ConnectionHandler::new(backend, cancel.clone()), cancel)
        .with_timeouts(Duration::from_secs(2), Duration::from_secs(2))
}

fn start<L: Listener + 'static>(
    listener: L,
    ctx: &LifecycleContext,
) -> JoinHandle<Result<(), TransportError>> {
    let ctx = ctx.clone();
    tokio::spawn(async move { listener.run(ctx).await })
}

async fn wait_running(ctx: &LifecycleContext, kind: TransportKind) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !ctx.status.is_running(kind) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener did not start");
}

fn read_sentinel(path: &Path) -> (u16, [u8; cygwin::SECRET_LEN]) {
    let text = std::fs::read_to_string(path).unwrap();
    cygwin::parse_sentinel(&text).unwrap()
}

#[tokio::test]
async fn test_cygwin_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context();
    let listener = CygwinListener::new(dir.path());
    let sentinel = listener.path().to_path_buf();
    let task = start(listener, &ctx);
    wait_running(&ctx, TransportKind::Cygwin).await;

    let help = ctx.status.help(TransportKind::Cygwin);
    assert!(help.starts_with("export SSH_AUTH_SOCK="));

    let (port, secret) = read_sentinel(&sentinel);
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (stream, server_pid) = cygwin::connect_handshake(stream, &secret, 4242).await.unwrap();
    assert_eq!(server_pid, std::process::id());

    let mut client = AgentClient::new(stream);
    assert!(client.list().await.unwrap().is_empty());
    assert!(matches!(
        client.sign(b"unknown", b"data", SignFlags::default()).await,
        Err(AgentError::RemoteFailure)
    ));

    ctx.cancel.cancel();
    task.await.unwrap().unwrap();
    assert!(!sentinel.exists());
    assert!(!ctx.status.is_running(TransportKind::Cygwin));
}

#[tokio::test]
async fn test_cygwin_wrong_secret_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context();
    let listener = CygwinListener::new(dir.path());
    let sentinel = listener.path().to_path_buf();
    let task = start(listener, &ctx);
    wait_running(&ctx, TransportKind::Cygwin).await;

    let (port, mut secret) = read_sentinel(&sentinel);
    secret[0] ^= 0xff;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&secret).await.unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    ctx.cancel.cancel();
    task.await.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_wsl_unix_socket_end_to_end() {
    use wcsa_transport::wsl::{WslListener, SOCKET_FILE};

    let dir = tempfile::tempdir().unwrap();
    let ctx = context();
    let task = start(WslListener::new(dir.path()), &ctx);
    wait_running(&ctx, TransportKind::Wsl).await;

    let path = dir.path().join(SOCKET_FILE);
    let stream = tokio::net::UnixStream::connect(&path).await.unwrap();
    let mut client = AgentClient::new(stream);
    assert!(client.list().await.unwrap().is_empty());

    ctx.cancel.cancel();
    task.await.unwrap().unwrap();
    assert!(!path.exists());
}

/// Sign request for an unknown key, without the trailing flags field
fn truncated_sign_request() -> Vec<u8> {
    let mut body = vec![13];
    body.extend_from_slice(&3u32.to_be_bytes());
    body.extend_from_slice(b"key");
    body.extend_from_slice(&4u32.to_be_bytes());
    body.extend_from_slice(b"data");

    let mut frame = (body.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(&body);
    frame
}

#[tokio::test]
async fn test_xshell_handshake_and_patched_request() {
    const COOKIE: &str = "Xy7pQ2m";

    let ctx = context();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handler = ctx.handler.clone();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let stream = handshake(stream, COOKIE).await.unwrap();
        handler
            .serve(XshellProxy::new(stream, XshellWriteMode::Reassemble))
            .await;
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut stream = connect_handshake(stream, COOKIE, 0x10, 3).await.unwrap();

    // Without the patch the agent could not parse this and would hang up.
    stream.write_all(&truncated_sign_request()).await.unwrap();
    let mut failure = [0u8; 5];
    stream.read_exact(&mut failure).await.unwrap();
    assert_eq!(failure, [0, 0, 0, 1, 5]);

    let mut client = AgentClient::new(stream);
    assert!(client.list().await.unwrap().is_empty());
    drop(client);

    server.await.unwrap();
}
