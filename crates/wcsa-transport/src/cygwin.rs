//! Cygwin and MSYS2 emulated unix socket
//!
//! Cygwin implements `AF_UNIX` on top of a loopback TCP socket. The socket
//! "file" is a system+read-only file containing `!<socket >PORT s SECRET`.
//! A client connects to the port and proves it read the file by sending the
//! 16 byte secret, which the server echoes. Then both sides swap a 12 byte
//! credentials block (pid, uid, gid as little-endian u32).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use wcsa_core::TransportKind;

use crate::error::{HandshakeError, TransportError};
use crate::lifecycle::{accept_loop, Connections, LifecycleContext, Listener};

/// Sentinel file name inside the socket directory
pub const SENTINEL_FILE: &str = "wincrypt-cygwin.sock";

pub const SECRET_LEN: usize = 16;
const CREDENTIALS_LEN: usize = 12;

/// Render a secret the way Cygwin prints socket GUIDs
///
/// Four dash-separated groups of 8 hex digits, each group taken from 4
/// bytes in reverse order.
pub fn secret_to_string(secret: &[u8; SECRET_LEN]) -> String {
    secret
        .chunks(4)
        .map(|group| {
            group
                .iter()
                .rev()
                .map(|b| format!("{:02x}", b))
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn secret_from_string(text: &str) -> Option<[u8; SECRET_LEN]> {
    let groups: Vec<&str> = text.split('-').collect();
    if groups.len() != 4 || groups.iter().any(|g| g.len() != 8) {
        return None;
    }

    let mut secret = [0u8; SECRET_LEN];
    for (i, group) in groups.iter().enumerate() {
        let value = u32::from_str_radix(group, 16).ok()?;
        secret[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }
    Some(secret)
}

/// Contents of the sentinel file
pub fn sentinel_contents(port: u16, secret: &[u8; SECRET_LEN]) -> String {
    format!("!<socket >{} s {}", port, secret_to_string(secret))
}

/// Read back the port and secret from sentinel file contents
pub fn parse_sentinel(text: &str) -> Option<(u16, [u8; SECRET_LEN])> {
    let rest = text.trim_end_matches('\0').strip_prefix("!<socket >")?;
    let mut parts = rest.split(' ');
    let port = parts.next()?.parse().ok()?;
    if parts.next()? != "s" {
        return None;
    }
    let secret = secret_from_string(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some((port, secret))
}

fn remove_sentinel(path: &Path) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(metadata) => {
            let mut permissions = metadata.permissions();
            if permissions.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                fs::set_permissions(path, permissions)?;
            }
            fs::remove_file(path)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(windows)]
fn mark_system_readonly(path: &Path) -> io::Result<()> {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::{
        SetFileAttributesW, FILE_ATTRIBUTE_READONLY, FILE_ATTRIBUTE_SYSTEM,
    };

    let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
    // SAFETY: `wide` is NUL terminated and outlives the call
    let ok = unsafe { SetFileAttributesW(wide.as_ptr(), FILE_ATTRIBUTE_SYSTEM | FILE_ATTRIBUTE_READONLY) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(windows))]
fn mark_system_readonly(path: &Path) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)
}

/// Replace the sentinel at `path` with a fresh one
pub fn write_sentinel(path: &Path, port: u16, secret: &[u8; SECRET_LEN]) -> io::Result<()> {
    remove_sentinel(path)?;
    fs::write(path, sentinel_contents(port, secret))?;
    mark_system_readonly(path)
}

/// Server side of the Cygwin handshake
///
/// The secret must arrive in a single read of exactly 16 bytes. The reply
/// credentials carry `pid` in both the pid and gid slots and echo the
/// peer's uid.
pub async fn handshake<S>(
    mut stream: S,
    secret: &[u8; SECRET_LEN],
    pid: u32,
) -> Result<S, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // One spare byte so an oversized first read is detected
    let mut presented = [0u8; SECRET_LEN + 1];
    let n = stream.read(&mut presented).await?;
    if n != SECRET_LEN {
        return Err(HandshakeError::UnexpectedLength {
            expected: SECRET_LEN,
            actual: n,
        });
    }
    if !bool::from(presented[..SECRET_LEN].ct_eq(secret)) {
        return Err(HandshakeError::SecretMismatch);
    }
    stream.write_all(secret).await?;

    let mut credentials = [0u8; CREDENTIALS_LEN];
    stream.read_exact(&mut credentials).await?;
    credentials[0..4].copy_from_slice(&pid.to_le_bytes());
    credentials[8..12].copy_from_slice(&pid.to_le_bytes());
    stream.write_all(&credentials).await?;
    stream.flush().await?;

    Ok(stream)
}

/// Client side of the handshake, for tools and tests
pub async fn connect_handshake<S>(
    mut stream: S,
    secret: &[u8; SECRET_LEN],
    pid: u32,
) -> Result<(S, u32), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(secret).await?;
    let mut echo = [0u8; SECRET_LEN];
    stream.read_exact(&mut echo).await?;
    if !bool::from(echo.ct_eq(secret)) {
        return Err(HandshakeError::SecretMismatch);
    }

    let mut credentials = [0u8; CREDENTIALS_LEN];
    credentials[0..4].copy_from_slice(&pid.to_le_bytes());
    stream.write_all(&credentials).await?;
    stream.read_exact(&mut credentials).await?;
    let server_pid = u32::from_le_bytes([
        credentials[0],
        credentials[1],
        credentials[2],
        credentials[3],
    ]);
    Ok((stream, server_pid))
}

/// Loopback listener advertised through a Cygwin socket file
pub struct CygwinListener {
    path: PathBuf,
}

impl CygwinListener {
    pub fn new(socket_dir: &Path) -> Self {
        Self {
            path: socket_dir.join(SENTINEL_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Listener for CygwinListener {
    fn kind(&self) -> TransportKind {
        TransportKind::Cygwin
    }

    async fn run(&self, ctx: LifecycleContext) -> Result<(), TransportError> {
        let mut listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| TransportError::bind("127.0.0.1:0", e))?;
        let port = listener.local_addr()?.port();

        let mut secret = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        write_sentinel(&self.path, port, &secret)
            .map_err(|e| TransportError::bind(self.path.display().to_string(), e))?;

        tracing::info!(path = ?self.path, port, "Cygwin socket ready");
        let status = ctx.status.publish(
            self.kind(),
            format!(r#"export SSH_AUTH_SOCK="{}""#, self.path.display()),
        );

        let pid = std::process::id();
        let connections = Connections::new(self.kind(), &ctx);
        let result = accept_loop(&ctx, &mut listener, &connections, move |stream| async move {
            handshake(stream, &secret, pid).await
        })
        .await;

        connections.drain(ctx.drain_timeout).await;
        drop(status);
        drop(listener);
        if let Err(e) = remove_sentinel(&self.path) {
            tracing::warn!(path = ?self.path, error = %e, "Failed to remove Cygwin socket file");
        }
        result
    }
}
