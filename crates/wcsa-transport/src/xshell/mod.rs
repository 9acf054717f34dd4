//! Xshell (NetSarang Xagent) compatibility
//!
//! Xshell talks the agent protocol over loopback TCP after a cookie
//! handshake. It learns the port and cookie from a pair of windows, see
//! [`beacon`].

pub mod beacon;
pub mod handshake;
pub mod proxy;

use std::sync::Arc;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::TcpListener;
use wcsa_core::{TransportKind, XshellWriteMode};

use crate::error::{HandshakeError, TransportError};
use crate::lifecycle::{accept_loop, Connections, LifecycleContext, Listener, MenuEntry};
use beacon::Beacon;
use proxy::XshellProxy;

/// Frame ceiling, length prefix included
pub const MAX_FRAME: usize = 16 << 20;

/// Opcode of the init message and its acknowledgement
pub const OPCODE_INIT: u8 = 99;

pub const COOKIE_LEN: usize = 7;

/// Fresh random alphanumeric cookie
pub fn generate_cookie() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(COOKIE_LEN)
        .map(char::from)
        .collect()
}

/// Cookie-authenticated TCP listener for Xshell
pub struct XshellListener {
    write_mode: XshellWriteMode,
}

impl XshellListener {
    pub fn new(write_mode: XshellWriteMode) -> Self {
        Self { write_mode }
    }
}

#[async_trait]
impl Listener for XshellListener {
    fn kind(&self) -> TransportKind {
        TransportKind::Xshell
    }

    fn menu(&self) -> Vec<MenuEntry> {
        Vec::new()
    }

    async fn run(&self, ctx: LifecycleContext) -> Result<(), TransportError> {
        let mut listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| TransportError::bind("127.0.0.1:0", e))?;
        let port = listener.local_addr()?.port();

        let cookie: Arc<str> = generate_cookie().into();
        let beacon = Beacon::spawn(&cookie, port)
            .map_err(|e| TransportError::bind(beacon::AGENT_WINDOW_CLASS, e))?;

        tracing::info!(port, mode = ?self.write_mode, "Xshell agent ready");
        let status = ctx.status.publish(self.kind(), "");

        let mode = self.write_mode;
        let connections = Connections::new(self.kind(), &ctx);
        let result = accept_loop(&ctx, &mut listener, &connections, move |stream| {
            let cookie = cookie.clone();
            async move {
                let stream = handshake::handshake(stream, &cookie).await?;
                Ok::<_, HandshakeError>(XshellProxy::new(stream, mode))
            }
        })
        .await;

        drop(listener);
        connections.drain(ctx.drain_timeout).await;
        drop(status);
        beacon.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_shape() {
        let cookie = generate_cookie();
        assert_eq!(cookie.len(), COOKIE_LEN);
        assert!(cookie.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(generate_cookie(), generate_cookie());
    }
}
