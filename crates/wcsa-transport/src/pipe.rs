//! Windows OpenSSH named pipe
//!
//! The native OpenSSH client and SecureCRT both dial the same well-known
//! pipe, so one listener serves both. There is no handshake: the pipe's
//! default ACL already restricts it to the current user.

use async_trait::async_trait;
use wcsa_core::TransportKind;

use crate::error::TransportError;
use crate::lifecycle::{LifecycleContext, Listener, MenuEntry};

/// Pipe path used by Windows OpenSSH
pub const PIPE_NAME: &str = r"\\.\pipe\openssh-ssh-agent";

pub fn winssh_help() -> String {
    format!("set SSH_AUTH_SOCK={}", PIPE_NAME)
}

pub fn securecrt_help() -> String {
    format!("setx \"VANDYKE_SSH_AUTH_SOCK\" \"{}\"", PIPE_NAME)
}

/// Named pipe listener for WinSSH and SecureCRT
#[derive(Debug, Default)]
pub struct PipeListener;

impl PipeListener {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Listener for PipeListener {
    fn kind(&self) -> TransportKind {
        TransportKind::WinSsh
    }

    fn menu(&self) -> Vec<MenuEntry> {
        vec![
            MenuEntry::help(TransportKind::WinSsh),
            MenuEntry::help(TransportKind::SecureCrt),
        ]
    }

    #[cfg(windows)]
    async fn run(&self, ctx: LifecycleContext) -> Result<(), TransportError> {
        use crate::lifecycle::{accept_loop, no_handshake, Connections};

        let mut acceptor = imp::PipeAcceptor::bind(PIPE_NAME)
            .map_err(|e| TransportError::bind(PIPE_NAME, e))?;

        tracing::info!(pipe = PIPE_NAME, "Named pipe ready");
        let _winssh = ctx.status.publish(TransportKind::WinSsh, winssh_help());
        let _securecrt = ctx.status.publish(TransportKind::SecureCrt, securecrt_help());

        let connections = Connections::new(self.kind(), &ctx);
        let result = accept_loop(&ctx, &mut acceptor, &connections, no_handshake).await;
        // Closing the pending instance unblocks a client stuck in connect.
        drop(acceptor);
        connections.drain(ctx.drain_timeout).await;
        result
    }

    #[cfg(not(windows))]
    async fn run(&self, _ctx: LifecycleContext) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(self.kind()))
    }
}

#[cfg(windows)]
mod imp {
    use std::io;

    use async_trait::async_trait;
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    use crate::lifecycle::Acceptor;

    /// Keeps one instance waiting for the next client
    pub struct PipeAcceptor {
        name: &'static str,
        pending: NamedPipeServer,
    }

    impl PipeAcceptor {
        pub fn bind(name: &'static str) -> io::Result<Self> {
            let pending = ServerOptions::new().first_pipe_instance(true).create(name)?;
            Ok(Self { name, pending })
        }
    }

    #[async_trait]
    impl Acceptor for PipeAcceptor {
        type Stream = NamedPipeServer;

        async fn accept(&mut self) -> io::Result<(Self::Stream, String)> {
            self.pending.connect().await?;
            let next = ServerOptions::new().create(self.name)?;
            let connected = std::mem::replace(&mut self.pending, next);
            Ok((connected, "pipe".to_string()))
        }
    }
}
