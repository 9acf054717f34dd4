//! wcsa-transport: Local IPC listeners for the WinCrypt SSH agent
//!
//! Each listener imitates one client ecosystem's idea of where an SSH agent
//! lives (a Cygwin socket file, a WSL unix socket, the OpenSSH named pipe,
//! the Pageant window, Xshell's cookie-authenticated port and Hyper-V
//! sockets) and hands every accepted connection to the same
//! [`ConnectionHandler`](wcsa_agent::ConnectionHandler).
//!
//! All listeners share one cancellation token. On cancellation each stops
//! accepting, drains its connections and releases its endpoint.

pub mod cygwin;
pub mod error;
pub mod hyperv;
pub mod lifecycle;
pub mod pageant;
pub mod pipe;
pub mod status;
pub mod wsl;
pub mod xshell;

use std::collections::HashMap;

use tokio::task::JoinSet;
use wcsa_core::config::AgentConfig;
use wcsa_core::TransportKind;

pub use error::{HandshakeError, TransportError};
pub use lifecycle::{LifecycleContext, Listener, MenuEntry};
pub use status::{StatusBoard, StatusEvent, TransportStatus};

/// Listeners for the transports enabled in `config`
///
/// WinSSH and SecureCRT share the named pipe, so either one enables it.
/// A guest (an agent forwarding to a Hyper-V host) never listens on
/// Hyper-V itself.
pub fn build_listeners(
    config: &AgentConfig,
    guest: bool,
) -> std::io::Result<Vec<Box<dyn Listener>>> {
    let socket_dir = config.socket_dir()?;
    let mut listeners: Vec<Box<dyn Listener>> = Vec::new();

    for kind in TransportKind::ALL {
        if !config.is_enabled(kind) {
            continue;
        }
        let listener: Box<dyn Listener> = match kind {
            TransportKind::Cygwin => Box::new(cygwin::CygwinListener::new(&socket_dir)),
            TransportKind::Wsl => Box::new(wsl::WslListener::new(&socket_dir)),
            TransportKind::WinSsh => Box::new(pipe::PipeListener::new()),
            TransportKind::SecureCrt if config.is_enabled(TransportKind::WinSsh) => continue,
            TransportKind::SecureCrt => Box::new(pipe::PipeListener::new()),
            TransportKind::Pageant => Box::new(pageant::PageantListener::new()),
            TransportKind::Xshell => Box::new(xshell::XshellListener::new(config.xshell_write_mode)),
            TransportKind::HyperV if guest => {
                tracing::info!("Running as a Hyper-V guest, Hyper-V listener disabled");
                continue;
            }
            TransportKind::HyperV => Box::new(hyperv::HyperVListener::new(config.hyperv.clone())),
        };
        listeners.push(listener);
    }

    Ok(listeners)
}

/// Run every listener until all have returned
///
/// Each listener gets its own task, so a listener that fails or panics is
/// logged and reported without affecting the others.
pub async fn run_all(
    listeners: Vec<Box<dyn Listener>>,
    ctx: LifecycleContext,
) -> Vec<(TransportKind, Result<(), TransportError>)> {
    let mut running = JoinSet::new();
    let mut kinds = HashMap::new();
    for listener in listeners {
        let kind = listener.kind();
        let ctx = ctx.clone();
        let handle = running.spawn(async move { listener.run(ctx).await });
        kinds.insert(handle.id(), kind);
    }

    let mut results = Vec::new();
    while let Some(joined) = running.join_next_with_id().await {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(e) => (e.id(), Err(TransportError::Panicked(e.to_string()))),
        };
        let Some(kind) = kinds.remove(&id) else {
            continue;
        };
        match &result {
            Ok(()) => tracing::info!(transport = %kind, "Listener stopped"),
            Err(e) => tracing::error!(transport = %kind, error = %e, "Listener failed"),
        }
        results.push((kind, result));
    }
    results
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(transports: Vec<TransportKind>, dir: &std::path::Path) -> AgentConfig {
        AgentConfig {
            socket_dir: Some(dir.to_path_buf()),
            transports,
            ..AgentConfig::default()
        }
    }

    fn kinds(listeners: &[Box<dyn Listener>]) -> Vec<TransportKind> {
        listeners.iter().map(|l| l.kind()).collect()
    }

    #[test]
    fn test_build_listeners_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(
            vec![TransportKind::Xshell, TransportKind::Cygwin, TransportKind::Wsl],
            dir.path(),
        );
        let listeners = build_listeners(&config, false).unwrap();
        assert_eq!(
            kinds(&listeners),
            vec![TransportKind::Cygwin, TransportKind::Wsl, TransportKind::Xshell]
        );
    }

    #[test]
    fn test_pipe_listener_built_once() {
        let dir = tempfile::tempdir().unwrap();
        let both = config(vec![TransportKind::WinSsh, TransportKind::SecureCrt], dir.path());
        assert_eq!(kinds(&build_listeners(&both, false).unwrap()), vec![TransportKind::WinSsh]);

        let crt_only = config(vec![TransportKind::SecureCrt], dir.path());
        assert_eq!(kinds(&build_listeners(&crt_only, false).unwrap()), vec![TransportKind::WinSsh]);
    }

    #[test]
    fn test_guest_skips_hyperv() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(vec![TransportKind::HyperV, TransportKind::Wsl], dir.path());
        assert_eq!(kinds(&build_listeners(&config, true).unwrap()), vec![TransportKind::Wsl]);
        assert_eq!(
            kinds(&build_listeners(&config, false).unwrap()),
            vec![TransportKind::Wsl, TransportKind::HyperV]
        );
    }

    #[tokio::test]
    async fn test_run_all_reports_each_listener() {
        use std::sync::Arc;

        use tokio_util::sync::CancellationToken;
        use wcsa_agent::{Agent, ConnectionHandler, EphemeralKeyAgent};

        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let backend = Arc::new(Agent::from(EphemeralKeyAgent::default()));
        let ctx = LifecycleContext::new(ConnectionHandler::new(backend, cancel.clone()), cancel.clone())
            .with_timeouts(Duration::from_secs(1), Duration::from_secs(1));

        let listeners: Vec<Box<dyn Listener>> = vec![
            Box::new(cygwin::CygwinListener::new(dir.path())),
            Box::new(pipe::PipeListener::new()),
        ];
        let status = ctx.status.clone();
        let task = tokio::spawn(run_all(listeners, ctx));

        while !status.is_running(TransportKind::Cygwin) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();

        let results = task.await.unwrap();
        assert_eq!(results.len(), 2);
        let (_, cygwin_result) = results
            .iter()
            .find(|(kind, _)| *kind == TransportKind::Cygwin)
            .unwrap();
        assert!(cygwin_result.is_ok());
        assert!(!status.is_running(TransportKind::Cygwin));
        assert!(!dir.path().join(cygwin::SENTINEL_FILE).exists());
    }

    struct PanickingListener;

    #[async_trait::async_trait]
    impl Listener for PanickingListener {
        fn kind(&self) -> TransportKind {
            TransportKind::Pageant
        }

        async fn run(&self, _ctx: LifecycleContext) -> Result<(), TransportError> {
            panic!("listener blew up");
        }
    }

    #[tokio::test]
    async fn test_run_all_survives_listener_panic() {
        use std::sync::Arc;

        use tokio_util::sync::CancellationToken;
        use wcsa_agent::{Agent, ConnectionHandler, EphemeralKeyAgent};

        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let backend = Arc::new(Agent::from(EphemeralKeyAgent::default()));
        let ctx = LifecycleContext::new(ConnectionHandler::new(backend, cancel.clone()), cancel.clone())
            .with_timeouts(Duration::from_secs(1), Duration::from_secs(1));

        let listeners: Vec<Box<dyn Listener>> = vec![
            Box::new(PanickingListener),
            Box::new(cygwin::CygwinListener::new(dir.path())),
        ];
        let status = ctx.status.clone();
        let task = tokio::spawn(run_all(listeners, ctx));

        while !status.is_running(TransportKind::Cygwin) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The panic has already been collected, Cygwin keeps serving
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(status.is_running(TransportKind::Cygwin));
        cancel.cancel();

        let results = task.await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results.iter().find(|(kind, _)| *kind == TransportKind::Pageant),
            Some((_, Err(TransportError::Panicked(_))))
        ));
        assert!(matches!(
            results.iter().find(|(kind, _)| *kind == TransportKind::Cygwin),
            Some((_, Ok(())))
        ));
    }
}
