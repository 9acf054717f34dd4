//! The agent daemon

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use wcsa_agent::ConnectionHandler;
use wcsa_core::config::AgentConfig;
use wcsa_core::instance::InstanceGuard;
use wcsa_core::TransportKind;
use wcsa_transport::{
    build_listeners, run_all, LifecycleContext, StatusBoard, StatusEvent, TransportError,
};

use crate::backend;

/// Resolve when the process is asked to stop (Ctrl+C, or SIGTERM on unix)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

/// Log each transport's connection help as it comes up
async fn report_status(board: StatusBoard, mut events: broadcast::Receiver<StatusEvent>) {
    loop {
        match events.recv().await {
            Ok(StatusEvent::Ready(kind)) => {
                let help = board.help(kind);
                if help.is_empty() {
                    tracing::info!(transport = %kind, "{} ready", kind.full_name());
                } else {
                    tracing::info!(transport = %kind, "{} ready:\n{}", kind.full_name(), help.trim_end());
                }
            }
            Ok(StatusEvent::Stopped(kind)) => {
                tracing::debug!(transport = %kind, "Transport stopped");
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "Status reporter fell behind");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// Summarise listener results; an error only if every listener failed
fn check_results(results: &[(TransportKind, Result<(), TransportError>)]) -> Result<()> {
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if !results.is_empty() && failed == results.len() {
        bail!("No transport could be started");
    }
    Ok(())
}

/// Serve every enabled transport until `cancel` fires
///
/// Holds the single-instance lock for the whole run. After cancellation the
/// listeners get `shutdown_timeout` to drain; whatever is left is abandoned.
pub async fn run_agent(config: AgentConfig, cancel: CancellationToken) -> Result<()> {
    let _instance = InstanceGuard::acquire_default().context("Failed to start")?;

    let (agent, mode) = backend::build(&config).await?;
    tracing::info!(backend = agent.kind(), ?mode, "Agent backend ready");

    let listeners = build_listeners(&config, mode.is_guest())
        .context("Failed to resolve the socket directory")?;
    if listeners.is_empty() {
        bail!("No transports enabled");
    }
    for entry in listeners.iter().flat_map(|l| l.menu()) {
        tracing::debug!(transport = %entry.kind, label = %entry.label, "Menu entry");
    }

    let status = StatusBoard::new();
    let reporter = tokio::spawn(report_status(status.clone(), status.subscribe()));

    let handler = ConnectionHandler::new(Arc::new(agent), cancel.clone());
    let ctx = LifecycleContext::new(handler, cancel.clone())
        .with_status(status)
        .with_timeouts(config.handshake_timeout, config.drain_timeout);
    let mut running = tokio::spawn(run_all(listeners, ctx));

    let outcome = tokio::select! {
        results = &mut running => Some(results),
        _ = cancel.cancelled() => {
            match tokio::time::timeout(config.shutdown_timeout, &mut running).await {
                Ok(results) => Some(results),
                Err(_) => {
                    tracing::warn!(
                        "Listeners did not stop within {:?}, exiting anyway",
                        config.shutdown_timeout
                    );
                    running.abort();
                    None
                }
            }
        }
    };
    reporter.abort();

    if let Some(results) = outcome {
        let results = results.context("Listener task panicked")?;
        check_results(&results)?;
    }

    tracing::info!("Agent shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_failed_is_an_error() {
        let results = vec![
            (TransportKind::Pageant, Err(TransportError::Unsupported(TransportKind::Pageant))),
            (TransportKind::WinSsh, Err(TransportError::Unsupported(TransportKind::WinSsh))),
        ];
        assert!(check_results(&results).is_err());
    }

    #[test]
    fn test_partial_failure_is_reported_not_fatal() {
        let results = vec![
            (TransportKind::Cygwin, Ok(())),
            (TransportKind::Pageant, Err(TransportError::Unsupported(TransportKind::Pageant))),
        ];
        assert!(check_results(&results).is_ok());
        assert!(check_results(&[]).is_ok());
    }

    #[tokio::test]
    async fn test_status_reporter_stops_when_board_closes() {
        let (tx, rx) = broadcast::channel(4);
        tx.send(StatusEvent::Ready(TransportKind::Wsl)).unwrap();
        drop(tx);
        report_status(StatusBoard::new(), rx).await;
    }
}
