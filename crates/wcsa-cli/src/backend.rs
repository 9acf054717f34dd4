//! Backend assembly
//!
//! A process that can reach an agent on its Hyper-V host is a guest and
//! relays to it. Anything else serves the local certificate store, with the
//! in-memory keyring in front when enabled.

use std::sync::Arc;

use anyhow::{Context, Result};
use wcsa_agent::{
    log_notifier, Agent, AgentClient, BoxedStream, CertificateAgent, CertificateStore,
    CompositeAgent, EphemeralKeyAgent, RemoteProxyAgent, SharedNotifier,
};
use wcsa_core::config::{AgentConfig, HyperVConfig};
use wcsa_transport::hyperv::{self, HostDialer};

/// Where this process sits relative to a Hyper-V host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Host,
    Guest,
}

impl Mode {
    pub fn is_guest(self) -> bool {
        self == Mode::Guest
    }
}

/// Try to reach the host agent within `detect_host_timeout`
pub async fn detect_host(config: &HyperVConfig) -> Option<BoxedStream> {
    let dial = hyperv::dial_host(config.service_port);
    match tokio::time::timeout(config.detect_host_timeout, dial).await {
        Ok(Ok(stream)) => Some(stream),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "No Hyper-V host agent");
            None
        }
        Err(_) => {
            tracing::debug!("Timed out looking for a Hyper-V host agent");
            None
        }
    }
}

/// Relay to the host agent over `stream`, re-dialing if it drops
pub fn guest_backend(stream: BoxedStream, config: &HyperVConfig) -> Agent {
    let dialer = HostDialer::new(config.service_port, config.detect_host_timeout);
    RemoteProxyAgent::new(AgentClient::new(stream))
        .with_dialer(Arc::new(dialer))
        .into()
}

/// Certificate store agent, behind the keyring when enabled
pub fn host_backend(
    config: &AgentConfig,
    store: CertificateStore,
    notifier: SharedNotifier,
) -> Result<Agent> {
    if !store.is_available() {
        tracing::info!("No certificate store on this platform, serving keyring keys only");
    }
    let certificate_dir = config
        .certificate_dir()
        .context("Failed to resolve the certificate directory")?;
    let certificates = CertificateAgent::new(store, certificate_dir, notifier.clone());

    if !config.enable_keyring {
        return Ok(certificates.into());
    }
    Ok(CompositeAgent::new(EphemeralKeyAgent::new(notifier), vec![certificates.into()]).into())
}

/// Decide host or guest mode and build the matching backend
pub async fn build(config: &AgentConfig) -> Result<(Agent, Mode)> {
    if let Some(stream) = detect_host(&config.hyperv).await {
        tracing::info!("Found an agent on the Hyper-V host, running as guest");
        return Ok((guest_backend(stream, &config.hyperv), Mode::Guest));
    }
    let backend = host_backend(config, CertificateStore::system(), log_notifier())?;
    Ok((backend, Mode::Host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wcsa_agent::AgentBackend;
    use wcsa_core::TransportKind;

    fn config(enable_keyring: bool, dir: &std::path::Path) -> AgentConfig {
        AgentConfig {
            certificate_dir: Some(dir.to_path_buf()),
            transports: vec![TransportKind::Cygwin],
            enable_keyring,
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn test_host_backend_with_keyring() {
        let dir = tempfile::tempdir().unwrap();
        let backend = host_backend(
            &config(true, dir.path()),
            CertificateStore::unavailable(),
            log_notifier(),
        )
        .unwrap();

        assert_eq!(backend.kind(), "composite");
        assert!(backend.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_host_backend_without_keyring() {
        let dir = tempfile::tempdir().unwrap();
        let backend = host_backend(
            &config(false, dir.path()),
            CertificateStore::unavailable(),
            log_notifier(),
        )
        .unwrap();
        assert_eq!(backend.kind(), "certificate");
    }

    #[tokio::test]
    async fn test_guest_backend_relays() {
        let (client, _server) = tokio::io::duplex(1024);
        let backend = guest_backend(Box::new(client), &HyperVConfig::default());
        assert_eq!(backend.kind(), "remote");
        assert!(Mode::Guest.is_guest());
        assert!(!Mode::Host.is_guest());
    }
}
