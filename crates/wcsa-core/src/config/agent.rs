//! Agent daemon configuration

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use super::duration;
use crate::error::ConfigError;
use crate::types::{TransportKind, XshellWriteMode};

/// Configuration for the agent daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory holding the Cygwin sentinel and the WSL socket.
    /// Defaults to the working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,

    /// Directory searched for `<serial>-cert.pub` / `<comment>-cert.pub`.
    /// Defaults to the working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_dir: Option<PathBuf>,

    /// Transports to serve
    pub transports: Vec<TransportKind>,

    /// Xshell response forwarding mode
    pub xshell_write_mode: XshellWriteMode,

    /// Put an in-memory keyring in front of the certificate store
    pub enable_keyring: bool,

    /// Upper bound for one connection handshake
    #[serde(with = "duration")]
    pub handshake_timeout: Duration,

    /// How long a stopping listener waits for its connections
    #[serde(with = "duration")]
    pub drain_timeout: Duration,

    /// How long the process waits for all listeners at shutdown
    #[serde(with = "duration")]
    pub shutdown_timeout: Duration,

    /// Hyper-V transport settings
    pub hyperv: HyperVConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_dir: None,
            certificate_dir: None,
            transports: TransportKind::platform_defaults(),
            xshell_write_mode: XshellWriteMode::default(),
            enable_keyring: true,
            hyperv: HyperVConfig::default(),
            handshake_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl AgentConfig {
    /// Resolved socket directory
    pub fn socket_dir(&self) -> io::Result<PathBuf> {
        resolve_dir(self.socket_dir.as_ref())
    }

    /// Resolved certificate sidecar directory
    pub fn certificate_dir(&self) -> io::Result<PathBuf> {
        resolve_dir(self.certificate_dir.as_ref())
    }

    /// Whether a transport is enabled
    pub fn is_enabled(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }

    /// Reject settings that would make a listener spin or never run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hyperv.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "hyperv.poll_interval must be at least one second".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "handshake_timeout must be at least one second".to_string(),
            ));
        }
        if let Some(kind) = self.transports.iter().find(|k| !k.is_supported()) {
            return Err(ConfigError::Invalid(format!(
                "transport {} is not supported on this platform",
                kind
            )));
        }
        Ok(())
    }
}

fn resolve_dir(configured: Option<&PathBuf>) -> io::Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    Ok(match configured {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => cwd.join(dir),
        None => cwd,
    })
}

/// Hyper-V / WSL2 transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperVConfig {
    /// Interval between VM discovery polls
    #[serde(with = "duration")]
    pub poll_interval: Duration,

    /// Watch for WSL launcher processes between polls
    pub accelerator: bool,

    /// vsock port the agent listens on and dials
    pub service_port: u32,

    /// How long to try reaching a host agent at startup
    #[serde(with = "duration")]
    pub detect_host_timeout: Duration,
}

impl Default for HyperVConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            accelerator: true,
            service_port: 0x2222_3333,
            detect_host_timeout: Duration::from_secs(1),
        }
    }
}
