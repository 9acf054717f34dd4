//! Effective configuration: the TOML file plus command-line overrides

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use wcsa_core::config::{self, AgentConfig};
use wcsa_core::{TransportKind, XshellWriteMode};

/// Settings that can be overridden on the command line
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// Directory for the Cygwin sentinel and the WSL socket
    #[arg(long, global = true, value_name = "DIR")]
    pub socket_dir: Option<PathBuf>,

    /// Transport to serve (repeatable, replaces the configured list)
    #[arg(long = "transport", global = true, value_name = "NAME")]
    pub transports: Vec<TransportKind>,

    /// How the Xshell proxy forwards responses: passthrough or reassemble
    #[arg(long, global = true, value_name = "MODE")]
    pub xshell_write_mode: Option<XshellWriteMode>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(dir) = &self.socket_dir {
            config.socket_dir = Some(dir.clone());
        }
        if !self.transports.is_empty() {
            let mut transports = self.transports.clone();
            transports.sort_unstable();
            transports.dedup();
            config.transports = transports;
        }
        if let Some(mode) = self.xshell_write_mode {
            config.xshell_write_mode = mode;
        }
    }
}

/// Read the configuration file
///
/// An explicit path must exist and parse. The default path is optional, and
/// a default file that fails to parse is reported and ignored.
pub fn load_agent_config(path: Option<&Path>) -> Result<AgentConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if !default_path.exists() {
        tracing::debug!("No config file at {:?}, using defaults", default_path);
        return Ok(AgentConfig::default());
    }

    Ok(config::load_config(&default_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
        AgentConfig::default()
    }))
}

/// Load, override and validate
pub fn effective_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<AgentConfig> {
    let mut config = load_agent_config(path)?;
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_overrides_replace_transports() {
        let mut config = AgentConfig::default();
        let overrides = ConfigOverrides {
            socket_dir: Some(PathBuf::from("/tmp/agent")),
            transports: vec![TransportKind::Xshell, TransportKind::Cygwin, TransportKind::Xshell],
            xshell_write_mode: Some(XshellWriteMode::Reassemble),
        };
        overrides.apply(&mut config);

        assert_eq!(config.socket_dir, Some(PathBuf::from("/tmp/agent")));
        assert_eq!(config.transports, vec![TransportKind::Cygwin, TransportKind::Xshell]);
        assert_eq!(config.xshell_write_mode, XshellWriteMode::Reassemble);
    }

    #[test]
    fn test_empty_overrides_keep_config() {
        let mut config = AgentConfig::default();
        let before = config.transports.clone();
        ConfigOverrides::default().apply(&mut config);
        assert_eq!(config.transports, before);
        assert!(config.socket_dir.is_none());
    }

    #[test]
    fn test_explicit_file_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "enable_keyring = false\nshutdown_timeout = 9\n").unwrap();

        let config = load_agent_config(Some(&path)).unwrap();
        assert!(!config.enable_keyring);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(9));
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_agent_config(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_broken_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "transports = [\"putty\"]\n").unwrap();
        assert!(load_agent_config(Some(&path)).is_err());
    }

    #[test]
    fn test_effective_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[hyperv]\npoll_interval = 0\n").unwrap();
        assert!(effective_config(Some(&path), &ConfigOverrides::default()).is_err());
    }
}
