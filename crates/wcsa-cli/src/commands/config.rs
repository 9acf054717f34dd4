//! Config command implementations

use std::path::Path;

use anyhow::{bail, Context, Result};
use wcsa_core::config::{self, AgentConfig};

use crate::output::print_success;

/// Print the effective configuration as TOML
pub fn config_show(config: &AgentConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render config")?;
    print!("{}", rendered);
    Ok(())
}

/// Write a config file holding the defaults
///
/// An existing file is only replaced with `force`.
pub fn config_init(path: Option<&Path>, force: bool) -> Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_config_path);
    if path.exists() && !force {
        bail!("Config file already exists: {:?} (use --force to replace it)", path);
    }

    config::save_config(&path, &AgentConfig::default())
        .with_context(|| format!("Failed to write config to {:?}", path))?;
    print_success(&format!("Wrote default configuration to {:?}", path));
    Ok(())
}

/// Print where the default config file lives
pub fn config_path() {
    println!("{}", config::default_config_path().display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_config_loads_back() {
        let mut config = AgentConfig::default();
        config.enable_keyring = false;
        config.hyperv.poll_interval = std::time::Duration::from_secs(42);

        let rendered = toml::to_string_pretty(&config).unwrap();
        let loaded: AgentConfig = toml::from_str(&rendered).unwrap();
        assert!(!loaded.enable_keyring);
        assert_eq!(loaded.hyperv.poll_interval, config.hyperv.poll_interval);
        assert_eq!(loaded.transports, config.transports);
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        config_init(Some(&path), false).unwrap();
        let loaded: AgentConfig = config::load_config(&path).unwrap();
        assert!(loaded.enable_keyring);

        std::fs::write(&path, "enable_keyring = false\n").unwrap();
        assert!(config_init(Some(&path), false).is_err());
        let kept: AgentConfig = config::load_config(&path).unwrap();
        assert!(!kept.enable_keyring);

        config_init(Some(&path), true).unwrap();
        let replaced: AgentConfig = config::load_config(&path).unwrap();
        assert!(replaced.enable_keyring);
    }
}
