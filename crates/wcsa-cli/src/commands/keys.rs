//! Keys command implementation

use anyhow::{Context, Result};
use wcsa_agent::AgentBackend;
use wcsa_core::config::AgentConfig;

use crate::backend;
use crate::output::{format_keys, print_warning};

/// Print the public keys the backend offers, in authorized_keys form
pub async fn keys_command(config: &AgentConfig) -> Result<()> {
    let (agent, mode) = backend::build(config).await?;
    tracing::debug!(backend = agent.kind(), ?mode, "Listing keys");

    let keys = agent.list().await.context("Failed to list keys")?;
    if keys.is_empty() {
        print_warning("No keys available");
        return Ok(());
    }

    print!("{}", format_keys(&keys));
    Ok(())
}
