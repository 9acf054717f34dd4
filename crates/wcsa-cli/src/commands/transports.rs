//! Transports command implementation

use wcsa_core::config::AgentConfig;

use crate::output::format_transports;

pub fn transports_command(config: &AgentConfig) {
    println!("{}", format_transports(config));
}
