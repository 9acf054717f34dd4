//! CLI command implementations

mod config;
mod keys;
mod run;
mod transports;

pub use config::{config_init, config_path, config_show};
pub use keys::keys_command;
pub use run::{run_agent, shutdown_signal};
pub use transports::transports_command;
