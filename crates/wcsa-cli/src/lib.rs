//! wcsa-cli: Command-line entry point for the WinCrypt SSH agent
//!
//! Provides the `wcsa` binary: it assembles the agent backend, starts the
//! enabled transports and answers small inspection commands.

pub mod backend;
pub mod commands;
pub mod output;
pub mod settings;
