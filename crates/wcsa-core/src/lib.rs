//! wcsa-core: Core types and configuration for the WinCrypt SSH agent
//!
//! This crate provides the transport identities, configuration structures
//! and process-level helpers shared by the agent, transport and CLI crates.

pub mod config;
pub mod error;
pub mod instance;
pub mod types;

pub use error::ConfigError;
pub use types::{TransportKind, VmId, XshellWriteMode};
