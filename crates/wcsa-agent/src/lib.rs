//! wcsa-agent: SSH agent backends
//!
//! The daemon serves one backend to every transport. Backends come from
//! the certificate store (smart cards), an in-memory keyring fed by
//! `ssh-add`, a relay to another agent, or a composite of these.
//! [`ConnectionHandler`] speaks the agent protocol against the backend on
//! any byte stream a transport hands it.

pub mod backend;
pub mod certificate;
pub mod client;
pub mod composite;
pub mod error;
pub mod keyring;
pub mod notify;
pub mod remote;
pub mod server;

pub use backend::{Agent, AgentBackend, KeySigner};
pub use certificate::{CertificateAgent, CertificateStore};
pub use client::{AgentClient, AgentStream, BoxedStream};
pub use composite::CompositeAgent;
pub use error::{AgentError, Result, StoreError};
pub use keyring::EphemeralKeyAgent;
pub use notify::{log_notifier, LogNotifier, Notifier, SharedNotifier};
pub use remote::{Dialer, RemoteProxyAgent};
pub use server::ConnectionHandler;
