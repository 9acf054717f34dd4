//! Error types for agent backends

use thiserror::Error;
use wcsa_protocol::ProtocolError;

/// Errors surfaced by an agent backend
///
/// Every variant maps to `SSH_AGENT_FAILURE` on the wire; the distinction
/// only matters for logging and for callers composing backends.
#[derive(Error, Debug)]
pub enum AgentError {
    /// No identity matches the requested key blob
    #[error("key not found")]
    NotFound,

    /// The backend does not implement the operation
    #[error("{0} is not supported by this agent")]
    Unsupported(&'static str),

    /// The keyring is locked
    #[error("agent is locked")]
    Locked,

    /// Unlock was requested on an unlocked keyring
    #[error("agent is not locked")]
    NotLocked,

    /// Unlock passphrase did not match
    #[error("incorrect passphrase")]
    IncorrectPassphrase,

    /// Signature flags name no known algorithm
    #[error("unsupported signature flags: {0:#x}")]
    UnsupportedFlags(u32),

    /// Flags ask for an algorithm the key type cannot select
    #[error("algorithm selection is not supported for {0} keys")]
    AlgorithmSelectionUnsupported(String),

    /// Added key has a type this agent refuses
    #[error("unsupported key type")]
    UnsupportedKeyType,

    /// Added key carries a constraint this agent cannot enforce
    #[error("unsupported key constraint")]
    UnsupportedConstraint,

    /// Added key material could not be decoded
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Certificate store failure
    #[error("certificate store error: {0}")]
    Store(#[from] StoreError),

    /// Signing operation failed
    #[error("signing failed: {0}")]
    Signing(String),

    /// Remote agent answered with SSH_AGENT_FAILURE
    #[error("remote agent refused the request")]
    RemoteFailure,

    /// Remote agent could not be reached or answered nonsense
    #[error("remote agent error: {0}")]
    Remote(String),

    /// Wire protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<signature::Error> for AgentError {
    fn from(e: signature::Error) -> Self {
        AgentError::Signing(e.to_string())
    }
}

/// Errors from the system certificate store
#[derive(Error, Debug)]
pub enum StoreError {
    /// No certificate store on this platform
    #[error("certificate store is not available on this platform")]
    Unavailable,

    /// An OS call failed
    #[error("{operation} failed: {source}")]
    Os {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Certificate could not be parsed
    #[error("malformed certificate: {0}")]
    Certificate(String),

    /// Signed message envelope could not be parsed
    #[error("malformed signature envelope: {0}")]
    Envelope(String),

    /// Certificate key algorithm is neither RSA nor ECDSA
    #[error("unsupported certificate key: {0}")]
    UnsupportedKey(String),
}

impl StoreError {
    /// Wrap the calling thread's last OS error
    pub fn last_os_error(operation: &'static str) -> Self {
        StoreError::Os {
            operation,
            source: std::io::Error::last_os_error(),
        }
    }
}

impl From<der::Error> for StoreError {
    fn from(e: der::Error) -> Self {
        StoreError::Certificate(e.to_string())
    }
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;
