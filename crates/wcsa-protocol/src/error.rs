//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A field could not be decoded or encoded
    #[error("Malformed message: {0}")]
    Encoding(#[from] ssh_encoding::Error),

    /// Request rejected by the agent protocol decoder
    #[error("Undecodable request: {0}")]
    Request(String),

    /// Zero-length frame
    #[error("Empty message")]
    EmptyMessage,

    /// Added key material was not usable
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] ssh_key::Error),

    /// Added credential is not a plain private key
    #[error("Unsupported credential")]
    UnsupportedCredential,

    /// Response type that does not answer the request
    #[error("Unexpected response message: {0}")]
    UnexpectedResponse(u8),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
