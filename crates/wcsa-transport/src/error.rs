//! Transport error types

use std::io;

use thiserror::Error;
use wcsa_core::TransportKind;

/// Errors that stop a listener
///
/// Each listener reports its own; the other transports keep running.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not create the listening endpoint
    #[error("failed to listen on {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Accept failed for a reason other than a timeout
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The transport cannot run on this platform
    #[error("{0} is not supported on this platform")]
    Unsupported(TransportKind),

    /// The listener task panicked
    #[error("listener panicked: {0}")]
    Panicked(String),

    /// Listener setup failed after binding
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn bind(endpoint: impl Into<String>, source: io::Error) -> Self {
        TransportError::Bind {
            endpoint: endpoint.into(),
            source,
        }
    }
}

/// Reasons a single connection is turned away before reaching the agent
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The peer presented the wrong secret
    #[error("secret mismatch")]
    SecretMismatch,

    /// The peer's first read was not the expected size
    #[error("expected {expected} handshake bytes, got {actual}")]
    UnexpectedLength { expected: usize, actual: usize },

    /// First message had the wrong opcode
    #[error("unexpected opcode {0}")]
    UnexpectedOpcode(u8),

    /// Declared frame exceeds the transport's ceiling
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// Structurally invalid handshake message
    #[error("malformed handshake: {0}")]
    Malformed(&'static str),

    /// The peer did not finish in time
    #[error("handshake timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] io::Error),
}
