//! Public key identities as exchanged by the agent protocol

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use ssh_encoding::Decode;

use crate::error::ProtocolError;

/// One entry of an identities answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyEntry {
    /// Key format name, e.g. `ssh-rsa` or `ecdsa-sha2-nistp256-cert-v01@openssh.com`
    pub format: String,
    /// SSH-encoded public key (or certificate) blob
    pub blob: Bytes,
    /// Human-readable comment
    pub comment: String,
}

impl PublicKeyEntry {
    /// Build an entry from an encoded blob, reading the format from its first field
    pub fn from_blob(blob: impl Into<Bytes>, comment: impl Into<String>) -> Result<Self, ProtocolError> {
        let blob = blob.into();
        let format = String::decode(&mut blob.as_ref())?;
        Ok(Self {
            format,
            blob,
            comment: comment.into(),
        })
    }

    /// Base64 rendering of the blob
    pub fn blob_base64(&self) -> String {
        STANDARD.encode(&self.blob)
    }

    /// Whether this entry denotes the given blob
    pub fn matches(&self, blob: &[u8]) -> bool {
        self.blob.as_ref() == blob
    }
}

/// authorized_keys line: `format base64 comment`
impl fmt::Display for PublicKeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.format, self.blob_base64())?;
        if !self.comment.is_empty() {
            write!(f, " {}", self.comment)?;
        }
        Ok(())
    }
}
