//! wcsa-protocol: SSH agent wire protocol
//!
//! Requests are decoded with `ssh-agent-lib` and mapped onto the few
//! operations the agent serves. Sign requests and responses are encoded
//! here with `ssh-encoding`, framed by tokio-util's length-delimited codec.

pub mod codec;
pub mod error;
pub mod identity;
pub mod message;

pub use codec::{agent_codec, MAX_MESSAGE_SIZE};
pub use error::ProtocolError;
pub use identity::PublicKeyEntry;
pub use message::{AddKey, AgentSignature, Constraint, Request, Response, SignFlags, SignRequest};
