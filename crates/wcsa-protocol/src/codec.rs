//! Framing for agent messages
//!
//! Every message travels as a big-endian `u32` payload length followed by
//! the payload, whose first byte is the message number.

use tokio_util::codec::LengthDelimitedCodec;

/// Maximum payload size accepted from a peer (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Length-delimited codec matching the agent framing
///
/// An oversized length prefix is rejected before its payload is buffered.
pub fn agent_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_MESSAGE_SIZE)
        .new_codec()
}
