//! Xshell agent handshake
//!
//! ```text
//! client: u32 len | 99 | u32 flag | u32 cookie_len | cookie bytes...
//! server: u32 5   | 99 | u32 flag
//! ```
//!
//! Xshell may declare a frame shorter than the cookie, in which case the
//! rest of the cookie follows the frame directly on the socket.

use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{MAX_FRAME, OPCODE_INIT};
use crate::error::HandshakeError;

/// Flag and cookie presented by a client
struct InitMessage {
    flag: u32,
    cookie_len: usize,
    partial: Vec<u8>,
}

fn parse_init(payload: &[u8]) -> Result<InitMessage, HandshakeError> {
    let (&opcode, rest) = payload
        .split_first()
        .ok_or(HandshakeError::Malformed("empty init message"))?;
    if opcode != OPCODE_INIT {
        return Err(HandshakeError::UnexpectedOpcode(opcode));
    }
    if rest.len() < 8 {
        return Err(HandshakeError::Malformed("truncated init message"));
    }

    let flag = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    let cookie_len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
    Ok(InitMessage {
        flag,
        cookie_len,
        partial: rest[8..].to_vec(),
    })
}

/// Acknowledgement frame echoing the client's flag
pub fn ack_frame(flag: u32) -> [u8; 9] {
    let mut ack = [0u8; 9];
    ack[..4].copy_from_slice(&5u32.to_be_bytes());
    ack[4] = OPCODE_INIT;
    ack[5..].copy_from_slice(&flag.to_be_bytes());
    ack
}

/// Server side: verify the client's cookie and acknowledge it
pub async fn handshake<S>(mut stream: S, cookie: &str) -> Result<S, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len + 4 > MAX_FRAME {
        return Err(HandshakeError::FrameTooLarge {
            size: len + 4,
            max: MAX_FRAME,
        });
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;

    let init = parse_init(&payload)?;
    if init.cookie_len != cookie.len() {
        return Err(HandshakeError::Malformed("cookie length"));
    }
    if init.cookie_len < init.partial.len() {
        return Err(HandshakeError::Malformed("cookie longer than declared"));
    }

    let mut presented = init.partial;
    let have = presented.len();
    presented.resize(init.cookie_len, 0);
    stream.read_exact(&mut presented[have..]).await?;
    if !bool::from(presented.as_slice().ct_eq(cookie.as_bytes())) {
        return Err(HandshakeError::SecretMismatch);
    }

    stream.write_all(&ack_frame(init.flag)).await?;
    stream.flush().await?;
    Ok(stream)
}

/// Client side, sending `split` cookie bytes inside the frame
///
/// The remainder is written after the frame the way Xshell does.
pub async fn connect_handshake<S>(
    mut stream: S,
    cookie: &str,
    flag: u32,
    split: usize,
) -> Result<S, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cookie = cookie.as_bytes();
    let split = split.min(cookie.len());

    let mut frame = Vec::with_capacity(13 + cookie.len());
    frame.extend_from_slice(&(9 + split as u32).to_be_bytes());
    frame.push(OPCODE_INIT);
    frame.extend_from_slice(&flag.to_be_bytes());
    frame.extend_from_slice(&(cookie.len() as u32).to_be_bytes());
    frame.extend_from_slice(cookie);
    stream.write_all(&frame).await?;

    let mut ack = [0u8; 9];
    stream.read_exact(&mut ack).await?;
    if ack != ack_frame(flag) {
        return Err(HandshakeError::Malformed("unexpected acknowledgement"));
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    const COOKIE: &str = "aB3dE5g";

    #[tokio::test]
    async fn test_handshake_whole_cookie() {
        let (client, server) = duplex(64);
        let server = tokio::spawn(async move { handshake(server, COOKIE).await.map(|_| ()) });

        connect_handshake(client, COOKIE, 0x0102_0304, COOKIE.len())
            .await
            .unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_split_cookie() {
        for split in [0, 3, 4] {
            let (client, server) = duplex(64);
            let server = tokio::spawn(async move { handshake(server, COOKIE).await.map(|_| ()) });

            connect_handshake(client, COOKIE, 7, split).await.unwrap();
            server.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_wrong_cookie_rejected() {
        let (client, server) = duplex(64);
        let server = tokio::spawn(async move { handshake(server, COOKIE).await.map(|_| ()) });

        let result = connect_handshake(client, "zzzzzzz", 1, 7).await;
        assert!(matches!(
            server.await.unwrap(),
            Err(HandshakeError::SecretMismatch)
        ));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cookie_length_must_match() {
        let (client, server) = duplex(64);
        let server = tokio::spawn(async move { handshake(server, COOKIE).await.map(|_| ()) });

        let _ = connect_handshake(client, "short", 1, 5).await;
        assert!(matches!(
            server.await.unwrap(),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_opcode() {
        let (mut client, server) = duplex(64);
        client.write_all(&[0, 0, 0, 1, 11]).await.unwrap();
        assert!(matches!(
            handshake(server, COOKIE).await,
            Err(HandshakeError::UnexpectedOpcode(11))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_payload() {
        let (mut client, server) = duplex(64);
        // Only the length goes out; the check must not wait for a payload.
        client.write_all(&(MAX_FRAME as u32 - 3).to_be_bytes()).await.unwrap();
        assert!(matches!(
            handshake(server, COOKIE).await,
            Err(HandshakeError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_ack_frame() {
        assert_eq!(ack_frame(0xdead_beef), [0, 0, 0, 5, 99, 0xde, 0xad, 0xbe, 0xef]);
    }
}
