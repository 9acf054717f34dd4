//! Stream adapter applied to Xshell connections after the handshake
//!
//! Reads are re-framed one message at a time so a sign request with a
//! missing flags field can be patched before the agent parses it. Writes
//! either pass straight through or, in reassembly mode, are held back
//! until a whole message is available and then sent as a single write,
//! since older Xshell builds treat every TCP read as one message.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use wcsa_core::XshellWriteMode;
use wcsa_protocol::message::msg;
use wcsa_protocol::SignRequest;

use super::MAX_FRAME;

/// Extend a malformed sign request with an empty flags field
///
/// `frame` holds the length prefix followed by the body. Returns whether
/// the frame was changed.
pub fn patch_sign_request(frame: &mut Vec<u8>) -> bool {
    if frame.get(4) != Some(&msg::SIGN_REQUEST) || SignRequest::parse(&frame[5..]).is_ok() {
        return false;
    }
    frame.extend_from_slice(&[0, 0, 0, 0]);
    let len = (frame.len() - 4) as u32;
    frame[..4].copy_from_slice(&len.to_be_bytes());
    true
}

enum ReadState {
    Header { buf: [u8; 4], filled: usize },
    Body { frame: Vec<u8>, filled: usize },
    Ready { frame: Vec<u8>, pos: usize },
}

impl ReadState {
    fn header() -> Self {
        ReadState::Header {
            buf: [0; 4],
            filled: 0,
        }
    }
}

/// Reassembly buffer for one outgoing message
#[derive(Default)]
struct WriteState {
    pending: Vec<u8>,
    expected: Option<usize>,
    out: Vec<u8>,
    out_pos: usize,
}

pub struct XshellProxy<S> {
    inner: S,
    mode: XshellWriteMode,
    read: ReadState,
    write: WriteState,
}

impl<S> XshellProxy<S> {
    pub fn new(inner: S, mode: XshellWriteMode) -> Self {
        Self {
            inner,
            mode,
            read: ReadState::header(),
            write: WriteState::default(),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn unexpected_eof() -> io::Error {
    io::Error::from(io::ErrorKind::UnexpectedEof)
}

impl<S: AsyncRead + Unpin> AsyncRead for XshellProxy<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.read {
                ReadState::Ready { frame, pos } => {
                    let n = (frame.len() - *pos).min(out.remaining());
                    out.put_slice(&frame[*pos..*pos + n]);
                    *pos += n;
                    if *pos == frame.len() {
                        this.read = ReadState::header();
                    }
                    return Poll::Ready(Ok(()));
                }
                ReadState::Header { buf, filled } => {
                    let mut rb = ReadBuf::new(&mut buf[*filled..]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        // Clean end of stream between messages
                        if *filled == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(unexpected_eof()));
                    }
                    *filled += n;
                    if *filled < 4 {
                        continue;
                    }

                    let len = u32::from_be_bytes(*buf) as usize;
                    if len == 0 {
                        return Poll::Ready(Err(unexpected_eof()));
                    }
                    if len + 4 > MAX_FRAME {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("xshell request too large: {}", len),
                        )));
                    }
                    let mut frame = Vec::with_capacity(len + 8);
                    frame.extend_from_slice(&buf[..]);
                    frame.resize(len + 4, 0);
                    this.read = ReadState::Body { frame, filled: 4 };
                }
                ReadState::Body { frame, filled } => {
                    let mut rb = ReadBuf::new(&mut frame[*filled..]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(unexpected_eof()));
                    }
                    *filled += n;
                    if *filled < frame.len() {
                        continue;
                    }

                    let mut frame = std::mem::take(frame);
                    if patch_sign_request(&mut frame) {
                        tracing::debug!("Patched truncated Xshell sign request");
                    }
                    this.read = ReadState::Ready { frame, pos: 0 };
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> XshellProxy<S> {
    /// Push out a completed message, if any
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let write = &mut self.write;
        while write.out_pos < write.out.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &write.out[write.out_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero)));
            }
            write.out_pos += n;
        }
        write.out.clear();
        write.out_pos = 0;
        Poll::Ready(Ok(()))
    }

    fn accept(&mut self, buf: &[u8]) -> io::Result<()> {
        let write = &mut self.write;
        write.pending.extend_from_slice(buf);

        if write.expected.is_none() && write.pending.len() >= 4 {
            let declared = u32::from_be_bytes([
                write.pending[0],
                write.pending[1],
                write.pending[2],
                write.pending[3],
            ]) as usize;
            write.expected = Some(declared + 4);
        }

        match write.expected {
            Some(expected) if write.pending.len() > expected => {
                write.pending.clear();
                write.expected = None;
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "xshell write exceeds declared message length",
                ))
            }
            Some(expected) if write.pending.len() == expected => {
                write.out = std::mem::take(&mut write.pending);
                write.expected = None;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for XshellProxy<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.mode {
            XshellWriteMode::Passthrough => Pin::new(&mut this.inner).poll_write(cx, buf),
            XshellWriteMode::Reassemble => {
                ready!(this.poll_drain(cx))?;
                this.accept(buf)?;
                // The message is out of our hands once accepted; a pending
                // inner write finishes on the next write or flush.
                if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
                    return Poll::Ready(Err(e));
                }
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if !this.write.pending.is_empty() {
            tracing::warn!(
                buffered = this.write.pending.len(),
                expected = ?this.write.expected,
                "Dropping incomplete Xshell response at close"
            );
            this.write.pending.clear();
            this.write.expected = None;
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
