//! PuTTY Pageant compatibility
//!
//! A Pageant client finds a window of class `Pageant`, writes its request
//! into a named shared memory section and sends the section name with
//! `WM_COPYDATA`. The window procedure hands the request to the async side
//! and blocks until the agent has answered, then copies the answer back
//! into the same section.
//!
//! Everything below the window itself is plain data handling and runs on
//! every platform.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use wcsa_core::TransportKind;

use crate::error::TransportError;
use crate::lifecycle::{no_handshake, Connections, LifecycleContext, Listener, MenuEntry};

#[cfg(windows)]
mod window;

/// `dwData` of a Pageant `WM_COPYDATA` message
pub const COPYDATA_TAG: usize = 0x804e_50ba;

/// Largest message, length prefix included
pub const MAX_MESSAGE: usize = 8192;

/// Window class and title clients look for
pub const WINDOW_CLASS: &str = "Pageant";

/// Bytes of a mapped view the agent may touch
///
/// Clients may map a section smaller than [`MAX_MESSAGE`].
pub fn mapped_len(region_size: usize) -> usize {
    region_size.min(MAX_MESSAGE)
}

/// Copy the framed request out of a shared memory section
///
/// Returns `None` when the declared length does not fit.
pub fn take_request(region: &[u8]) -> Option<Vec<u8>> {
    let prefix: [u8; 4] = region.get(..4)?.try_into().ok()?;
    let size = u32::from_be_bytes(prefix) as usize + 4;
    if size > MAX_MESSAGE || size > region.len() {
        return None;
    }
    Some(region[..size].to_vec())
}

/// Copy an answer into the section the request came from
pub fn store_response(region: &mut [u8], response: &[u8]) -> bool {
    if response.len() > MAX_MESSAGE || response.len() > region.len() {
        return false;
    }
    region[..response.len()].copy_from_slice(response);
    true
}

/// One request waiting for the agent
pub struct PageantRequest {
    data: Vec<u8>,
    reply: oneshot::Sender<Option<Vec<u8>>>,
}

/// Blocking bridge from the window thread to the async listener
#[derive(Clone)]
pub struct Dispatcher {
    requests: mpsc::Sender<PageantRequest>,
}

impl Dispatcher {
    pub fn new(requests: mpsc::Sender<PageantRequest>) -> Self {
        Self { requests }
    }

    /// Answer the request held in `region`, in place
    ///
    /// Blocks the calling thread until the agent has replied, so it must
    /// not be called from inside the runtime. Returns whether an answer
    /// was written.
    pub fn handle(&self, region: &mut [u8]) -> bool {
        let Some(data) = take_request(region) else {
            tracing::debug!(size = region.len(), "Invalid Pageant message length");
            return false;
        };

        let (reply, answer) = oneshot::channel();
        if self.requests.blocking_send(PageantRequest { data, reply }).is_err() {
            return false;
        }
        match answer.blocking_recv() {
            Ok(Some(response)) => store_response(region, &response),
            _ => false,
        }
    }
}

/// A single request/response exchange presented as a stream
///
/// Reads yield the request and then end of stream. Writes are collected
/// and delivered as the answer on shutdown; a connection closed without
/// writing anything fails the request.
pub struct PageantConnection {
    request: Vec<u8>,
    offset: usize,
    response: Vec<u8>,
    reply: Option<oneshot::Sender<Option<Vec<u8>>>>,
}

impl PageantConnection {
    pub fn new(request: PageantRequest) -> Self {
        Self {
            request: request.data,
            offset: 0,
            response: Vec::new(),
            reply: Some(request.reply),
        }
    }

    fn finish(&mut self) {
        if let Some(reply) = self.reply.take() {
            let response = std::mem::take(&mut self.response);
            let _ = reply.send((!response.is_empty()).then_some(response));
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pageant connection closed")
}

impl AsyncRead for PageantConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.reply.is_none() {
            return Poll::Ready(Err(closed()));
        }
        let remaining = &this.request[this.offset..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for PageantConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.reply.is_none() {
            return Poll::Ready(Err(closed()));
        }
        this.response.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().finish();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PageantConnection {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Turn queued requests into connections until cancelled
pub async fn serve_requests(
    ctx: &LifecycleContext,
    requests: &mut mpsc::Receiver<PageantRequest>,
    connections: &Connections,
) {
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            request = requests.recv() => match request {
                Some(request) => {
                    connections.spawn("pageant", no_handshake(PageantConnection::new(request)));
                }
                None => return,
            },
        }
    }
}

/// Stop taking requests and fail the ones already queued
///
/// A window procedure blocked on a queued request is released, so the
/// window thread can be joined afterwards.
pub fn reject_pending(requests: &mut mpsc::Receiver<PageantRequest>) {
    requests.close();
    let mut rejected = 0usize;
    while let Ok(request) = requests.try_recv() {
        let _ = request.reply.send(None);
        rejected += 1;
    }
    if rejected > 0 {
        tracing::debug!(rejected, "Rejected queued Pageant requests");
    }
}

/// Hidden `Pageant` window serving `WM_COPYDATA` requests
#[derive(Debug, Default)]
pub struct PageantListener;

impl PageantListener {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Listener for PageantListener {
    fn kind(&self) -> TransportKind {
        TransportKind::Pageant
    }

    fn menu(&self) -> Vec<MenuEntry> {
        Vec::new()
    }

    #[cfg(windows)]
    async fn run(&self, ctx: LifecycleContext) -> Result<(), TransportError> {
        let (tx, mut rx) = mpsc::channel(1);
        let window = window::PageantWindow::spawn(Dispatcher::new(tx))
            .await
            .map_err(|e| TransportError::bind(WINDOW_CLASS, e))?;

        tracing::info!("Pageant window ready");
        let status = ctx.status.publish(self.kind(), "");

        let connections = Connections::new(self.kind(), &ctx);
        serve_requests(&ctx, &mut rx, &connections).await;

        reject_pending(&mut rx);
        connections.drain(ctx.drain_timeout).await;
        drop(status);
        window.close().await;
        Ok(())
    }

    #[cfg(not(windows))]
    async fn run(&self, _ctx: LifecycleContext) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(self.kind()))
    }
}
