//! `AF_VSOCK` sockets for Linux hosts and WSL2 guests

use std::io;

use async_trait::async_trait;
use tokio_vsock::{VsockAddr, VsockListener, VsockStream, VMADDR_CID_ANY, VMADDR_CID_HOST};

use crate::lifecycle::Acceptor;

/// Listen for any VM dialing `port`
pub fn bind_wildcard(port: u32) -> io::Result<VsockListener> {
    VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, port))
}

/// Connect from a guest to the host's agent
pub async fn dial_host(port: u32) -> io::Result<VsockStream> {
    VsockStream::connect(VsockAddr::new(VMADDR_CID_HOST, port)).await
}

#[async_trait]
impl Acceptor for VsockListener {
    type Stream = VsockStream;

    async fn accept(&mut self) -> io::Result<(Self::Stream, String)> {
        let (stream, peer) = VsockListener::accept(self).await?;
        Ok((stream, format!("vsock:{}", peer.cid())))
    }
}
