//! Hyper-V sockets for WSL2 and other VMs
//!
//! The host listens on a fixed service id for any partition. WSL2 VMs only
//! reach services registered for their own VM id, so the host also keeps
//! one listener per running WSL2 VM, started and stopped by a reconciler
//! that watches the WSL launcher processes.
//!
//! A process that finds a host agent at startup is a guest: it forwards to
//! that agent and does not listen here.

pub mod discovery;
pub mod reconcile;

#[cfg(windows)]
mod hvsocket;
#[cfg(target_os = "linux")]
mod vsock;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wcsa_agent::{BoxedStream, Dialer};
use wcsa_core::config::HyperVConfig;
use wcsa_core::TransportKind;

use crate::error::TransportError;
use crate::lifecycle::{LifecycleContext, Listener, MenuEntry};
use reconcile::WorkerPool;

/// Registry key where guest communication services are registered
pub const REGISTRY_PATH: &str =
    r"SOFTWARE\Microsoft\Windows NT\CurrentVersion\Virtualization\GuestCommunicationServices";

/// Friendly name of the registered service
pub const ELEMENT_NAME: &str = "WinCryptSSHAgent";

/// Partition id a guest uses to address its host
pub const PARENT_VM_ID: Uuid = Uuid::from_u128(0xa42e7cda_d03f_480c_9cc2_a4de20abb878);

/// Hyper-V service id for a vsock port
///
/// The port fills the first field of the `facb-11e6-bd58-64006a7986d3`
/// template shared by all vsock-compatible services.
pub fn service_guid(port: u32) -> Uuid {
    Uuid::from_fields(port, 0xfacb, 0x11e6, &[0xbd, 0x58, 0x64, 0x00, 0x6a, 0x79, 0x86, 0xd3])
}

/// Setup shown to WSL2 users
pub fn help_text() -> String {
    "socat UNIX-LISTEN:/tmp/wincrypt-hv.sock,fork,mode=777 \
     SOCKET-CONNECT:40:0:x0000x33332222x02000000x00000000,forever,interval=5 &\n\
     export SSH_AUTH_SOCK=/tmp/wincrypt-hv.sock\n"
        .to_string()
}

/// Connect to the agent of the Hyper-V host
pub async fn dial_host(port: u32) -> io::Result<BoxedStream> {
    #[cfg(target_os = "linux")]
    return Ok(Box::new(vsock::dial_host(port).await?));

    #[cfg(windows)]
    return Ok(Box::new(
        hvsocket::dial(wcsa_core::VmId(PARENT_VM_ID), service_guid(port)).await?,
    ));

    #[cfg(not(any(windows, target_os = "linux")))]
    {
        let _ = port;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Hyper-V sockets are not available on this platform",
        ))
    }
}

/// Re-dials the host agent for a guest's proxy backend
pub struct HostDialer {
    port: u32,
    timeout: Duration,
}

impl HostDialer {
    pub fn new(port: u32, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl Dialer for HostDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        match tokio::time::timeout(self.timeout, dial_host(self.port)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }
}

/// Keep `pool` in step with the running VMs until cancelled
///
/// Scans every `poll_interval`, and sooner when the launcher watch
/// reports a change.
pub async fn run_reconciler(
    cancel: CancellationToken,
    mut pool: WorkerPool,
    poll_interval: Duration,
    accelerator: bool,
) {
    let wake = Arc::new(Notify::new());
    let watch = accelerator.then(|| {
        tokio::spawn(discovery::watch_launchers(cancel.clone(), wake.clone()))
    });

    let mut scanner = discovery::VmDiscovery::new();
    loop {
        let (returned, vms) = discovery::scan(scanner).await;
        scanner = returned;
        pool.reconcile(&vms).await;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
            _ = wake.notified() => {
                tracing::debug!("WSL launchers changed, rescanning VMs");
            }
        }
    }

    pool.shutdown().await;
    if let Some(watch) = watch {
        let _ = watch.await;
    }
}

/// Wildcard Hyper-V listener plus the per-VM workers
pub struct HyperVListener {
    config: HyperVConfig,
}

impl HyperVListener {
    pub fn new(config: HyperVConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Listener for HyperVListener {
    fn kind(&self) -> TransportKind {
        TransportKind::HyperV
    }

    fn menu(&self) -> Vec<MenuEntry> {
        vec![MenuEntry {
            kind: self.kind(),
            label: "Show WSL2 Settings".to_string(),
        }]
    }

    #[cfg(windows)]
    async fn run(&self, ctx: LifecycleContext) -> Result<(), TransportError> {
        use crate::lifecycle::{accept_loop, no_handshake, Connections};

        let service = service_guid(self.config.service_port);
        let mut listener = hvsocket::HvListener::bind(wcsa_core::VmId::WILDCARD, service)
            .map_err(|e| TransportError::bind(format!("hvsocket {}", service), e))?;

        tracing::info!(%service, "Hyper-V listener ready");
        let status = ctx.status.publish(self.kind(), help_text());

        let pool = WorkerPool::new(Arc::new(workers::HvWorkers::new(ctx.clone(), service)));
        let reconciler = tokio::spawn(run_reconciler(
            ctx.cancel.clone(),
            pool,
            self.config.poll_interval,
            self.config.accelerator,
        ));

        let connections = Connections::new(self.kind(), &ctx);
        let result = accept_loop(&ctx, &mut listener, &connections, no_handshake).await;

        listener.close().await;
        if let Err(e) = reconciler.await {
            tracing::warn!(error = %e, "Hyper-V reconciler failed");
        }
        connections.drain(ctx.drain_timeout).await;
        drop(status);
        result
    }

    #[cfg(target_os = "linux")]
    async fn run(&self, ctx: LifecycleContext) -> Result<(), TransportError> {
        use crate::lifecycle::{accept_loop, no_handshake, Connections};

        let port = self.config.service_port;
        let mut listener = vsock::bind_wildcard(port)
            .map_err(|e| TransportError::bind(format!("vsock port {:#x}", port), e))?;

        tracing::info!(port, "vsock listener ready");
        let status = ctx.status.publish(self.kind(), help_text());

        let connections = Connections::new(self.kind(), &ctx);
        let result = accept_loop(&ctx, &mut listener, &connections, no_handshake).await;

        drop(listener);
        connections.drain(ctx.drain_timeout).await;
        drop(status);
        result
    }

    #[cfg(not(any(windows, target_os = "linux")))]
    async fn run(&self, _ctx: LifecycleContext) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(self.kind()))
    }
}

#[cfg(windows)]
mod workers {
    use std::io;

    use uuid::Uuid;
    use wcsa_core::{TransportKind, VmId};

    use super::hvsocket::HvListener;
    use super::reconcile::{Worker, WorkerFactory};
    use crate::lifecycle::{accept_loop, no_handshake, Connections, LifecycleContext};

    /// Starts one Hyper-V listener per VM
    pub struct HvWorkers {
        ctx: LifecycleContext,
        service: Uuid,
    }

    impl HvWorkers {
        pub fn new(ctx: LifecycleContext, service: Uuid) -> Self {
            Self { ctx, service }
        }
    }

    impl WorkerFactory for HvWorkers {
        fn start(&self, vm: VmId) -> io::Result<Worker> {
            let mut listener = HvListener::bind(vm, self.service)?;
            let cancel = self.ctx.cancel.child_token();
            let mut ctx = self.ctx.clone();
            ctx.cancel = cancel.clone();

            let task = tokio::spawn(async move {
                let connections = Connections::new(TransportKind::HyperV, &ctx);
                if let Err(e) = accept_loop(&ctx, &mut listener, &connections, no_handshake).await {
                    tracing::debug!(%vm, error = %e, "Hyper-V worker accept failed");
                }
                listener.close().await;
                connections.drain(ctx.drain_timeout).await;
            });
            Ok(Worker::new(cancel, task))
        }
    }
}
