//! Per-VM worker pool kept in step with the running WSL2 VMs

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wcsa_core::VmId;

/// Identities to start and to stop to get from `current` to `observed`
pub fn diff(current: &BTreeSet<VmId>, observed: &BTreeSet<VmId>) -> (Vec<VmId>, Vec<VmId>) {
    let added = observed.difference(current).copied().collect();
    let removed = current.difference(observed).copied().collect();
    (added, removed)
}

/// A running per-VM listener
pub struct Worker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Worker {
    /// Wrap a listener task that exits once `cancel` fires
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Stop accepting and wait until the listening handle is released
    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "Hyper-V worker task failed");
        }
    }
}

/// Starts a listener bound to one VM
pub trait WorkerFactory: Send + Sync {
    fn start(&self, vm: VmId) -> io::Result<Worker>;
}

/// Live workers keyed by VM, owned by the reconciler task
pub struct WorkerPool {
    factory: Arc<dyn WorkerFactory>,
    workers: HashMap<VmId, Worker>,
}

impl WorkerPool {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            factory,
            workers: HashMap::new(),
        }
    }

    /// VMs with a live worker
    pub fn vms(&self) -> BTreeSet<VmId> {
        self.workers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Start workers for new VMs and stop those whose VM is gone
    ///
    /// A VM whose worker fails to start is left out of the pool and tried
    /// again on the next call.
    pub async fn reconcile(&mut self, observed: &BTreeSet<VmId>) {
        let (added, removed) = diff(&self.vms(), observed);

        for vm in removed {
            if let Some(worker) = self.workers.get_mut(&vm) {
                worker.stop().await;
            }
            self.workers.remove(&vm);
            tracing::info!(%vm, "Hyper-V worker stopped");
        }

        for vm in added {
            match self.factory.start(vm) {
                Ok(worker) => {
                    tracing::info!(%vm, "Hyper-V worker started");
                    self.workers.insert(vm, worker);
                }
                Err(e) => {
                    tracing::debug!(%vm, error = %e, "Failed to start Hyper-V worker");
                }
            }
        }
    }

    /// Stop every worker
    pub async fn shutdown(&mut self) {
        for worker in self.workers.values_mut() {
            worker.stop().await;
        }
        self.workers.clear();
    }
}
