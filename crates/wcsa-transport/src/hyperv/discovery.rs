//! Finding running WSL2 VMs
//!
//! Every WSL2 distribution session has a `wslhost.exe` process whose
//! command line carries the VM id in braces.

use std::collections::{BTreeSet, HashSet};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use wcsa_core::VmId;

pub const LAUNCHER_PROCESS: &str = "wslhost.exe";

/// How often the accelerator looks for launcher changes
pub const ACCELERATOR_INTERVAL: Duration = Duration::from_secs(1);

/// VM id from a launcher command line: the last argument with a `{`
pub fn vm_id_from_command_line<S: AsRef<OsStr>>(args: &[S]) -> Option<VmId> {
    args.iter()
        .rev()
        .filter_map(|arg| arg.as_ref().to_str())
        .find(|arg| arg.contains('{'))
        .and_then(VmId::parse)
}

/// Process table scanner
pub struct VmDiscovery {
    system: System,
}

impl Default for VmDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl VmDiscovery {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    fn refresh(&mut self, with_cmd: bool) {
        let kind = if with_cmd {
            ProcessRefreshKind::new().with_cmd(UpdateKind::Always)
        } else {
            ProcessRefreshKind::new()
        };
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::All, true, kind);
    }

    fn launchers(&self) -> impl Iterator<Item = (&Pid, &sysinfo::Process)> + '_ {
        self.system
            .processes()
            .iter()
            .filter(|(_, process)| process.name().eq_ignore_ascii_case(LAUNCHER_PROCESS))
    }

    /// Ids of the VMs that currently have a launcher
    pub fn scan(&mut self) -> BTreeSet<VmId> {
        self.refresh(true);
        self.launchers()
            .filter_map(|(_, process)| vm_id_from_command_line(process.cmd()))
            .collect()
    }

    /// Pids of the current launcher processes
    pub fn launcher_pids(&mut self) -> HashSet<Pid> {
        self.refresh(false);
        self.launchers().map(|(pid, _)| *pid).collect()
    }
}

/// Run a scan on the blocking pool
pub async fn scan(mut discovery: VmDiscovery) -> (VmDiscovery, BTreeSet<VmId>) {
    let result = tokio::task::spawn_blocking(move || {
        let vms = discovery.scan();
        (discovery, vms)
    })
    .await;
    match result {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(error = %e, "VM scan task failed");
            (VmDiscovery::new(), BTreeSet::new())
        }
    }
}

/// Wake `wake` whenever the set of launcher processes changes
///
/// Returns at once when the platform cannot list processes; the caller
/// keeps its regular poll.
pub async fn watch_launchers(cancel: CancellationToken, wake: Arc<Notify>) {
    if !sysinfo::IS_SUPPORTED_SYSTEM {
        tracing::debug!("Process listing unsupported, VM discovery stays on the slow poll");
        return;
    }

    let mut discovery = VmDiscovery::new();
    let mut known: Option<HashSet<Pid>> = None;
    loop {
        let scanned = tokio::task::spawn_blocking(move || {
            let pids = discovery.launcher_pids();
            (discovery, pids)
        })
        .await;
        let pids = match scanned {
            Ok((returned, pids)) => {
                discovery = returned;
                pids
            }
            Err(e) => {
                tracing::warn!(error = %e, "Launcher watch task failed");
                return;
            }
        };

        if known.as_ref().is_some_and(|known| *known != pids) {
            wake.notify_one();
        }
        known = Some(pids);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(ACCELERATOR_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_id_from_command_line() {
        let args = [
            r"C:\Windows\System32\lxss\wslhost.exe",
            "{0e0a7a4c-a3a2-4b6c-9d0f-1b2c3d4e5f60}",
            "--distro-id",
            "{7c6a1f3e-1111-2222-3333-444455556666}",
            "-v",
        ];
        assert_eq!(
            vm_id_from_command_line(&args).unwrap().to_string(),
            "7c6a1f3e-1111-2222-3333-444455556666"
        );
    }

    #[test]
    fn test_command_line_without_vm_id() {
        assert!(vm_id_from_command_line(&["wslhost.exe", "--help"]).is_none());
        assert!(vm_id_from_command_line(&["wslhost.exe", "{not-a-guid}"]).is_none());
        assert!(vm_id_from_command_line::<&str>(&[]).is_none());
    }

    #[tokio::test]
    async fn test_watch_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        watch_launchers(cancel, Arc::new(Notify::new())).await;
    }
}
