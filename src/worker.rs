//! Background worker processes.
//!
//! Streaming and long-running commands run as independent OS processes
//! with no shared address space; progress travels exclusively through the
//! catalog. A worker is launched by re-executing this binary with the
//! wrapped command as arguments, detached from the controlling terminal
//! unless an interactive launch was requested.

use std::process::{Command, Stdio};

use chrono::Utc;
use tracing::info;

use crate::catalog::descr::{WorkerDescr, WorkerKind, WorkerState};
use crate::catalog::BackupCatalog;
use crate::error::Result;

/// How a background process is to be spawned.
#[derive(Debug, Clone)]
pub struct JobInfo {
    /// Detach from the terminal and the parent's process group.
    pub detach: bool,
    pub args: Vec<String>,
}

/// Spawn this binary again with the given arguments and return the child
/// pid. Detached jobs get their standard descriptors closed and their own
/// process group; interactive ones keep the terminal.
pub fn launch(job: &JobInfo) -> Result<u32> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command.args(&job.args);
    if job.detach {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
    }
    let child = command.spawn()?;
    let pid = child.id();
    info!("launched background worker at pid {pid}");
    Ok(pid)
}

/// Record this process in the catalog's worker registry.
pub fn register_self(
    catalog: &BackupCatalog,
    kind: WorkerKind,
    archive_id: i64,
) -> Result<WorkerDescr> {
    let worker = WorkerDescr {
        pid: std::process::id() as i64,
        archive_id,
        kind,
        state: WorkerState::Running,
        started: Some(Utc::now()),
        shm_key: 0,
        shm_id: 0,
    };
    catalog.within_transaction(|catalog| catalog.register_worker(&worker))?;
    Ok(worker)
}

/// Flip this process's registry row to `shutdown`.
pub fn mark_self_shutdown(catalog: &BackupCatalog) -> Result<()> {
    let pid = std::process::id() as i64;
    catalog.within_transaction(|catalog| catalog.update_worker_state(pid, WorkerState::Shutdown))
}

/// Ask a worker process to terminate. Catalog state is updated by the
/// worker itself on its way out; this only delivers the signal.
pub fn signal_shutdown(pid: i64) -> Result<bool> {
    let status = Command::new("kill").arg(pid.to_string()).status()?;
    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_registry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = BackupCatalog::new(dir.path().join("catalog.db"));
        catalog.open_rw().unwrap();

        let worker = register_self(&catalog, WorkerKind::Streamer, 1).unwrap();
        assert_eq!(worker.pid, std::process::id() as i64);

        let workers = catalog.get_workers().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].state, WorkerState::Running);

        mark_self_shutdown(&catalog).unwrap();
        let workers = catalog.get_workers().unwrap();
        assert_eq!(workers[0].state, WorkerState::Shutdown);
    }
}
