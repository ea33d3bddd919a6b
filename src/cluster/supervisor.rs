//! Worker process supervision.
//!
//! # Responsibilities
//! - Spawn the configured number of worker processes
//! - Respawn a worker that exits, with exponential backoff
//! - On shutdown, ask workers to stop (SIGTERM) and kill stragglers
//!
//! Each worker slot runs as its own task; registration with the master
//! happens over the cluster socket, not here.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;

use crate::cluster::backoff::RespawnBackoff;
use crate::config::ClusterConfig;
use crate::lifecycle::Shutdown;

/// How long a worker gets to exit after SIGTERM.
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Supervisor {
    program: PathBuf,
    args: Vec<OsString>,
    workers: usize,
    respawn: bool,
    backoff: RespawnBackoff,
}

impl Supervisor {
    /// `program args…` is the command line of one worker.
    pub fn new(config: &ClusterConfig, program: PathBuf, args: Vec<OsString>) -> Self {
        Self {
            program,
            args,
            workers: config.workers,
            respawn: config.respawn,
            backoff: RespawnBackoff::from_config(config),
        }
    }

    /// Run every worker slot until shutdown.
    pub async fn run(self, shutdown: Shutdown) {
        tracing::info!(workers = self.workers, program = %self.program.display(), "Starting workers");
        let slots: Vec<_> = (0..self.workers)
            .map(|slot| {
                let supervisor = self.clone();
                let shutdown = shutdown.subscribe();
                tokio::spawn(async move { supervisor.run_slot(slot, shutdown).await })
            })
            .collect();

        for slot in slots {
            let _ = slot.await;
        }
        tracing::info!("All workers stopped");
    }

    async fn run_slot(&self, slot: usize, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = self.backoff.clone();
        loop {
            let started = Instant::now();
            let mut child = match self.spawn() {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(slot, error = %e, "Failed to spawn worker");
                    if !self.respawn || wait_or_shutdown(slot, &mut backoff, &mut shutdown).await {
                        return;
                    }
                    continue;
                }
            };
            let pid = child.id();
            tracing::info!(slot, pid, "Worker spawned");

            tokio::select! {
                status = child.wait() => {
                    log_exit(slot, pid, status);
                }
                _ = shutdown.recv() => {
                    stop(&mut child, slot).await;
                    return;
                }
            }

            if !self.respawn {
                return;
            }
            backoff.observe_uptime(started.elapsed());
            if wait_or_shutdown(slot, &mut backoff, &mut shutdown).await {
                return;
            }
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .spawn()
    }
}

/// Sleep for the next backoff step. Returns `true` if shutdown arrived.
async fn wait_or_shutdown(slot: usize, backoff: &mut RespawnBackoff, shutdown: &mut broadcast::Receiver<()>) -> bool {
    let delay = backoff.next_delay();
    tracing::debug!(
        slot,
        failures = backoff.failures(),
        delay_ms = delay.as_millis() as u64,
        "Respawning worker after delay"
    );
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.recv() => true,
    }
}

fn log_exit(slot: usize, pid: Option<u32>, status: std::io::Result<ExitStatus>) {
    match status {
        Ok(status) if status.success() => tracing::info!(slot, pid, "Worker exited"),
        Ok(status) => tracing::warn!(slot, pid, %status, "Worker exited abnormally"),
        Err(e) => tracing::warn!(slot, pid, error = %e, "Failed to wait on worker"),
    }
}

async fn stop(child: &mut Child, slot: usize) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(slot, pid, error = %e, "Failed to signal worker");
        }
    }
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(status) => log_exit(slot, child.id(), status),
        Err(_) => {
            tracing::warn!(slot, "Worker ignored SIGTERM; killing");
            let _ = child.kill().await;
        }
    }
}
