//! Coordinator side of a prefork group.
//!
//! Spawns N copies of the running executable tagged with the worker marker,
//! waits for the first one to exit and then tears the whole group down.
//! The group is deliberately not self-healing: one worker exiting, cleanly or
//! not, ends the coordinator's run.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::role::{WORKER_ENV_KEY, WORKER_ENV_VALUE};
use super::signals::TerminationReason;
use crate::error::{PreforkError, Result};

/// Number of workers when no override is given: one per available CPU.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// What to spawn and how many times.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Number of worker processes.
    pub workers: usize,
    /// Executable started for every worker.
    pub program: PathBuf,
    /// Arguments passed to every worker.
    pub args: Vec<OsString>,
}

impl LaunchConfig {
    /// Re-run the current executable with the current arguments.
    pub fn current(workers: usize) -> Result<Self> {
        let program = std::env::current_exe().map_err(PreforkError::Spawn)?;
        Ok(Self {
            workers,
            program,
            args: std::env::args_os().skip(1).collect(),
        })
    }

    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>, workers: usize) -> Self {
        Self {
            workers,
            program: program.into(),
            args,
        }
    }
}

/// How a worker ended: `Ok` for a clean exit.
pub type ExitOutcome = Result<()>;

/// Posted by a worker's wait task when it terminates.
#[derive(Debug)]
pub struct ExitNotification {
    pub pid: u32,
    pub outcome: ExitOutcome,
}

/// Coordinator-side handle to one spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: u32,
    /// Set by the wait task once the OS has reaped the process.
    reaped: Arc<AtomicBool>,
}

impl WorkerHandle {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            reaped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send SIGKILL. A process that already finished is not an error.
    pub fn kill(&self) -> nix::Result<()> {
        if self.reaped.load(Ordering::SeqCst) {
            return Ok(());
        }
        match signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Err(Errno::ESRCH) => Ok(()),
            other => other,
        }
    }
}

/// Every worker spawned by this coordinator, keyed by pid.
///
/// Entries are never removed. Dropping the set kills whatever is left.
#[derive(Debug, Default)]
pub struct WorkerSet {
    workers: HashMap<u32, WorkerHandle>,
}

impl WorkerSet {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            workers: HashMap::with_capacity(capacity),
        }
    }

    fn insert(&mut self, handle: WorkerHandle) {
        self.workers.insert(handle.pid, handle);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.workers.keys().copied()
    }

    /// Best-effort kill of every tracked worker.
    pub fn terminate_all(&self) {
        for handle in self.workers.values() {
            if let Err(e) = handle.kill() {
                warn!(pid = handle.pid, error = %e, "Failed to kill worker");
            }
        }
    }
}

impl Drop for WorkerSet {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            debug!(workers = self.workers.len(), "Tearing down worker group");
            self.terminate_all();
        }
    }
}

/// Spawn the worker group and block until the first worker exits.
///
/// Returns that worker's outcome. Every other worker is killed on return.
/// A SIGINT/SIGTERM delivered to the coordinator also ends the run with `Ok`.
pub async fn launch(config: &LaunchConfig) -> Result<()> {
    if config.workers == 0 {
        return Err(PreforkError::Config(
            "worker count must be at least 1".to_string(),
        ));
    }

    // One slot per worker, so no wait task ever blocks on send.
    let (exits, mut first_exit) = mpsc::channel(config.workers);
    let mut workers = WorkerSet::with_capacity(config.workers);

    for index in 0..config.workers {
        let (handle, child) = spawn_worker(config)?;
        info!(pid = handle.pid, index, "Spawned worker");

        tokio::spawn(wait_worker(
            handle.pid,
            child,
            handle.reaped.clone(),
            exits.clone(),
        ));
        workers.insert(handle);
    }
    drop(exits);

    let notification = tokio::select! {
        notification = first_exit.recv() => notification,
        _ = super::shutdown_signal() => {
            info!("Shutdown signal received, stopping workers");
            return Ok(());
        }
    };

    match notification {
        Some(ExitNotification { pid, outcome }) => {
            match &outcome {
                Ok(()) => info!(pid, "Worker exited cleanly, stopping group"),
                Err(e) => warn!(pid, error = %e, "Worker failed, stopping group"),
            }
            outcome
        }
        None => Ok(()),
    }
}

fn spawn_worker(config: &LaunchConfig) -> Result<(WorkerHandle, Child)> {
    let child = Command::new(&config.program)
        .args(&config.args)
        .env(WORKER_ENV_KEY, WORKER_ENV_VALUE)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(PreforkError::Spawn)?;

    let pid = child.id().ok_or_else(|| {
        PreforkError::Spawn(std::io::Error::other(
            "worker exited before its pid was read",
        ))
    })?;

    Ok((WorkerHandle::new(pid), child))
}

async fn wait_worker(
    pid: u32,
    mut child: Child,
    reaped: Arc<AtomicBool>,
    exits: mpsc::Sender<ExitNotification>,
) {
    let outcome = match child.wait().await {
        Ok(status) => {
            reaped.store(true, Ordering::SeqCst);
            let reason = TerminationReason::from_status(status);
            debug!(pid, %reason, "Worker exited");
            if reason.is_success() {
                Ok(())
            } else {
                Err(PreforkError::WorkerExited { pid, reason })
            }
        }
        Err(source) => Err(PreforkError::Wait { pid, source }),
    };

    // The receiver is gone once the coordinator has returned.
    let _ = exits.send(ExitNotification { pid, outcome }).await;
}
