//! Parent liveness watch for worker processes.
//!
//! A worker must not outlive its coordinator: an orphan serving on the shared
//! port has nobody to stop it. On Linux the worker waits on a pidfd for the
//! parent; elsewhere it polls `getppid()` until it is re-parented to init.

use std::time::Duration;

use nix::unistd::getppid;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Exit code of a worker that lost its coordinator.
pub const ORPHAN_EXIT_CODE: i32 = 1;

/// How often the poll strategy checks the parent pid.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pid that adopts orphaned processes.
const REAPER_PID: i32 = 1;

/// Strategy used to notice coordinator death.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentWatch {
    /// Block on a handle to the parent process until it exits.
    Wait,
    /// Check the parent pid every [`POLL_INTERVAL`].
    Poll,
}

impl ParentWatch {
    /// The strategy supported by the build target.
    pub fn for_platform() -> Self {
        if cfg!(target_os = "linux") {
            Self::Wait
        } else {
            Self::Poll
        }
    }
}

/// Run forever, exiting the process once the coordinator is gone.
///
/// Meant to be spawned as a detached task inside the worker.
pub async fn watch_parent() {
    let strategy = ParentWatch::for_platform();
    debug!(?strategy, ppid = getppid().as_raw(), "Watching coordinator");

    wait_until_orphaned(strategy).await;

    warn!("Coordinator is gone, worker exiting");
    std::process::exit(ORPHAN_EXIT_CODE);
}

/// Resolve once the coordinator is detected dead.
pub async fn wait_until_orphaned(strategy: ParentWatch) {
    if strategy == ParentWatch::Wait {
        #[cfg(target_os = "linux")]
        {
            match wait_for_parent_exit().await {
                Ok(()) => return,
                Err(e) => debug!(error = %e, "pidfd unavailable, falling back to polling"),
            }
        }
    }

    poll_until_orphaned(|| getppid().as_raw(), POLL_INTERVAL).await;
}

async fn poll_until_orphaned<F>(mut parent_pid: F, interval: Duration)
where
    F: FnMut() -> i32,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if parent_pid() == REAPER_PID {
            return;
        }
    }
}

#[cfg(target_os = "linux")]
async fn wait_for_parent_exit() -> std::io::Result<()> {
    use tokio::io::Interest;
    use tokio::io::unix::AsyncFd;

    let ppid = getppid();
    if ppid.as_raw() == REAPER_PID {
        return Ok(());
    }

    let fd = pidfd_open(ppid.as_raw())?;
    // The parent may have died between getppid() and pidfd_open().
    if getppid() != ppid {
        return Ok(());
    }

    let fd = AsyncFd::with_interest(fd, Interest::READABLE)?;
    let _ready = fd.readable().await?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn pidfd_open(pid: libc::pid_t) -> std::io::Result<std::os::fd::OwnedFd> {
    use std::os::fd::{FromRawFd, RawFd};

    // Safety: pidfd_open takes no pointers and returns a new fd or -1.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // Safety: the kernel just handed us ownership of this descriptor.
    Ok(unsafe { std::os::fd::OwnedFd::from_raw_fd(fd as RawFd) })
}
