//! OS-level process helpers: signalling worker process groups and probing
//! liveness.
//!
//! Workers are launched as leaders of their own process group, so signals
//! are delivered to the group and reach any children the worker started.

use crate::errors::ExecutorError;

/// Signals the executor sends to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM: ask the worker to shut down.
    Terminate,
    /// SIGKILL: cannot be caught or ignored.
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> i32 {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
        }
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// Falls back to the single process if the group is gone. A process that no
/// longer exists is not an error: there is nothing left to stop.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: Signal) -> Result<(), ExecutorError> {
    let raw = signal.as_raw();
    let pgid = -(pid as i32);
    if unsafe { libc::kill(pgid, raw) } == 0 {
        return Ok(());
    }
    let group_err = std::io::Error::last_os_error();
    if group_err.raw_os_error() != Some(libc::ESRCH) {
        return Err(ExecutorError::Signal {
            pid,
            source: group_err,
        });
    }

    if unsafe { libc::kill(pid as i32, raw) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(ExecutorError::Signal { pid, source: err })
    }
}

#[cfg(not(unix))]
pub fn signal_group(pid: u32, _signal: Signal) -> Result<(), ExecutorError> {
    Err(ExecutorError::Signal {
        pid,
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process signals are only supported on unix",
        ),
    })
}

/// Whether `pid` refers to a live (non-zombie) process.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let exists = if unsafe { libc::kill(pid as i32, 0) } == 0 {
        true
    } else {
        // EPERM: the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    };
    exists && !is_zombie(pid)
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

/// Exited but not yet reaped by its parent.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name may contain spaces and parens; the state follows the
    // last ')'.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}
