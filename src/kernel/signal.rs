//! Async-safe shutdown flag for the CLI, plus kill helpers that treat an
//! already-gone target as success.
use crate::config::types::{IsolateError, Result};
use log::{info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Install handlers for SIGINT, SIGTERM, SIGHUP.
    /// Must be called early in main() before any threads are spawned
    pub fn init() -> Result<Self> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // SAFETY: the handler only touches atomics.
            unsafe { signal::sigaction(sig, &sig_action) }.map_err(|e| {
                IsolateError::Process(format!("Failed to install {} handler: {}", sig, e))
            })?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    /// Only performs atomic operations - no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Get signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }
}

/// `kill(2)` with an already-gone target reported as `Ok(false)`. `target`
/// follows `kill(2)`: a pid, `-pgid` for a group, or `-1` for everyone.
///
/// Never logs, so the namespace init may call it.
pub fn send_signal(target: i32, sig: Signal) -> nix::Result<bool> {
    match signal::kill(Pid::from_raw(target), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e),
    }
}

fn send_or_warn(target: i32, sig: Signal, what: &str) -> bool {
    send_signal(target, sig).unwrap_or_else(|e| {
        warn!("Failed to send {} to {}: {}", sig, what, e);
        false
    })
}

/// Send `sig` to one process. Returns false when the process no longer exists.
pub fn kill_process(pid: i32, sig: Signal) -> bool {
    send_or_warn(pid, sig, &format!("pid {}", pid))
}

/// Send `sig` to a whole process group. Returns false when the group is empty.
pub fn kill_process_group(pgid: i32, sig: Signal) -> bool {
    send_or_warn(-pgid, sig, &format!("process group {}", pgid))
}

/// Send `sig` to every process the caller may signal except itself. Inside a
/// pid namespace this is exactly the namespace minus its init.
pub fn kill_every_process(sig: Signal) -> bool {
    send_or_warn(-1, sig, "every process")
}

/// Restore default dispositions and an empty mask. Called in a freshly forked
/// child before exec so the program does not inherit the sandbox's handling.
pub fn reset_for_exec() -> Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in Signal::iterator() {
        if matches!(sig, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        // SAFETY: installing SIG_DFL has no handler to be unsound.
        unsafe { signal::sigaction(sig, &default) }.map_err(|e| {
            IsolateError::Process(format!("Failed to reset {} disposition: {}", sig, e))
        })?;
    }
    signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(|e| IsolateError::Process(format!("Failed to clear signal mask: {}", e)))?;
    Ok(())
}
