//! Process lifecycle management for child processes
//!
//! Every external command (`mount`, `umount`, `dd`, ...) is spawned in its own
//! process group and registered here, so a termination signal delivered to
//! dephy-pi can stop them before the run unwinds through its cleanup path.
//!
//! # Signals
//! - SIGINT, SIGTERM and SIGHUP set a process-wide interrupt flag and
//!   terminate registered children (SIGTERM, then SIGKILL after a grace period).
//! - While a [`NonInterruptible`] section is active (the flash), children are
//!   left alone: interrupting `dd` mid-write leaves a corrupt card. The flag is
//!   still set and the run aborts once the section ends.
//! - A second signal outside a non-interruptible section exits immediately.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};

/// Global registry of child process IDs
static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Set once a termination signal has been received
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Depth of currently active non-interruptible sections
static CRITICAL_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Registry tracking all spawned child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    /// Set of child PIDs currently running
    pids: HashSet<u32>,
    /// Whether cleanup has already been initiated (prevent double-cleanup)
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Register a new child process
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!(pid, "registered child process");
    }

    /// Unregister a child process (called when it exits normally)
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!(pid, "unregistered child process");
    }

    /// Number of tracked children
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate all tracked child processes.
    ///
    /// Sends SIGTERM to each process group first, waits up to `grace_period`,
    /// then SIGKILLs whatever is left.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            debug!("cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            debug!("no child processes to terminate");
            return;
        }

        info!(count = self.pids.len(), "terminating child processes");

        let pids_to_kill: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids_to_kill {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                warn!(pid, error = %e, "SIGTERM to process group failed");
                if let Err(e2) = send_signal(pid, Signal::SIGTERM) {
                    warn!(pid, error = %e2, "SIGTERM to process failed");
                }
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids_to_kill.iter().all(|&pid| !is_process_alive(pid)) {
                info!("all child processes terminated gracefully");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids_to_kill {
            if is_process_alive(pid) {
                warn!(pid, "process group did not terminate, sending SIGKILL");
                if send_signal_to_group(pid, Signal::SIGKILL).is_err() {
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        self.pids.clear();
    }
}

/// Send a signal to a process
fn send_signal(pid: u32, signal: Signal) -> std::result::Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Send a signal to an entire process group
fn send_signal_to_group(pgid: u32, signal: Signal) -> std::result::Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still alive (not dead or zombie)
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/pid/stat is the state; Z and X are not running
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// Register `pid` in the global registry.
pub fn register_child(pid: u32) {
    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }
}

/// Remove `pid` from the global registry.
pub fn unregister_child(pid: u32) {
    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }
}

/// Returns true once a termination signal has been received.
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Fail with [`ProvisionError::Interrupted`] if a signal has been received.
pub fn check_interrupted() -> Result<()> {
    if is_interrupted() {
        Err(ProvisionError::Interrupted)
    } else {
        Ok(())
    }
}

/// Returns true while any non-interruptible section is active.
pub fn in_critical_section() -> bool {
    CRITICAL_DEPTH.load(Ordering::SeqCst) > 0
}

/// RAII marker for a section that must not be cut short by signals.
///
/// Signals received while this guard is alive are recorded but do not
/// terminate children.
pub struct NonInterruptible {
    label: &'static str,
}

impl NonInterruptible {
    /// Enter a non-interruptible section
    pub fn enter(label: &'static str) -> Self {
        CRITICAL_DEPTH.fetch_add(1, Ordering::SeqCst);
        debug!(label, "entered non-interruptible section");
        Self { label }
    }
}

impl Drop for NonInterruptible {
    fn drop(&mut self) {
        CRITICAL_DEPTH.fetch_sub(1, Ordering::SeqCst);
        debug!(label = self.label, "left non-interruptible section");
        if is_interrupted() {
            warn!(label = self.label, "signal was deferred until this section finished");
        }
    }
}

/// Initialize global signal handlers.
/// Handles SIGINT (Ctrl+C), SIGTERM, and SIGHUP. Call this once at program start.
pub fn init_signal_handlers() -> std::result::Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            let repeated = INTERRUPTED.swap(true, Ordering::SeqCst);

            if in_critical_section() {
                warn!(
                    signal = signal_name,
                    "flash in progress; it cannot be interrupted safely and will finish first"
                );
                continue;
            }

            if repeated {
                warn!(signal = signal_name, "second signal received, exiting immediately");
                std::process::exit(128 + sig);
            }

            info!(signal = signal_name, "signal received, stopping child processes");
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions (setpgid, prctl)
        unsafe {
            self.pre_exec(|| {
                // Own process group: a terminal Ctrl+C reaches dephy-pi only,
                // which then decides what happens to the child
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                // Child dies with the parent instead of running on unsupervised
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
