//! Type-safe external command execution.
//!
//! Every system tool dephy-pi drives (`mount`, `umount`, `dd`, `eject`,
//! `blockdev`, `wpa_passphrase`) has a typed argument struct implementing
//! [`CommandArgs`]. The struct is the contract: it decides the exact argv,
//! whether anything is fed on stdin, and whether the command is destructive.
//!
//! Execution goes through the [`CommandRunner`] trait so the orchestrator can
//! be driven by a recording fake in tests. [`SystemRunner`] is the real thing:
//! process group isolation, PID registration for signal cleanup, bounded waits.

use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::process_guard::{self, CommandProcessGroup};

/// Poll interval while waiting on a child process
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Trait for typed command arguments.
///
/// # Contract
///
/// - `program()`: the binary name, resolved through `PATH`.
/// - `to_cli_args()`: argv after the program name, exactly as the tool expects.
/// - `stdin_data()`: bytes written to the child's stdin, if any. Secrets travel
///   here, never in argv.
pub trait CommandArgs {
    /// Binary to execute.
    fn program(&self) -> &'static str;

    /// Arguments passed after the program name.
    fn to_cli_args(&self) -> Vec<String>;

    /// Data fed to stdin. Never logged.
    fn stdin_data(&self) -> Option<String> {
        None
    }

    /// Whether the command overwrites device contents.
    fn is_destructive(&self) -> bool {
        false
    }
}

/// `mount <device> <target>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountArgs {
    pub device: PathBuf,
    pub target: PathBuf,
}

impl CommandArgs for MountArgs {
    fn program(&self) -> &'static str {
        "mount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            self.device.display().to_string(),
            self.target.display().to_string(),
        ]
    }
}

/// `umount <target>`, where target is a mount point or device node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UmountArgs {
    pub target: PathBuf,
}

impl CommandArgs for UmountArgs {
    fn program(&self) -> &'static str {
        "umount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.target.display().to_string()]
    }
}

/// `dd if=<input> of=<output> bs=<block_size> conv=fsync`
///
/// `conv=fsync` forces a synchronous flush of the output before `dd` exits, so
/// a zero exit status means the bytes are on the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdArgs {
    pub input: PathBuf,
    pub output: PathBuf,
    pub block_size: String,
}

impl CommandArgs for DdArgs {
    fn program(&self) -> &'static str {
        "dd"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            format!("if={}", self.input.display()),
            format!("of={}", self.output.display()),
            format!("bs={}", self.block_size),
            "conv=fsync".to_string(),
        ]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `eject <device>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EjectArgs {
    pub device: PathBuf,
}

impl CommandArgs for EjectArgs {
    fn program(&self) -> &'static str {
        "eject"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.device.display().to_string()]
    }
}

/// `blockdev --rereadpt <device>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RereadPartitionTableArgs {
    pub device: PathBuf,
}

impl CommandArgs for RereadPartitionTableArgs {
    fn program(&self) -> &'static str {
        "blockdev"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["--rereadpt".to_string(), self.device.display().to_string()]
    }
}

/// `wpa_passphrase <ssid>` with the passphrase on stdin.
///
/// Given only the SSID, `wpa_passphrase` reads the passphrase from stdin, which
/// keeps it out of `/proc/<pid>/cmdline`.
#[derive(Clone)]
pub struct WpaPassphraseArgs {
    pub ssid: String,
    pub passphrase: String,
}

impl fmt::Debug for WpaPassphraseArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WpaPassphraseArgs")
            .field("ssid", &self.ssid)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

impl CommandArgs for WpaPassphraseArgs {
    fn program(&self) -> &'static str {
        "wpa_passphrase"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.ssid.clone()]
    }

    fn stdin_data(&self) -> Option<String> {
        Some(format!("{}\n", self.passphrase))
    }
}

/// Output from a command execution.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the command exited successfully (exit code 0).
    pub success: bool,
}

impl CommandOutput {
    /// Successful output carrying `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// Failed output carrying `stderr`.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
            success: false,
        }
    }

    /// Check the command succeeded and return a `CommandFailed` error if not.
    pub fn ensure_success(self, program: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(ProvisionError::CommandFailed {
                program: program.to_string(),
                code: self.exit_code.unwrap_or(-1),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Executes typed commands.
pub trait CommandRunner {
    /// Run to completion, killing the command if it outlives `timeout`.
    fn run(&self, args: &dyn CommandArgs, timeout: Option<Duration>) -> Result<CommandOutput>;

    /// Run to completion with no bound, calling `tick` while the command is
    /// alive. Used for long operations that drive a spinner.
    fn run_with_ticker(
        &self,
        args: &dyn CommandArgs,
        tick: &mut dyn FnMut(),
    ) -> Result<CommandOutput> {
        tick();
        self.run(args, None)
    }
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn spawn(&self, args: &dyn CommandArgs) -> Result<Child> {
        let program = args.program();
        let cli_args = args.to_cli_args();
        let stdin_data = args.stdin_data();

        info!(program, args = ?cli_args, destructive = args.is_destructive(), "running command");

        let mut cmd = Command::new(program);
        cmd.args(&cli_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .in_new_process_group();

        let mut child = cmd.spawn()?;
        process_guard::register_child(child.id());

        if let Some(data) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(data.as_bytes())?;
                // stdin drops here so the child sees EOF
            }
        }

        Ok(child)
    }

    fn wait(
        &self,
        program: &str,
        mut child: Child,
        timeout: Option<Duration>,
        tick: &mut dyn FnMut(),
    ) -> Result<CommandOutput> {
        let pid = child.id();
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let start = Instant::now();

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Some(limit) = timeout {
                if start.elapsed() >= limit {
                    warn!(program, pid, timeout_secs = limit.as_secs(), "command timed out, killing it");
                    let _ = child.kill();
                    let _ = child.wait();
                    process_guard::unregister_child(pid);
                    return Err(ProvisionError::Timeout {
                        program: program.to_string(),
                        timeout: limit,
                    });
                }
            }
            tick();
            std::thread::sleep(POLL_INTERVAL);
        };

        process_guard::unregister_child(pid);

        let output = CommandOutput {
            stdout: join_drain(stdout),
            stderr: join_drain(stderr),
            exit_code: status.code(),
            success: status.success(),
        };

        if !output.success && process_guard::is_interrupted() {
            return Err(ProvisionError::Interrupted);
        }

        debug!(program, code = ?output.exit_code, "command finished");
        Ok(output)
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, args: &dyn CommandArgs, timeout: Option<Duration>) -> Result<CommandOutput> {
        let child = self.spawn(args)?;
        self.wait(args.program(), child, timeout, &mut || {})
    }

    fn run_with_ticker(
        &self,
        args: &dyn CommandArgs,
        tick: &mut dyn FnMut(),
    ) -> Result<CommandOutput> {
        let child = self.spawn(args)?;
        self.wait(args.program(), child, None, tick)
    }
}

/// Read a child pipe to completion on a helper thread so the child never
/// blocks on a full pipe while we poll it.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut reader| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).to_string()
        })
    })
}

fn join_drain(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
