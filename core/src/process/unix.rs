//! Unix process management with process groups
//!
//! Spawned services are placed in their own process group via `setsid()`:
//! the child becomes a session and group leader with no controlling
//! terminal, and signals sent to the group reach every process the service
//! itself may have spawned. SIGTERM asks for graceful shutdown, SIGKILL
//! ends the group forcefully.

#![allow(unsafe_code)]

use crate::error::{Result, TcsError};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// A child process in its own process group
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    child: Child,
}

impl ChildProcess {
    /// Process id of the child
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Wait for the child to exit
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child
            .wait()
            .await
            .map_err(|e| TcsError::Process(format!("wait for {} failed: {e}", self.pid)))
    }

    /// Non-blocking exit check
    pub fn try_wait(&mut self) -> Result<Option<std::process::ExitStatus>> {
        self.child
            .try_wait()
            .map_err(|e| TcsError::Process(format!("try_wait for {} failed: {e}", self.pid)))
    }

    /// Take the piped stdout for async consumption
    pub fn take_stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the piped stderr for async consumption
    pub fn take_stderr(&mut self) -> Option<tokio::process::ChildStderr> {
        self.child.stderr.take()
    }
}

/// Spawn `cmd` with `args` in a new process group, stdout/stderr piped
pub fn spawn(cmd: &str, args: &[String]) -> Result<ChildProcess> {
    spawn_with_env(cmd, args, &[])
}

/// Like [`spawn`], with extra environment variables for the child
pub fn spawn_with_env(
    cmd: &str,
    args: &[String],
    envs: &[(String, String)],
) -> Result<ChildProcess> {
    debug!("spawning process: {cmd} {args:?}");

    let mut command = Command::new(cmd);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    // SAFETY: setsid() is async-signal-safe and runs in the child between
    // fork and exec.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command
        .spawn()
        .map_err(|e| TcsError::Process(format!("failed to spawn '{cmd}': {e}")))?;
    let raw_pid = child
        .id()
        .ok_or_else(|| TcsError::Process(format!("spawned '{cmd}' has no pid")))?;
    let pid = Pid::from_raw(raw_pid as i32);
    debug!("spawned process {pid} in new process group");

    Ok(ChildProcess { pid, child })
}

fn signal_group(child: &ChildProcess, signal: Signal) -> Result<()> {
    match killpg(child.pid, signal) {
        Ok(()) => Ok(()),
        // ESRCH / EPERM mean the group already exited (or was reaped and
        // its id handed to another owner); both count as done.
        Err(nix::errno::Errno::ESRCH) | Err(nix::errno::Errno::EPERM) => {
            debug!("process group {} already gone", child.pid);
            Ok(())
        }
        Err(e) => Err(TcsError::Process(format!(
            "failed to send {signal} to process group {}: {e}",
            child.pid
        ))),
    }
}

/// Send SIGTERM to the child's process group
pub fn signal_term_group(child: &ChildProcess) -> Result<()> {
    debug!("sending SIGTERM to process group {}", child.pid);
    signal_group(child, Signal::SIGTERM)
}

/// Send SIGKILL to the child's process group
pub fn signal_kill_group(child: &ChildProcess) -> Result<()> {
    debug!("sending SIGKILL to process group {}", child.pid);
    signal_group(child, Signal::SIGKILL)
}

/// Graceful termination with TERM→KILL escalation
///
/// Sends SIGTERM, waits up to `grace` for the child to exit, then sends
/// SIGKILL and waits for the exit status.
pub async fn terminate_with_grace(
    child: &mut ChildProcess,
    grace: Duration,
) -> Result<std::process::ExitStatus> {
    signal_term_group(child)?;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                "process group {} did not exit within {grace:?}, escalating to SIGKILL",
                child.pid
            );
            signal_kill_group(child)?;
            child.wait().await
        }
    }
}

/// Decompose an exit status into `(exit_code, signal)`
#[must_use]
pub fn exit_parts(status: std::process::ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => (Some(code), None),
        None => (None, status.signal()),
    }
}
