//! Shell subprocess execution
//!
//! Spawns `sh -c` under the platform sandbox and hands back a
//! [`CommandHandle`] exposing streaming output buffers, a cancel function,
//! a done channel, and `close`. The handle owns the sandbox's lifetime:
//! closing it kills a still-running process and tears down any
//! platform-level mapping.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{AngelError, AngelResult};
use crate::fs::os_sandbox::{self, SandboxSpec, Teardown};

/// How to run one command
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Resolved working directory; defaults to the sandbox directory
    pub working_dir: Option<PathBuf>,
    /// Kill the process after this long; `None` runs until completion or
    /// session close
    pub timeout: Option<Duration>,
    /// Skip OS-level isolation (trusted internal commands only)
    pub unsandboxed: bool,
}

/// Final state of a finished command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Killed,
    TimedOut,
}

impl ExitState {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// Live handle to a spawned subprocess
pub struct CommandHandle {
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
    done_rx: watch::Receiver<Option<ExitState>>,
    cancel: CancellationToken,
    teardown: Mutex<Teardown>,
}

impl std::fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("done_rx", &*self.done_rx.borrow())
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl CommandHandle {
    /// Snapshot of stdout so far
    pub fn stdout(&self) -> String {
        self.stdout.lock().clone()
    }

    /// Snapshot of stderr so far
    pub fn stderr(&self) -> String {
        self.stderr.lock().clone()
    }

    /// Channel that resolves when the process finishes
    pub fn done(&self) -> watch::Receiver<Option<ExitState>> {
        self.done_rx.clone()
    }

    /// Exit state if the process already finished
    pub fn exit_state(&self) -> Option<ExitState> {
        *self.done_rx.borrow()
    }

    /// Request termination; idempotent
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the process to finish
    pub async fn wait(&self) -> ExitState {
        let mut rx = self.done_rx.clone();
        loop {
            if let Some(state) = *rx.borrow() {
                return state;
            }
            if rx.changed().await.is_err() {
                return ExitState::Killed;
            }
        }
    }

    /// Kill the process if still alive and tear down the sandbox mapping
    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self.wait().await;
        if let Some(teardown) = self.teardown.lock().take() {
            teardown();
        }
    }
}

impl Drop for CommandHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(teardown) = self.teardown.lock().take() {
            teardown();
        }
    }
}

/// Spawn `command_line` through the shell inside the sandbox
pub fn spawn_shell(
    command_line: &str,
    sandbox_dir: &Path,
    writable_roots: &[PathBuf],
    opts: &RunOptions,
) -> AngelResult<CommandHandle> {
    let mut cmd = shell_command(command_line);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.current_dir(opts.working_dir.as_deref().unwrap_or(sandbox_dir));

    let teardown = if opts.unsandboxed {
        None
    } else {
        os_sandbox::apply(
            &mut cmd,
            &SandboxSpec {
                sandbox_dir,
                writable: writable_roots,
            },
        )?
    };

    let mut child = cmd
        .spawn()
        .map_err(|e| AngelError::permission(format!("failed to spawn {command_line:?}: {e}")))?;

    let stdout = Arc::new(Mutex::new(String::new()));
    let stderr = Arc::new(Mutex::new(String::new()));

    let stdout_task = child.stdout.take().map(|pipe| {
        let buf = Arc::clone(&stdout);
        tokio::spawn(async move { pump_output(pipe, buf).await })
    });
    let stderr_task = child.stderr.take().map(|pipe| {
        let buf = Arc::clone(&stderr);
        tokio::spawn(async move { pump_output(pipe, buf).await })
    });

    let (done_tx, done_rx) = watch::channel(None);
    let cancel = CancellationToken::new();
    let waiter_cancel = cancel.clone();
    let timeout = opts.timeout;

    tokio::spawn(async move {
        let state = supervise(&mut child, waiter_cancel, timeout).await;
        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        let _ = done_tx.send(Some(state));
    });

    Ok(CommandHandle {
        stdout,
        stderr,
        done_rx,
        cancel,
        teardown: Mutex::new(teardown),
    })
}

fn shell_command(command_line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    }
}

async fn supervise(
    child: &mut tokio::process::Child,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> ExitState {
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ExitState::Exited(status.code().unwrap_or(-1)),
            Err(_) => ExitState::Killed,
        },
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            ExitState::Killed
        }
        _ = deadline => {
            let _ = child.kill().await;
            ExitState::TimedOut
        }
    }
}

async fn pump_output<R: tokio::io::AsyncRead + Unpin>(reader: R, buf: Arc<Mutex<String>>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut guard = buf.lock();
        guard.push_str(&line);
        guard.push('\n');
    }
}
