//! Agent process spawning and supervision.
//!
//! The protocol client only needs a pair of byte streams. This module is the
//! adapter that produces them from a real child process:
//!
//! - [`SpawnConfig`] describes the command; it runs inside the user's login
//!   shell so the agent sees the same PATH as their terminal.
//! - [`AgentProcess::spawn`] starts it with piped stdio.
//! - [`AgentProcess::into_parts`] splits off the streams and hands the child to
//!   a supervisor task, returning a [`ProcessHandle`] for stop/wait.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};

use crate::error::{BridgeError, Result};
use crate::logging::{Direction, Transcript};

/// How an agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgentExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl AgentExit {
    /// Exit status could not be observed.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for AgentExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Configuration for spawning an agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub binary_path: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    /// Shell invocation to wrap the command in, e.g. `/bin/zsh -l -c`.
    /// Defaults to `$SHELL -l -c`.
    pub shell_prefix: Option<String>,
}

impl SpawnConfig {
    pub fn new(binary_path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args,
            working_dir: None,
            shell_prefix: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn shell_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shell_prefix = Some(prefix.into());
        self
    }

    /// Build the command, without configuring stdio.
    pub fn command(&self) -> Result<Command> {
        build_login_shell_command(
            &self.binary_path,
            &self.args,
            self.working_dir.as_deref(),
            self.shell_prefix.as_deref(),
        )
    }
}

/// Configuration for spawning Codex in protocol mode.
#[derive(Debug, Clone, Default)]
pub struct CodexConfig {
    pub binary_path: String,
    pub working_dir: Option<String>,
    pub model: Option<String>,
    pub shell_prefix: Option<String>,
}

impl CodexConfig {
    pub fn build(self) -> SpawnConfig {
        let mut args = vec!["proto".to_string()];

        if let Some(model) = self.model.as_deref().filter(|m| !m.is_empty()) {
            args.push("-c".to_string());
            args.push(format!("model=\"{model}\""));
        }

        let mut config = SpawnConfig::new(self.binary_path, args);
        if let Some(dir) = self.working_dir {
            config = config.working_dir(dir);
        }
        if let Some(shell) = self.shell_prefix {
            config = config.shell_prefix(shell);
        }
        config
    }
}

/// A freshly spawned agent with piped stdio.
pub struct AgentProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
}

/// The pieces of an [`AgentProcess`] after [`AgentProcess::into_parts`].
pub struct ProcessParts {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
    pub handle: ProcessHandle,
}

impl AgentProcess {
    pub fn spawn(config: &SpawnConfig) -> Result<Self> {
        let mut cmd = config.command()?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("{}: {}", config.binary_path, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Spawn("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Spawn("Failed to capture stdout".to_string()))?;
        let stderr = child.stderr.take();

        log::info!(
            "Spawned {} (pid {:?})",
            config.binary_path,
            child.id()
        );

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Hand the child to a supervisor task and return its streams plus a handle.
    ///
    /// `stop_grace` is how long the process gets after SIGINT before it is killed.
    pub fn into_parts(self, stop_grace: Duration) -> ProcessParts {
        let pid = self.child.id();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(self.child, stop_rx, exit_tx, stop_grace));

        ProcessParts {
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            handle: ProcessHandle {
                pid,
                stop_tx,
                exit_rx,
            },
        }
    }
}

/// Control over a supervised agent process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stop_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<AgentExit>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The exit status, if the process has already ended.
    pub fn exit_status(&self) -> Option<AgentExit> {
        *self.exit_rx.borrow()
    }

    /// Wait for the process to end.
    pub async fn wait(&self) -> AgentExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        exit.unwrap_or_else(AgentExit::unknown)
    }

    /// Interrupt the process, kill it if it outlives the grace window, and
    /// wait for it to end.
    pub async fn stop(&self) -> AgentExit {
        let _ = self.stop_tx.try_send(());
        self.wait().await
    }
}

async fn supervise(
    mut child: Child,
    mut stop_rx: mpsc::Receiver<()>,
    exit_tx: watch::Sender<Option<AgentExit>>,
    grace: Duration,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        Some(()) = stop_rx.recv() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            interrupt(&mut child);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    log::warn!(
                        "Process {:?} ignored interrupt for {}ms, killing",
                        child.id(),
                        grace.as_millis()
                    );
                    let _ = child.kill().await;
                    child.wait().await
                }
            }
        }
    };

    let exit = match status {
        Ok(status) => AgentExit::from(status),
        Err(e) => {
            log::warn!("Failed to wait for agent process: {}", e);
            AgentExit::unknown()
        }
    };
    log::info!("Agent process exited: {:?}", exit);
    exit_tx.send_replace(Some(exit));
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGINT);
        }
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    let _ = child.start_kill();
}

/// Forward stderr lines to the log and the transcript until the stream closes.
pub async fn forward_stderr(stderr: ChildStderr, session_id: String, transcript: Transcript) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                log::warn!("agent stderr [{}]: {}", session_id, line);
                transcript.record(Direction::Stderr, &line);
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("Stopped reading stderr for {}: {}", session_id, e);
                break;
            }
        }
    }
}

/// Prepend the binary's parent directory to PATH so sibling tools (node etc.) resolve.
fn prepare_path_env(cmd: &mut Command, binary_path: &str) {
    if !binary_path.contains('/') {
        return;
    }
    let Some(dir) = std::path::Path::new(binary_path)
        .parent()
        .and_then(|d| d.to_str())
    else {
        return;
    };
    let existing = std::env::var("PATH").unwrap_or_default();
    let combined = if existing.is_empty() {
        dir.to_string()
    } else {
        format!("{dir}:{existing}")
    };
    cmd.env("PATH", combined);
}

/// Build `<prefix> '<quoted binary and args>'`.
#[cfg(unix)]
pub fn build_login_shell_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Command> {
    let prefix = shell_prefix_or_default(shell_prefix);
    let mut prefix_parts = prefix.split_whitespace();
    let shell_program = prefix_parts
        .next()
        .ok_or_else(|| BridgeError::Spawn("Empty shell prefix".to_string()))?;

    let quoted = std::iter::once(binary_path)
        .chain(args.iter().map(String::as_str))
        .map(|part| {
            shlex::try_quote(part)
                .map(|q| q.into_owned())
                .map_err(|_| BridgeError::Spawn(format!("Cannot quote argument: {part}")))
        })
        .collect::<Result<Vec<_>>>()?
        .join(" ");

    let mut cmd = Command::new(shell_program);
    cmd.args(prefix_parts).arg(quoted);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    prepare_path_env(&mut cmd, binary_path);
    Ok(cmd)
}

#[cfg(not(unix))]
pub fn build_login_shell_command(
    binary_path: &str,
    args: &[String],
    working_dir: Option<&str>,
    _shell_prefix: Option<&str>,
) -> Result<Command> {
    let mut cmd = Command::new(binary_path);
    cmd.args(args);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    prepare_path_env(&mut cmd, binary_path);
    Ok(cmd)
}

/// A custom prefix wins; otherwise `$SHELL -l -c`, falling back to bash/sh for
/// shells that do not take POSIX flags.
#[cfg(unix)]
fn shell_prefix_or_default(custom: Option<&str>) -> String {
    if let Some(prefix) = custom.filter(|p| !p.trim().is_empty()) {
        return prefix.to_string();
    }

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let name = std::path::Path::new(&shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    const NON_POSIX: [&str; 6] = ["fish", "nu", "nushell", "elvish", "xonsh", "ion"];
    let effective = if NON_POSIX.contains(&name) {
        if std::path::Path::new("/bin/bash").exists() {
            "/bin/bash"
        } else {
            "/bin/sh"
        }
    } else {
        shell.as_str()
    };

    format!("{effective} -l -c")
}

// ============================================================================
// TESTS
// ============================================================================
