//! Launching capability server processes
//!
//! [`Launcher`] turns a [`LaunchSpec`] into a live [`McpSession`] plus a
//! [`ProcessHandle`]. [`StdioLauncher`] spawns a real child process with a
//! minimal environment, speaks MCP over its stdio and watches it for exit.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::ServiceExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use super::session::{McpSession, RmcpSession};
use super::types::{ProcessEvent, ProcessNotice};
use crate::error::{HostError, HostResult};

/// Startup timeout for spawning and initializing an MCP server
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a killed process to be reaped
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variables passed through to server processes
pub const FORWARDED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "LC_MESSAGES",
    "TMPDIR",
    "TEMP",
    "TMP",
];

/// Commands that exist on every system but cannot speak MCP
const PLACEHOLDER_COMMANDS: &[&str] = &["echo", "true", "false", "cat", "sleep", "yes", "printf"];

pub type ProcessEventSender = mpsc::UnboundedSender<ProcessNotice>;

/// Everything needed to start one server process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub server: String,
    /// Unique per launch; echoed in every [`ProcessNotice`]
    pub launch_id: u64,
    /// Command as configured
    pub command: String,
    /// Resolved executable
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// A freshly launched server
pub struct Launched {
    pub session: Arc<dyn McpSession>,
    pub process: ProcessHandle,
}

/// Starts server processes
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn the process and complete the MCP handshake
    ///
    /// Exit or failure of the process afterwards is reported on `events`.
    async fn launch(&self, spec: &LaunchSpec, events: ProcessEventSender) -> HostResult<Launched>;
}

/// Handle used to forcibly stop a launched process
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    reaped: Option<oneshot::Receiver<()>>,
}

impl ProcessHandle {
    /// `kill` asks the owner of the process to kill it; `reaped` fires once
    /// it is gone
    pub fn new(pid: Option<u32>, kill: oneshot::Sender<()>, reaped: oneshot::Receiver<()>) -> Self {
        Self {
            pid,
            kill: Some(kill),
            reaped: Some(reaped),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kill the process and wait (bounded) for it to be reaped
    pub async fn terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if let Some(reaped) = self.reaped.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, reaped).await.is_err() {
                tracing::warn!("Process {:?} was not reaped within {:?}", self.pid, SHUTDOWN_TIMEOUT);
            }
        }
    }
}

/// Launches servers as child processes speaking MCP over stdio
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioLauncher;

#[async_trait]
impl Launcher for StdioLauncher {
    async fn launch(&self, spec: &LaunchSpec, events: ProcessEventSender) -> HostResult<Launched> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::spawn(&spec.server, &spec.command, &e))?;
        let pid = child.id();
        tracing::debug!("Spawned MCP server {} (pid {:?})", spec.server, pid);

        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            let _ = child.kill().await;
            return Err(HostError::Spawn {
                server: spec.server.clone(),
                command: spec.command.clone(),
                reason: "failed to capture stdio".to_string(),
                hint: None,
            });
        };

        if let Some(stderr) = child.stderr.take() {
            let server = spec.server.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "mcp_host::server_stderr", server = %server, "{}", line);
                }
            });
        }

        let service = match tokio::time::timeout(STARTUP_TIMEOUT, ().serve((stdout, stdin))).await {
            Ok(Ok(service)) => service,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(HostError::Protocol {
                    server: spec.server.clone(),
                    reason: format!("initialization failed: {}", e),
                });
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(HostError::Protocol {
                    server: spec.server.clone(),
                    reason: format!("startup timed out after {:?}", STARTUP_TIMEOUT),
                });
            }
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        let (reaped_tx, reaped_rx) = oneshot::channel();
        tokio::spawn(monitor_process(
            spec.server.clone(),
            spec.launch_id,
            child,
            kill_rx,
            reaped_tx,
            events,
        ));

        Ok(Launched {
            session: Arc::new(RmcpSession::new(spec.server.clone(), service)),
            process: ProcessHandle::new(pid, kill_tx, reaped_rx),
        })
    }
}

/// Wait for the child to exit or for a kill request
///
/// Only exits the host did not ask for are reported.
async fn monitor_process(
    server: String,
    launch_id: u64,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    reaped_tx: oneshot::Sender<()>,
    events: ProcessEventSender,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };

    match exited {
        Some(Ok(status)) => {
            let _ = events.send(ProcessNotice {
                server,
                launch_id,
                event: ProcessEvent::Exited { code: status.code() },
            });
        }
        Some(Err(e)) => {
            let _ = events.send(ProcessNotice {
                server,
                launch_id,
                event: ProcessEvent::Failed { reason: e.to_string() },
            });
        }
        None => {
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill MCP server {}: {}", server, e);
            }
        }
    }

    let _ = reaped_tx.send(());
}

/// Whether `command` is a well-known utility that cannot be an MCP server
pub fn is_placeholder_command(command: &str) -> bool {
    let name = Path::new(command)
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or(command);
    PLACEHOLDER_COMMANDS.contains(&name)
}

/// Build the minimal environment for a server process
pub fn forwarded_environment<F>(lookup: F) -> Vec<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    FORWARDED_ENV_VARS
        .iter()
        .filter_map(|key| lookup(key).map(|value| (key.to_string(), value)))
        .collect()
}

/// Resolve a bare command name through `path`
///
/// Commands containing a path separator, and commands not found on `path`,
/// are returned unchanged so the spawn error names them.
pub fn resolve_command(command: &str, path: Option<&OsStr>) -> PathBuf {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.to_path_buf();
    }

    path.into_iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(command))
        .find(|p| is_executable(p))
        .unwrap_or_else(|| candidate.to_path_buf())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
