//! Protocol client
//!
//! Owns every live server connection: the spawned process, the MCP session
//! and the per-connection status. Lifecycle calls made by the manager are
//! answered directly; process exits and failures the host did not request
//! are applied here and published as [`StatusChange`]s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rmcp::model::CallToolResult;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, RwLock};

use super::session::McpSession;
use super::spawn::{
    forwarded_environment, is_placeholder_command, resolve_command, LaunchSpec, Launcher,
    ProcessEventSender, ProcessHandle,
};
use super::types::{tool_id, McpTool, ProcessEvent, ProcessNotice, ServerState, ServerStatus, StatusChange};
use crate::config::{ServerConfig, ServerSecurityPolicy};
use crate::error::{HostError, HostResult};
use crate::security::SecurityPolicy;

/// Attempts made to list tools after a server starts
pub const DISCOVERY_ATTEMPTS: u32 = 3;

/// Pause between discovery attempts
pub const DISCOVERY_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Tool call timeout when neither the caller nor the server policy sets one
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// A live connection to one server
struct ServerConnection {
    launch_id: u64,
    session: Arc<dyn McpSession>,
    process: ProcessHandle,
    status: ServerStatus,
    policy: Option<ServerSecurityPolicy>,
}

struct Connections {
    entries: RwLock<HashMap<String, ServerConnection>>,
    status_tx: broadcast::Sender<StatusChange>,
}

impl Connections {
    async fn handle_process_event(&self, notice: ProcessNotice) {
        let conn = {
            let mut entries = self.entries.write().await;
            match entries.get(&notice.server) {
                Some(conn) if conn.launch_id == notice.launch_id => entries.remove(&notice.server),
                _ => None,
            }
        };
        let Some(conn) = conn else {
            tracing::debug!(
                "Ignoring process event for {} (launch {} is not connected)",
                notice.server,
                notice.launch_id
            );
            return;
        };
        let ServerConnection {
            session,
            process: _process,
            mut status,
            ..
        } = conn;

        let error = match notice.event {
            ProcessEvent::Exited { code } => {
                tracing::warn!("MCP server {} exited unexpectedly (code {:?})", notice.server, code);
                status.transition(ServerState::Stopped);
                None
            }
            ProcessEvent::Failed { reason } => {
                tracing::error!("MCP server {} process error: {}", notice.server, reason);
                status.fail(reason.clone());
                Some(reason)
            }
        };

        if let Err(e) = session.close().await {
            tracing::debug!("Error closing session for {}: {}", notice.server, e);
        }

        let _ = self.status_tx.send(StatusChange {
            server: notice.server,
            state: status.state,
            error,
        });
    }
}

async fn run_process_events(connections: Weak<Connections>, mut rx: mpsc::UnboundedReceiver<ProcessNotice>) {
    while let Some(notice) = rx.recv().await {
        let Some(connections) = connections.upgrade() else {
            break;
        };
        connections.handle_process_event(notice).await;
    }
}

/// Client for all capability servers
///
/// Must be created inside a tokio runtime.
pub struct ProtocolClient {
    connections: Arc<Connections>,
    security: Arc<SecurityPolicy>,
    launcher: Arc<dyn Launcher>,
    events_tx: ProcessEventSender,
    next_launch_id: AtomicU64,
}

impl ProtocolClient {
    pub fn new(security: Arc<SecurityPolicy>, launcher: Arc<dyn Launcher>) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        let connections = Arc::new(Connections {
            entries: RwLock::new(HashMap::new()),
            status_tx,
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_process_events(Arc::downgrade(&connections), events_rx));

        Self {
            connections,
            security,
            launcher,
            events_tx,
            next_launch_id: AtomicU64::new(1),
        }
    }

    /// Status changes caused by process exit or failure
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.connections.status_tx.subscribe()
    }

    pub fn security(&self) -> &Arc<SecurityPolicy> {
        &self.security
    }

    /// Validate, spawn, handshake and discover tools for one server
    pub async fn connect(&self, config: &ServerConfig) -> HostResult<ServerStatus> {
        let name = config.name.as_str();

        let validation = self.security.validate_server_config(config);
        for warning in &validation.warnings {
            tracing::warn!("{}", warning);
        }
        if !validation.valid {
            return Err(HostError::InvalidConfig {
                server: name.to_string(),
                errors: validation.errors,
            });
        }
        if is_placeholder_command(&config.command) {
            return Err(HostError::PlaceholderCommand {
                server: name.to_string(),
                command: config.command.clone(),
            });
        }
        if self.is_connected(name).await {
            return Err(HostError::AlreadyConnected(name.to_string()));
        }

        let path = std::env::var_os("PATH");
        let launch_id = self.next_launch_id.fetch_add(1, Ordering::Relaxed);
        let spec = LaunchSpec {
            server: name.to_string(),
            launch_id,
            command: config.command.clone(),
            program: resolve_command(&config.command, path.as_deref()),
            args: config.args.clone(),
            working_dir: config.expanded_working_directory(),
            env: forwarded_environment(|key| std::env::var(key).ok()),
        };

        tracing::info!("Starting MCP server: {} ({})", name, spec.program.display());
        let launched = self
            .launcher
            .launch(&spec, self.events_tx.clone())
            .await
            .inspect_err(|e| {
                if e.is_command_not_found() {
                    tracing::error!("{}", e);
                }
            })?;

        let mut status = ServerStatus::new(name);
        status.transition(ServerState::Starting);
        {
            let mut entries = self.connections.entries.write().await;
            if entries.contains_key(name) {
                drop(entries);
                let _ = launched.session.close().await;
                let mut process = launched.process;
                process.terminate().await;
                return Err(HostError::AlreadyConnected(name.to_string()));
            }
            entries.insert(
                name.to_string(),
                ServerConnection {
                    launch_id,
                    session: launched.session,
                    process: launched.process,
                    status,
                    policy: config.security_policy.clone(),
                },
            );
        }

        self.discover_tools(name, DISCOVERY_ATTEMPTS).await?;

        let mut entries = self.connections.entries.write().await;
        let conn = entries
            .get_mut(name)
            .filter(|c| c.launch_id == launch_id)
            .ok_or_else(|| HostError::Protocol {
                server: name.to_string(),
                reason: "process exited during startup".to_string(),
            })?;
        conn.status.transition(ServerState::Running);
        tracing::info!(
            "MCP server started: {} ({} tools)",
            name,
            conn.status.discovered_tools.len()
        );
        Ok(conn.status.clone())
    }

    /// Close the session and kill the process
    pub async fn disconnect(&self, name: &str) -> HostResult<()> {
        let mut conn = self
            .connections
            .entries
            .write()
            .await
            .remove(name)
            .ok_or_else(|| HostError::NotConnected(name.to_string()))?;

        tracing::info!("Stopping MCP server: {}", name);
        if let Err(e) = conn.session.close().await {
            tracing::warn!("Error closing MCP server {}: {}", name, e);
        }
        conn.process.terminate().await;
        Ok(())
    }

    /// List a server's tools, retrying with a fixed delay
    ///
    /// Exhausting all attempts yields an empty list; the server stays up.
    pub async fn discover_tools(&self, name: &str, attempts: u32) -> HostResult<Vec<McpTool>> {
        let session = self.session(name).await?;
        let attempts = attempts.max(1);

        for attempt in 1..=attempts {
            match session.list_tools().await {
                Ok(tools) => {
                    let tools: Vec<McpTool> = tools
                        .into_iter()
                        .map(|t| McpTool {
                            server: name.to_string(),
                            ..t
                        })
                        .collect();
                    tracing::debug!("Discovered {} tools from {}", tools.len(), name);
                    if let Some(conn) = self.connections.entries.write().await.get_mut(name) {
                        conn.status.discovered_tools = tools.clone();
                    }
                    return Ok(tools);
                }
                Err(e) => {
                    tracing::warn!(
                        "Tool discovery for {} failed (attempt {}/{}): {}",
                        name,
                        attempt,
                        attempts,
                        e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(DISCOVERY_RETRY_DELAY).await;
                    }
                }
            }
        }

        tracing::warn!("Giving up on tool discovery for {}; continuing with no tools", name);
        Ok(Vec::new())
    }

    /// Validate arguments and call a tool on a connected server
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> HostResult<CallToolResult> {
        let (session, schema, policy) = {
            let entries = self.connections.entries.read().await;
            let conn = entries
                .get(server)
                .ok_or_else(|| HostError::NotConnected(server.to_string()))?;
            if conn.status.state != ServerState::Running {
                return Err(HostError::NotRunning {
                    server: server.to_string(),
                    state: conn.status.state,
                });
            }
            let schema = conn
                .status
                .discovered_tools
                .iter()
                .find(|t| t.name == tool)
                .and_then(|t| t.input_schema.clone());
            (conn.session.clone(), schema, conn.policy.clone())
        };

        let id = tool_id(server, tool);
        let validation = self.security.validate_tool_input(&id, schema.as_ref(), &args);
        for warning in &validation.warnings {
            tracing::warn!("{}", warning);
        }
        if !validation.valid {
            return Err(HostError::InvalidInput {
                tool: id,
                errors: validation.errors,
            });
        }

        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => None,
            _ => {
                return Err(HostError::InvalidInput {
                    tool: id,
                    errors: vec!["arguments must be a JSON object".to_string()],
                })
            }
        };

        let timeout = self
            .security
            .effective_timeout(timeout, policy.as_ref(), DEFAULT_TOOL_TIMEOUT);
        tracing::debug!("Calling {} (timeout {:?})", id, timeout);
        session.call_tool(tool, arguments, timeout).await
    }

    /// Disconnect every server
    pub async fn cleanup(&self) {
        for name in self.connected_servers().await {
            if let Err(e) = self.disconnect(&name).await {
                tracing::warn!("Error disconnecting {}: {}", name, e);
            }
        }
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.connections.entries.read().await.contains_key(name)
    }

    pub async fn connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Connection status, if connected
    pub async fn status(&self, name: &str) -> Option<ServerStatus> {
        self.connections
            .entries
            .read()
            .await
            .get(name)
            .map(|c| c.status.clone())
    }

    /// Cached tools of a connected server
    pub async fn tools(&self, name: &str) -> Vec<McpTool> {
        self.status(name)
            .await
            .map(|s| s.discovered_tools)
            .unwrap_or_default()
    }

    async fn session(&self, name: &str) -> HostResult<Arc<dyn McpSession>> {
        self.connections
            .entries
            .read()
            .await
            .get(name)
            .map(|c| c.session.clone())
            .ok_or_else(|| HostError::NotConnected(name.to_string()))
    }
}
