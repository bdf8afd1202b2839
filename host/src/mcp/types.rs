//! MCP type definitions
//!
//! Shared types used by the protocol client, the lifecycle manager and the
//! tool registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool from an MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    /// Server this tool belongs to
    pub server: String,
    /// Tool name
    pub name: String,
    /// Tool description
    pub description: Option<String>,
    /// Input schema (JSON)
    pub input_schema: Option<Value>,
}

impl McpTool {
    /// Unified registry id (`server:tool`)
    pub fn id(&self) -> String {
        tool_id(&self.server, &self.name)
    }
}

/// Build the unified id of an external tool
pub fn tool_id(server: &str, tool: &str) -> String {
    format!("{}:{}", server, tool)
}

/// State of an MCP server
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Server not running
    Stopped,
    /// Process spawned, handshake or discovery in progress
    Starting,
    /// Server is running and connected
    Running,
    /// Server failed to start or crashed
    Error,
    /// Shutdown in progress
    Stopping,
}

impl ServerState {
    /// Whether moving from `self` to `next` is a legal lifecycle transition
    ///
    /// `stopped -> starting -> running -> stopping -> stopped`, with
    /// `starting`/`running` allowed to fail into `error` or drop to `stopped`
    /// on process exit. `error` only leaves via `starting`.
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Error)
                | (Running, Stopped)
                | (Stopping, Stopped)
                | (Error, Starting)
        )
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::Starting => write!(f, "starting"),
            ServerState::Running => write!(f, "running"),
            ServerState::Error => write!(f, "error"),
            ServerState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Status of a configured MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    pub last_error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub discovered_tools: Vec<McpTool>,
}

impl ServerStatus {
    /// Fresh status for a newly registered server
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ServerState::Stopped,
            last_error: None,
            start_time: None,
            discovered_tools: Vec::new(),
        }
    }

    /// Apply a guarded state transition
    ///
    /// Illegal transitions are logged and leave the status untouched.
    pub fn transition(&mut self, next: ServerState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                server = %self.name,
                from = %self.state,
                to = %next,
                "Ignoring illegal state transition"
            );
            return false;
        }

        self.state = next;
        match next {
            ServerState::Starting => self.last_error = None,
            ServerState::Running => {
                if self.start_time.is_none() {
                    self.start_time = Some(Utc::now());
                }
            }
            ServerState::Stopped | ServerState::Error => {
                self.start_time = None;
                self.discovered_tools.clear();
            }
            ServerState::Stopping => {}
        }
        true
    }

    /// Move to `error` and record the message
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        let applied = self.transition(ServerState::Error);
        if applied {
            self.last_error = Some(message.into());
        }
        applied
    }
}

/// Process-level notification from a spawned server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The process exited on its own
    Exited { code: Option<i32> },
    /// Waiting on the process failed
    Failed { reason: String },
}

/// A process event tagged with the launch it belongs to
///
/// `launch_id` tells a late notice from a previous process apart from one
/// about the server's current process.
#[derive(Debug, Clone)]
pub struct ProcessNotice {
    pub server: String,
    pub launch_id: u64,
    pub event: ProcessEvent,
}

/// Status change the protocol client observed without being asked
/// (process exit or failure)
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub server: String,
    pub state: ServerState,
    pub error: Option<String>,
}
