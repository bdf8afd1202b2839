//! Error types for the MCP host
//!
//! Every fallible library operation returns [`HostResult`]. Messages always
//! name the server, tool or command involved so that they can be surfaced to
//! users as-is.

use thiserror::Error;

use crate::mcp::ServerState;

/// Result alias used across the crate
pub type HostResult<T> = Result<T, HostError>;

#[derive(Error, Debug)]
pub enum HostError {
    /// Configuration rejected by manager-level checks or the security policy
    #[error("Configuration for server '{server}' rejected: {}", .errors.join("; "))]
    InvalidConfig { server: String, errors: Vec<String> },

    #[error("Server '{0}' is not configured")]
    ServerNotFound(String),

    #[error("Server '{0}' is already configured")]
    DuplicateServer(String),

    #[error("Server '{0}' is disabled")]
    ServerDisabled(String),

    #[error("Server '{0}' is not connected")]
    NotConnected(String),

    #[error("Server '{0}' is already connected")]
    AlreadyConnected(String),

    #[error("Server '{server}' is {state}, not running")]
    NotRunning { server: String, state: ServerState },

    /// A lifecycle operation was requested from a state that does not allow it
    #[error("Server '{server}' cannot move from {from} to {to}")]
    IllegalTransition {
        server: String,
        from: ServerState,
        to: ServerState,
    },

    #[error("Server '{server}' uses placeholder command '{command}' which cannot speak MCP")]
    PlaceholderCommand { server: String, command: String },

    #[error("Failed to spawn server '{server}' ({command}): {reason}{}", .hint.as_deref().map(|h| format!(". Hint: {h}")).unwrap_or_default())]
    Spawn {
        server: String,
        command: String,
        reason: String,
        hint: Option<String>,
    },

    #[error("Protocol error from server '{server}': {reason}")]
    Protocol { server: String, reason: String },

    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("Input for tool '{tool}' rejected: {}", .errors.join("; "))]
    InvalidInput { tool: String, errors: Vec<String> },

    #[error("Unknown tool: {0}")]
    ToolNotFound(String),

    #[error("Tool call '{0}' was denied by the user")]
    ConfirmationDenied(String),

    #[error("Tool call '{0}' was not confirmed in time")]
    ConfirmationTimeout(String),

    #[error("Tool '{tool}' failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HostError {
    /// Build a spawn error, attaching a remediation hint when the command is missing
    pub fn spawn(server: &str, command: &str, err: &std::io::Error) -> Self {
        let hint = (err.kind() == std::io::ErrorKind::NotFound).then(|| {
            format!(
                "command '{}' was not found; install it or add its directory to PATH \
                 (npx/node need Node.js, uvx needs uv)",
                command
            )
        });
        HostError::Spawn {
            server: server.to_string(),
            command: command.to_string(),
            reason: err.to_string(),
            hint,
        }
    }

    /// Whether this is a "command not found" spawn failure
    pub fn is_command_not_found(&self) -> bool {
        matches!(self, HostError::Spawn { hint: Some(_), .. })
    }
}
