//! MCP (Model Context Protocol) client side
//!
//! Spawns capability servers, keeps their sessions open and tracks their
//! lifecycle state.

mod client;
mod session;
mod spawn;
mod types;

pub use client::{ProtocolClient, DEFAULT_TOOL_TIMEOUT, DISCOVERY_ATTEMPTS, DISCOVERY_RETRY_DELAY};
pub use session::{McpSession, RmcpSession};
pub use spawn::{
    forwarded_environment, is_placeholder_command, resolve_command, LaunchSpec, Launched, Launcher,
    ProcessEventSender, ProcessHandle, StdioLauncher, FORWARDED_ENV_VARS,
};
pub use types::{tool_id, McpTool, ProcessEvent, ProcessNotice, ServerState, ServerStatus, StatusChange};
