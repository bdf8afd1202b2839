//! MCP capability-server host
//!
//! Attaches, supervises and invokes tools exposed by external MCP servers,
//! enforcing a security policy before any command is spawned or any tool is
//! called, and merges them with built-in tools into one namespace.
//!
//! # Modules
//!
//! - [`security`] - Configuration and tool-input validation, rate limits, violation log
//! - [`mcp`] - Protocol client: spawning, sessions, lifecycle state
//! - [`manager`] - Server lifecycle manager
//! - [`tools`] - Unified tool registry and built-in tools
//! - [`confirm`] - Confirmation of destructive tool calls
//! - [`config`] - Settings file

pub mod config;
pub mod confirm;
pub mod error;
pub mod host;
pub mod logging;
pub mod manager;
pub mod mcp;
pub mod security;
pub mod tools;

pub use config::{HostSettings, SecurityConfig, ServerConfig, ServerSecurityPolicy};
pub use error::{HostError, HostResult};
pub use host::McpHost;
pub use manager::{ServerManager, ServerStatistics, SettingsSink};
pub use tools::{ToolDescriptor, ToolOutcome, UnifiedToolRegistry};
