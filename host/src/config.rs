//! Configuration loading
//!
//! Host settings live in a versioned TOML file (`.mcp-host.toml`):
//!
//! ```toml
//! version = 1
//!
//! [security]
//! allowed_commands = ["npx", "uvx"]
//! max_calls_per_minute = 30
//!
//! [[servers]]
//! name = "time"
//! command = "uvx"
//! args = ["mcp-server-time"]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};
use crate::manager::SettingsSink;

/// Settings file name searched for on startup
pub const SETTINGS_FILE_NAME: &str = ".mcp-host.toml";

/// The only settings schema version this build understands
pub const SETTINGS_VERSION: u32 = 1;

/// Find a config file by walking up the directory tree, then checking global config.
///
/// Search order:
/// 1. Current directory and parent directories (walking up to root)
/// 2. Global config at ~/.config/mcp-host/
pub fn find_config_file(filename: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let candidate = current.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("mcp-host").join(filename);
        if global_path.exists() {
            return Some(global_path);
        }
    }

    None
}

// ============================================================================
// Server configuration
// ============================================================================

/// Configuration of one capability server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Unique server name, also the prefix of its tool ids
    pub name: String,
    /// Launch command (bare name or path)
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_policy: Option<ServerSecurityPolicy>,
}

fn default_enabled() -> bool {
    true
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
            enabled: true,
            security_policy: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_security_policy(mut self, policy: ServerSecurityPolicy) -> Self {
        self.security_policy = Some(policy);
        self
    }

    /// Working directory with `~` expanded
    pub fn expanded_working_directory(&self) -> Option<PathBuf> {
        self.working_directory
            .as_deref()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).as_ref()))
    }
}

/// Per-server security policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSecurityPolicy {
    /// Auxiliary commands the server may need (each must also be globally allowed)
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Default tool call timeout for this server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub sandboxed: bool,
}

// ============================================================================
// Security configuration
// ============================================================================

/// Host-wide security configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    /// Launch commands that may be spawned (matched by name or basename)
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    /// Hosts URL arguments may point at (empty = no domain check)
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Hard cap for any tool call timeout
    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_max_memory")]
    pub max_memory_mb: u64,
    #[serde(default)]
    pub enable_sandboxing: bool,
    /// Ask the confirmation UI before running destructive tools
    #[serde(default)]
    pub require_confirmation: bool,
    #[serde(default = "default_calls_per_minute")]
    pub max_calls_per_minute: u32,
    #[serde(default = "default_calls_per_hour")]
    pub max_calls_per_hour: u32,
}

fn default_allowed_commands() -> Vec<String> {
    ["node", "npx", "python", "python3", "uv", "uvx", "deno", "bun", "docker"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn default_max_timeout() -> u64 {
    300
}

fn default_max_memory() -> u64 {
    2048
}

fn default_calls_per_minute() -> u32 {
    60
}

fn default_calls_per_hour() -> u32 {
    1000
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
            allowed_domains: Vec::new(),
            max_timeout_secs: default_max_timeout(),
            max_memory_mb: default_max_memory(),
            enable_sandboxing: false,
            require_confirmation: false,
            max_calls_per_minute: default_calls_per_minute(),
            max_calls_per_hour: default_calls_per_hour(),
        }
    }
}

// ============================================================================
// Settings file
// ============================================================================

/// Top-level settings (from .mcp-host.toml)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSettings {
    pub version: u32,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            security: SecurityConfig::default(),
            servers: Vec::new(),
        }
    }
}

impl HostSettings {
    /// Load settings from .mcp-host.toml
    ///
    /// Returns the path the settings came from, or `None` when no file exists.
    pub fn load() -> HostResult<Option<(PathBuf, Self)>> {
        if let Some(path) = find_config_file(SETTINGS_FILE_NAME) {
            tracing::debug!("Loading settings from: {}", path.display());
            let settings = Self::load_from_path(&path)?;
            return Ok(Some((path, settings)));
        }

        tracing::debug!("No {} found", SETTINGS_FILE_NAME);
        Ok(None)
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> HostResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse settings, rejecting unknown schema versions
    pub fn from_toml_str(content: &str) -> HostResult<Self> {
        let settings: HostSettings =
            toml::from_str(content).map_err(|e| HostError::Settings(e.to_string()))?;
        if settings.version != SETTINGS_VERSION {
            return Err(HostError::Settings(format!(
                "unsupported settings version {} (expected {})",
                settings.version, SETTINGS_VERSION
            )));
        }
        Ok(settings)
    }

    pub fn to_toml_string(&self) -> HostResult<String> {
        toml::to_string_pretty(self).map_err(|e| HostError::Settings(e.to_string()))
    }

    /// Write settings to a specific path
    pub fn save_to_path(&self, path: &Path) -> HostResult<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}

/// Persists server configuration changes back into a settings file
pub struct TomlSettingsFile {
    path: PathBuf,
    settings: Mutex<HostSettings>,
}

impl TomlSettingsFile {
    pub fn new(path: impl Into<PathBuf>, settings: HostSettings) -> Self {
        Self {
            path: path.into(),
            settings: Mutex::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsSink for TomlSettingsFile {
    fn on_settings_change(&self, configs: &[ServerConfig]) {
        let mut settings = self
            .settings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        settings.servers = configs.to_vec();

        match settings.save_to_path(&self.path) {
            Ok(()) => tracing::debug!(
                "Saved {} server configs to {}",
                configs.len(),
                self.path.display()
            ),
            Err(e) => tracing::warn!("Failed to save settings to {}: {}", self.path.display(), e),
        }
    }
}
