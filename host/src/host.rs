//! Host facade
//!
//! Wires the security policy, protocol client, tool registry, lifecycle
//! manager and confirmation broker together from [`HostSettings`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::{HostSettings, TomlSettingsFile};
use crate::confirm::ConfirmationBroker;
use crate::error::HostError;
use crate::manager::ServerManager;
use crate::mcp::{Launcher, ProtocolClient, StdioLauncher};
use crate::security::SecurityPolicy;
use crate::tools::{ToolDescriptor, ToolOutcome, UnifiedToolRegistry};

pub struct McpHost {
    security: Arc<SecurityPolicy>,
    client: Arc<ProtocolClient>,
    registry: Arc<UnifiedToolRegistry>,
    manager: ServerManager,
    confirmations: Arc<ConfirmationBroker>,
}

impl McpHost {
    /// Build a host that spawns real server processes
    ///
    /// Must be called inside a tokio runtime. Invalid server entries are
    /// skipped and returned alongside the host.
    pub fn new(settings: HostSettings) -> (Self, Vec<(String, HostError)>) {
        Self::with_launcher(settings, Arc::new(StdioLauncher))
    }

    pub fn with_launcher(settings: HostSettings, launcher: Arc<dyn Launcher>) -> (Self, Vec<(String, HostError)>) {
        let security = Arc::new(SecurityPolicy::new(settings.security));
        let client = Arc::new(ProtocolClient::new(security.clone(), launcher));
        let confirmations = Arc::new(ConfirmationBroker::new());
        let registry =
            Arc::new(UnifiedToolRegistry::new(client.clone()).with_confirmation_broker(confirmations.clone()));
        let manager = ServerManager::new(client.clone(), registry.clone());
        let rejected = manager.replace_configurations(settings.servers);

        let host = Self {
            security,
            client,
            registry,
            manager,
            confirmations,
        };
        (host, rejected)
    }

    /// Persist server changes back to `path`
    pub fn persist_to(&self, path: impl Into<PathBuf>) {
        let settings = HostSettings {
            security: self.security.security_config(),
            servers: self.manager.get_all_server_configs(),
            ..Default::default()
        };
        self.manager
            .set_settings_sink(Arc::new(TomlSettingsFile::new(path, settings)));
    }

    pub fn client(&self) -> &Arc<ProtocolClient> {
        &self.client
    }

    pub fn manager(&self) -> &ServerManager {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<UnifiedToolRegistry> {
        &self.registry
    }

    pub fn security(&self) -> &Arc<SecurityPolicy> {
        &self.security
    }

    pub fn confirmations(&self) -> &Arc<ConfirmationBroker> {
        &self.confirmations
    }

    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.registry.get_all_tools().await
    }

    pub async fn call_tool(&self, id: &str, args: Value, timeout: Option<Duration>) -> ToolOutcome {
        self.registry.call_tool(id, args, timeout).await
    }

    /// Stop every server and close every connection
    pub async fn shutdown(&self) {
        for (name, e) in self.manager.stop_all_servers().await {
            tracing::warn!(server = %name, "Error during shutdown: {}", e);
        }
        self.client.cleanup().await;
    }
}
