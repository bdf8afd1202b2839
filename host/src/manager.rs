//! Server lifecycle manager
//!
//! The authoritative registry of server configurations and their statuses,
//! and the only component that decides when a server starts or stops.
//! [`ServerManager`] is a cheap handle; clones share the same state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde::Serialize;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::error::{HostError, HostResult};
use crate::mcp::{ProtocolClient, ServerState, ServerStatus, StatusChange};
use crate::security::{SecurityPolicy, ValidationResult};
use crate::tools::UnifiedToolRegistry;

/// Receives the full server list after every persisted change
pub trait SettingsSink: Send + Sync {
    fn on_settings_change(&self, configs: &[ServerConfig]);
}

/// Server counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStatistics {
    pub total: usize,
    pub enabled: usize,
    pub running: usize,
    pub stopped: usize,
    pub error: usize,
}

struct Inner {
    configs: RwLock<BTreeMap<String, ServerConfig>>,
    statuses: RwLock<HashMap<String, ServerStatus>>,
    client: Arc<ProtocolClient>,
    registry: Arc<UnifiedToolRegistry>,
    security: Arc<SecurityPolicy>,
    settings: RwLock<Option<Arc<dyn SettingsSink>>>,
    /// Serializes start, stop, update and removal per server name
    lifecycle: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

#[derive(Clone)]
pub struct ServerManager {
    inner: Arc<Inner>,
}

impl ServerManager {
    /// Must be called inside a tokio runtime
    pub fn new(client: Arc<ProtocolClient>, registry: Arc<UnifiedToolRegistry>) -> Self {
        let inner = Arc::new(Inner {
            configs: RwLock::new(BTreeMap::new()),
            statuses: RwLock::new(HashMap::new()),
            security: client.security().clone(),
            client,
            registry,
            settings: RwLock::new(None),
            lifecycle: std::sync::Mutex::new(HashMap::new()),
        });

        let changes = inner.client.subscribe();
        tokio::spawn(watch_status_changes(Arc::downgrade(&inner), changes));

        Self { inner }
    }

    pub fn set_settings_sink(&self, sink: Arc<dyn SettingsSink>) {
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    // ========================================================================
    // Configuration CRUD
    // ========================================================================

    /// Validate and register a new server in the `stopped` state
    pub fn add_server(&self, config: ServerConfig) -> HostResult<()> {
        self.validate(&config)?;

        {
            let mut configs = self.write_configs();
            if configs.contains_key(&config.name) {
                return Err(HostError::DuplicateServer(config.name));
            }
            self.write_statuses()
                .insert(config.name.clone(), ServerStatus::new(&config.name));
            tracing::info!(server = %config.name, "Added server");
            configs.insert(config.name.clone(), config);
        }

        self.notify_settings_change();
        Ok(())
    }

    /// Replace the configuration of `name`
    ///
    /// The server may be renamed when the new name is free. A running server
    /// is restarted with the new configuration if it is still enabled, and
    /// stopped otherwise.
    pub async fn update_server(&self, name: &str, config: ServerConfig) -> HostResult<()> {
        self.validate(&config)?;
        let _guards = self.lock_servers([name, config.name.as_str()]).await;
        self.config(name)?;
        if config.name != name && self.read_configs().contains_key(&config.name) {
            return Err(HostError::DuplicateServer(config.name));
        }

        let was_connected = self.inner.client.is_connected(name).await;
        if was_connected {
            self.stop_locked(name).await?;
        }

        {
            let mut configs = self.write_configs();
            let mut statuses = self.write_statuses();
            configs.remove(name);
            let mut status = statuses
                .remove(name)
                .unwrap_or_else(|| ServerStatus::new(name));
            status.name = config.name.clone();
            statuses.insert(config.name.clone(), status);
            configs.insert(config.name.clone(), config.clone());
        }
        tracing::info!(server = %name, "Updated server");
        self.notify_settings_change();

        if was_connected && config.enabled {
            self.start_locked(&config.name).await?;
        }
        Ok(())
    }

    /// Stop the server if needed, then forget it
    pub async fn remove_server(&self, name: &str) -> HostResult<()> {
        let _guard = self.lock_server(name).await;
        self.config(name)?;

        if self.inner.client.is_connected(name).await {
            if let Err(e) = self.stop_locked(name).await {
                tracing::warn!(server = %name, "Error stopping server before removal: {}", e);
            }
        }
        self.inner.registry.remove_tools_for_server(name).await;

        self.write_configs().remove(name);
        self.write_statuses().remove(name);
        tracing::info!(server = %name, "Removed server");
        self.notify_settings_change();
        Ok(())
    }

    /// Flip the `enabled` flag and start or stop the server in the background
    ///
    /// The background task waits for any lifecycle operation already running
    /// on the server, then brings it in line with the flag. Failures are
    /// logged.
    pub fn set_server_enabled(&self, name: &str, enabled: bool) -> HostResult<JoinHandle<()>> {
        {
            let mut configs = self.write_configs();
            let config = configs
                .get_mut(name)
                .ok_or_else(|| HostError::ServerNotFound(name.to_string()))?;
            config.enabled = enabled;
        }
        tracing::info!(server = %name, enabled, "Server enabled flag changed");
        self.notify_settings_change();

        let manager = self.clone();
        let name = name.to_string();
        Ok(tokio::spawn(async move { manager.apply_enabled_flag(&name).await }))
    }

    async fn apply_enabled_flag(&self, name: &str) {
        let _guard = self.lock_server(name).await;
        let Some(config) = self.get_server_config(name) else {
            return;
        };
        let connected = self.inner.client.is_connected(name).await;

        if config.enabled && !connected {
            if let Err(e) = self.start_locked(name).await {
                tracing::error!(server = %name, "Background start failed: {}", e);
            }
        } else if !config.enabled && connected {
            if let Err(e) = self.stop_locked(name).await {
                tracing::error!(server = %name, "Background stop failed: {}", e);
            }
        }
    }

    /// Replace every configuration without notifying the settings sink
    ///
    /// Connected servers are stopped first. Invalid configurations are
    /// skipped and returned with their errors.
    pub async fn load_server_configurations(&self, configs: Vec<ServerConfig>) -> Vec<(String, HostError)> {
        let names: Vec<String> = self.read_configs().keys().cloned().collect();
        let _guards = self.lock_servers(names.iter().map(String::as_str)).await;
        for name in &names {
            if self.inner.client.is_connected(name).await {
                if let Err(e) = self.stop_locked(name).await {
                    tracing::warn!(server = %name, "Error stopping server before reload: {}", e);
                }
            }
        }
        self.replace_configurations(configs)
    }

    /// Bulk replace for a manager with no connected servers
    pub(crate) fn replace_configurations(&self, configs: Vec<ServerConfig>) -> Vec<(String, HostError)> {
        let mut accepted = BTreeMap::new();
        let mut rejected = Vec::new();

        for config in configs {
            if accepted.contains_key(&config.name) {
                rejected.push((config.name.clone(), HostError::DuplicateServer(config.name)));
                continue;
            }
            match self.validate(&config) {
                Ok(()) => {
                    accepted.insert(config.name.clone(), config);
                }
                Err(e) => {
                    tracing::warn!(server = %config.name, "Skipping server configuration: {}", e);
                    rejected.push((config.name, e));
                }
            }
        }

        let statuses = accepted
            .keys()
            .map(|name| (name.clone(), ServerStatus::new(name)))
            .collect();
        tracing::info!("Loaded {} server configurations", accepted.len());
        *self.write_configs() = accepted;
        *self.write_statuses() = statuses;
        rejected
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn start_server(&self, name: &str) -> HostResult<ServerStatus> {
        let _guard = self.lock_server(name).await;
        self.start_locked(name).await
    }

    /// Stop a server; a server that is not connected is left as is
    pub async fn stop_server(&self, name: &str) -> HostResult<ServerStatus> {
        let _guard = self.lock_server(name).await;
        self.stop_locked(name).await
    }

    pub async fn restart_server(&self, name: &str) -> HostResult<ServerStatus> {
        let _guard = self.lock_server(name).await;
        self.stop_locked(name).await?;
        self.start_locked(name).await
    }

    async fn start_locked(&self, name: &str) -> HostResult<ServerStatus> {
        let config = self.config(name)?;
        if !config.enabled {
            return Err(HostError::ServerDisabled(name.to_string()));
        }

        {
            let mut statuses = self.write_statuses();
            let status = statuses
                .get_mut(name)
                .ok_or_else(|| HostError::ServerNotFound(name.to_string()))?;
            if status.state == ServerState::Running {
                return Err(HostError::AlreadyConnected(name.to_string()));
            }
            let from = status.state;
            if !status.transition(ServerState::Starting) {
                return Err(HostError::IllegalTransition {
                    server: name.to_string(),
                    from,
                    to: ServerState::Starting,
                });
            }
        }

        match self.inner.client.connect(&config).await {
            Ok(status) => {
                let known = match self.write_statuses().get_mut(name) {
                    Some(current) => {
                        *current = status.clone();
                        true
                    }
                    None => false,
                };
                if !known {
                    tracing::warn!(server = %name, "Server was removed while starting; stopping it");
                    if let Err(e) = self.inner.client.disconnect(name).await {
                        tracing::warn!(server = %name, "Error stopping removed server: {}", e);
                    }
                    return Err(HostError::ServerNotFound(name.to_string()));
                }
                self.inner.registry.update_tools_for_server(name).await;
                Ok(status)
            }
            Err(e) => {
                tracing::error!(server = %name, "Failed to start server: {}", e);
                if let Some(status) = self.write_statuses().get_mut(name) {
                    if status.state == ServerState::Starting {
                        status.fail(e.to_string());
                    } else {
                        status.last_error = Some(e.to_string());
                    }
                }
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, name: &str) -> HostResult<ServerStatus> {
        self.config(name)?;
        if !self.inner.client.is_connected(name).await {
            tracing::debug!(server = %name, "Stop requested for server that is not connected");
            return self.status(name);
        }

        if let Some(status) = self.write_statuses().get_mut(name) {
            status.transition(ServerState::Stopping);
        }

        let result = self.inner.client.disconnect(name).await;
        self.inner.registry.remove_tools_for_server(name).await;

        let mut statuses = self.write_statuses();
        let status = statuses
            .get_mut(name)
            .ok_or_else(|| HostError::ServerNotFound(name.to_string()))?;
        if status.state != ServerState::Stopped {
            status.transition(ServerState::Stopped);
        }
        match result {
            Ok(()) => {
                tracing::info!(server = %name, "Server stopped");
                Ok(status.clone())
            }
            Err(e) => {
                status.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Start every enabled server that is not connected, one at a time
    pub async fn start_all_enabled_servers(&self) -> Vec<(String, HostError)> {
        let names: Vec<String> = self
            .read_configs()
            .values()
            .filter(|c| c.enabled)
            .map(|c| c.name.clone())
            .collect();

        let mut failures = Vec::new();
        for name in names {
            if self.inner.client.is_connected(&name).await {
                continue;
            }
            if let Err(e) = self.start_server(&name).await {
                tracing::warn!(server = %name, "Could not start server: {}", e);
                failures.push((name, e));
            }
        }
        failures
    }

    /// Stop every connected server, one at a time
    pub async fn stop_all_servers(&self) -> Vec<(String, HostError)> {
        let mut failures = Vec::new();
        for name in self.inner.client.connected_servers().await {
            if let Err(e) = self.stop_server(&name).await {
                tracing::warn!(server = %name, "Could not stop server: {}", e);
                failures.push((name, e));
            }
        }
        failures
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Configurations sorted by name
    pub fn get_all_server_configs(&self) -> Vec<ServerConfig> {
        self.read_configs().values().cloned().collect()
    }

    /// Statuses sorted by name
    pub fn get_all_server_statuses(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<ServerStatus> = self
            .inner
            .statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn get_server_statistics(&self) -> ServerStatistics {
        let configs = self.read_configs();
        let statuses = self
            .inner
            .statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut stats = ServerStatistics {
            total: configs.len(),
            enabled: configs.values().filter(|c| c.enabled).count(),
            ..Default::default()
        };
        for status in statuses.values() {
            match status.state {
                ServerState::Running => stats.running += 1,
                ServerState::Stopped => stats.stopped += 1,
                ServerState::Error => stats.error += 1,
                ServerState::Starting | ServerState::Stopping => {}
            }
        }
        stats
    }

    pub fn get_server_config(&self, name: &str) -> Option<ServerConfig> {
        self.read_configs().get(name).cloned()
    }

    pub fn get_server_status(&self, name: &str) -> Option<ServerStatus> {
        self.inner
            .statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn registry(&self) -> &Arc<UnifiedToolRegistry> {
        &self.inner.registry
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn validate(&self, config: &ServerConfig) -> HostResult<()> {
        let mut result = ValidationResult::ok();
        if config.name.trim().is_empty() {
            result.error("Server name must not be empty");
        }
        if config.name.contains(':') {
            result.error(format!("Server name '{}' must not contain ':'", config.name));
        }
        if config.command.trim().is_empty() {
            result.error("Server command must not be empty");
        }
        result.merge(self.inner.security.validate_server_config(config));

        for warning in &result.warnings {
            tracing::warn!(server = %config.name, "{}", warning);
        }
        if result.valid {
            Ok(())
        } else {
            Err(HostError::InvalidConfig {
                server: config.name.clone(),
                errors: result.errors,
            })
        }
    }

    fn config(&self, name: &str) -> HostResult<ServerConfig> {
        self.get_server_config(name)
            .ok_or_else(|| HostError::ServerNotFound(name.to_string()))
    }

    fn status(&self, name: &str) -> HostResult<ServerStatus> {
        self.get_server_status(name)
            .ok_or_else(|| HostError::ServerNotFound(name.to_string()))
    }

    async fn lock_server(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Lock several servers, always in name order
    async fn lock_servers<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<OwnedMutexGuard<()>> {
        let names: BTreeSet<&str> = names.into_iter().collect();
        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            guards.push(self.lock_server(name).await);
        }
        guards
    }

    fn notify_settings_change(&self) {
        let sink = self
            .inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            sink.on_settings_change(&self.get_all_server_configs());
        }
    }

    fn read_configs(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ServerConfig>> {
        self.inner.configs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_configs(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, ServerConfig>> {
        self.inner.configs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_statuses(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ServerStatus>> {
        self.inner.statuses.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Apply process exits and failures reported by the protocol client
async fn watch_status_changes(inner: Weak<Inner>, mut changes: broadcast::Receiver<StatusChange>) {
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Missed {} server status changes", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        {
            let mut statuses = inner.statuses.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(status) = statuses.get_mut(&change.server) {
                match (&change.state, &change.error) {
                    (ServerState::Error, Some(error)) => {
                        status.fail(error.clone());
                    }
                    (state, _) => {
                        status.transition(*state);
                    }
                }
            }
        }
        inner.registry.remove_tools_for_server(&change.server).await;
    }
}
