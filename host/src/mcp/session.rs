//! MCP session abstraction
//!
//! [`McpSession`] is the protocol seam between the client and a live server.
//! [`RmcpSession`] speaks MCP over a child's stdio using rmcp.

use std::time::Duration;

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult},
    service::RunningService,
    RoleClient,
};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::types::McpTool;
use crate::error::{HostError, HostResult};

/// A live protocol session with one capability server
#[async_trait]
pub trait McpSession: Send + Sync {
    /// Ask the server for its tool list
    async fn list_tools(&self) -> HostResult<Vec<McpTool>>;

    /// Call a tool and return the server's result unchanged
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
        timeout: Duration,
    ) -> HostResult<CallToolResult>;

    /// Close the session
    async fn close(&self) -> HostResult<()>;
}

/// rmcp-backed session
pub struct RmcpSession {
    server: String,
    service: RwLock<Option<RunningService<RoleClient, ()>>>,
}

impl RmcpSession {
    pub fn new(server: impl Into<String>, service: RunningService<RoleClient, ()>) -> Self {
        Self {
            server: server.into(),
            service: RwLock::new(Some(service)),
        }
    }

    fn protocol_error(&self, reason: impl std::fmt::Display) -> HostError {
        HostError::Protocol {
            server: self.server.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl McpSession for RmcpSession {
    async fn list_tools(&self) -> HostResult<Vec<McpTool>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| HostError::NotConnected(self.server.clone()))?;

        let response = service
            .list_tools(Default::default())
            .await
            .map_err(|e| self.protocol_error(format!("failed to list tools: {}", e)))?;

        let tools = response
            .tools
            .into_iter()
            .map(|t| McpTool {
                server: self.server.clone(),
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()),
                input_schema: Some(serde_json::to_value(&t.input_schema).unwrap_or_default()),
            })
            .collect();

        Ok(tools)
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
        timeout: Duration,
    ) -> HostResult<CallToolResult> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| HostError::NotConnected(self.server.clone()))?;

        tokio::time::timeout(
            timeout,
            service.call_tool(CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments,
                task: None,
            }),
        )
        .await
        .map_err(|_| HostError::Timeout {
            tool: super::types::tool_id(&self.server, tool_name),
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| self.protocol_error(format!("failed to call tool '{}': {}", tool_name, e)))
    }

    async fn close(&self) -> HostResult<()> {
        let service = self.service.write().await.take();
        if let Some(service) = service {
            service
                .cancel()
                .await
                .map_err(|e| self.protocol_error(format!("failed to close session: {}", e)))?;
        }
        Ok(())
    }
}
