//! Unified tool registry
//!
//! One flat, id-keyed namespace over built-in tools (bare ids) and tools
//! discovered on connected servers (`server:tool` ids). Every call returns a
//! [`ToolOutcome`]; failures never escape as errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{CallToolResult, RawContent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::builtin::{default_builtins, BuiltInTool};
use super::schema::sanitize_schema;
use crate::confirm::{is_destructive_tool, ConfirmationBroker};
use crate::error::{HostError, HostResult};
use crate::mcp::{McpTool, ProtocolClient, DEFAULT_TOOL_TIMEOUT};
use crate::security::SecurityPolicy;

/// Where a tool comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOrigin {
    #[serde(rename = "builtin")]
    BuiltIn,
    External,
}

/// Tool description handed to the calling agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub origin: ToolOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_server: Option<String>,
}

/// Result envelope of every tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolOutcome {
    Success { data: Value },
    Error { error: String },
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success { .. })
    }
}

#[derive(Clone)]
enum ToolHandler {
    BuiltIn(Arc<dyn BuiltInTool>),
    External { server: String, name: String },
}

#[derive(Clone)]
struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: ToolHandler,
}

impl RegisteredTool {
    fn external(tool: &McpTool) -> Self {
        let input_schema = tool
            .input_schema
            .as_ref()
            .map(sanitize_schema)
            .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
        Self {
            descriptor: ToolDescriptor {
                id: tool.id(),
                name: tool.name.clone(),
                description: tool.description.clone().unwrap_or_default(),
                input_schema,
                origin: ToolOrigin::External,
                source_server: Some(tool.server.clone()),
            },
            handler: ToolHandler::External {
                server: tool.server.clone(),
                name: tool.name.clone(),
            },
        }
    }

    fn is_from(&self, server: &str) -> bool {
        matches!(&self.handler, ToolHandler::External { server: s, .. } if s == server)
    }
}

pub struct UnifiedToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    client: Arc<ProtocolClient>,
    security: Arc<SecurityPolicy>,
    confirmations: Option<Arc<ConfirmationBroker>>,
}

impl UnifiedToolRegistry {
    /// Registry with the default built-in tools
    pub fn new(client: Arc<ProtocolClient>) -> Self {
        Self::with_builtins(client, default_builtins())
    }

    pub fn with_builtins(client: Arc<ProtocolClient>, builtins: Vec<Box<dyn BuiltInTool>>) -> Self {
        let tools = builtins
            .into_iter()
            .map(|tool| {
                let tool: Arc<dyn BuiltInTool> = Arc::from(tool);
                let descriptor = ToolDescriptor {
                    id: tool.name().to_string(),
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    input_schema: tool.input_schema(),
                    origin: ToolOrigin::BuiltIn,
                    source_server: None,
                };
                (
                    descriptor.id.clone(),
                    RegisteredTool {
                        descriptor,
                        handler: ToolHandler::BuiltIn(tool),
                    },
                )
            })
            .collect();

        Self {
            tools: RwLock::new(tools),
            security: client.security().clone(),
            client,
            confirmations: None,
        }
    }

    /// Route destructive-looking calls through `broker` when confirmation is required
    pub fn with_confirmation_broker(mut self, broker: Arc<ConfirmationBroker>) -> Self {
        self.confirmations = Some(broker);
        self
    }

    /// Replace every tool of `server` with its current tool list
    pub async fn update_tools_for_server(&self, server: &str) -> usize {
        let fresh: Vec<RegisteredTool> = self
            .client
            .tools(server)
            .await
            .iter()
            .map(RegisteredTool::external)
            .collect();
        let count = fresh.len();

        let mut tools = self.tools.write().await;
        tools.retain(|_, tool| !tool.is_from(server));
        for tool in fresh {
            tools.insert(tool.descriptor.id.clone(), tool);
        }
        tracing::info!(server = %server, tools = count, "Registered server tools");
        count
    }

    /// Drop every tool owned by `server`
    pub async fn remove_tools_for_server(&self, server: &str) -> usize {
        let mut tools = self.tools.write().await;
        let before = tools.len();
        tools.retain(|_, tool| !tool.is_from(server));
        let removed = before - tools.len();
        if removed > 0 {
            tracing::info!(server = %server, tools = removed, "Removed server tools");
        }
        removed
    }

    /// All tools, sorted by id
    pub async fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.descriptor.clone())
            .collect();
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        tools
    }

    pub async fn get_tool(&self, id: &str) -> Option<ToolDescriptor> {
        self.tools.read().await.get(id).map(|t| t.descriptor.clone())
    }

    /// Single dispatch point for the calling agent
    pub async fn call_tool(&self, id: &str, args: Value, timeout: Option<Duration>) -> ToolOutcome {
        let tool = self.tools.read().await.get(id).cloned();
        let Some(tool) = tool else {
            tracing::warn!(tool = %id, "Call to unknown tool");
            return ToolOutcome::Error {
                error: HostError::ToolNotFound(id.to_string()).to_string(),
            };
        };

        match self.dispatch(&tool, args, timeout).await {
            Ok(data) => ToolOutcome::Success { data },
            Err(e) => {
                tracing::warn!(tool = %id, "Tool call failed: {}", e);
                ToolOutcome::Error { error: e.to_string() }
            }
        }
    }

    async fn dispatch(&self, tool: &RegisteredTool, args: Value, timeout: Option<Duration>) -> HostResult<Value> {
        let id = tool.descriptor.id.as_str();
        let args = if args.is_null() { json!({}) } else { args };

        if self.security.security_config().require_confirmation && is_destructive_tool(&tool.descriptor.name) {
            let broker = self
                .confirmations
                .as_ref()
                .ok_or_else(|| HostError::ConfirmationDenied(id.to_string()))?;
            let wait = self.security.effective_timeout(timeout, None, DEFAULT_TOOL_TIMEOUT);
            broker.request(id, &args, wait).await?;
        }

        match &tool.handler {
            ToolHandler::BuiltIn(builtin) => {
                let validation =
                    self.security
                        .validate_tool_input(id, Some(&tool.descriptor.input_schema), &args);
                if !validation.valid {
                    return Err(HostError::InvalidInput {
                        tool: id.to_string(),
                        errors: validation.errors,
                    });
                }
                let timeout = self.security.effective_timeout(timeout, None, DEFAULT_TOOL_TIMEOUT);
                tokio::time::timeout(timeout, builtin.execute(args))
                    .await
                    .map_err(|_| HostError::Timeout {
                        tool: id.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })?
            }
            ToolHandler::External { server, name } => {
                let result = self.client.invoke(server, name, args, timeout).await?;
                external_result(id, result)
            }
        }
    }
}

/// Pass a server's result through, turning its error results into failures
fn external_result(id: &str, result: CallToolResult) -> HostResult<Value> {
    if result.is_error == Some(true) {
        let reason = result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        return Err(HostError::ToolFailed {
            tool: id.to_string(),
            reason: if reason.is_empty() {
                "server reported an error".to_string()
            } else {
                reason
            },
        });
    }
    Ok(serde_json::to_value(&result)?)
}
