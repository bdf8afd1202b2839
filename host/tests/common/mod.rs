//! In-memory launcher and session used by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{CallToolResult, Content};
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;

use mcp_host::mcp::{
    LaunchSpec, Launched, Launcher, McpSession, McpTool, ProcessEvent, ProcessEventSender, ProcessHandle,
    ProcessNotice,
};
use mcp_host::{HostError, HostResult, HostSettings, McpHost, SecurityConfig, ServerConfig};

pub fn tool(server: &str, name: &str) -> McpTool {
    McpTool {
        server: server.to_string(),
        name: name.to_string(),
        description: Some(format!("{} tool", name)),
        input_schema: Some(json!({ "type": "object", "properties": {} })),
    }
}

pub fn tool_with_schema(server: &str, name: &str, schema: Value) -> McpTool {
    McpTool {
        input_schema: Some(schema),
        ..tool(server, name)
    }
}

pub fn server(name: &str) -> ServerConfig {
    ServerConfig::new(name, "npx").with_args(vec!["-y".to_string(), format!("@example/{}-server", name)])
}

pub struct FakeSession {
    server: String,
    tools: Vec<McpTool>,
    failures_left: AtomicU32,
    fail_close: bool,
    pub list_attempts: Mutex<Vec<tokio::time::Instant>>,
    pub closed: AtomicBool,
}

#[async_trait]
impl McpSession for FakeSession {
    async fn list_tools(&self) -> HostResult<Vec<McpTool>> {
        self.list_attempts
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());

        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(HostError::Protocol {
                server: self.server.clone(),
                reason: "not ready".to_string(),
            });
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
        _timeout: Duration,
    ) -> HostResult<CallToolResult> {
        let args = Value::Object(arguments.unwrap_or_default());
        Ok(CallToolResult::success(vec![Content::text(format!(
            "{}/{} {}",
            self.server, tool_name, args
        ))]))
    }

    async fn close(&self) -> HostResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(HostError::Protocol {
                server: self.server.clone(),
                reason: "connection reset".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    tools: Mutex<HashMap<String, Vec<McpTool>>>,
    discovery_failures: Mutex<HashMap<String, u32>>,
    spawn_errors: Mutex<HashMap<String, std::io::ErrorKind>>,
    close_errors: Mutex<Vec<String>>,
    launch_delay: Mutex<Option<Duration>>,
    pub sessions: Mutex<HashMap<String, Arc<FakeSession>>>,
    pub kills: Mutex<HashMap<String, oneshot::Receiver<()>>>,
    pub specs: Mutex<Vec<LaunchSpec>>,
    pub launches: AtomicUsize,
    events: Mutex<Option<ProcessEventSender>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_tools(&self, server: &str, tools: Vec<McpTool>) {
        self.tools.lock().unwrap().insert(server.to_string(), tools);
    }

    pub fn fail_discovery(&self, server: &str, times: u32) {
        self.discovery_failures
            .lock()
            .unwrap()
            .insert(server.to_string(), times);
    }

    pub fn fail_spawn(&self, server: &str, kind: std::io::ErrorKind) {
        self.spawn_errors.lock().unwrap().insert(server.to_string(), kind);
    }

    pub fn fail_close(&self, server: &str) {
        self.close_errors.lock().unwrap().push(server.to_string());
    }

    /// Make every launch take `delay` before the process is up
    pub fn slow_launch(&self, delay: Duration) {
        *self.launch_delay.lock().unwrap() = Some(delay);
    }

    /// Launch ids handed to `server`, oldest first
    pub fn launch_ids(&self, server: &str) -> Vec<u64> {
        self.specs
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.server == server)
            .map(|s| s.launch_id)
            .collect()
    }

    pub fn session(&self, server: &str) -> Arc<FakeSession> {
        self.sessions.lock().unwrap()[server].clone()
    }

    /// Whether the host asked for the server's process to be killed
    pub fn was_killed(&self, server: &str) -> bool {
        match self.kills.lock().unwrap().get_mut(server) {
            Some(rx) => rx.try_recv().is_ok(),
            None => false,
        }
    }

    /// Pretend the server's latest process exited on its own
    pub fn exit(&self, server: &str, code: Option<i32>) {
        let launch_id = *self.launch_ids(server).last().unwrap();
        self.exit_launch(server, launch_id, code);
    }

    /// Report an exit for one specific launch of `server`
    pub fn exit_launch(&self, server: &str, launch_id: u64, code: Option<i32>) {
        let events = self.events.lock().unwrap().clone().unwrap();
        events
            .send(ProcessNotice {
                server: server.to_string(),
                launch_id,
                event: ProcessEvent::Exited { code },
            })
            .unwrap();
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec, events: ProcessEventSender) -> HostResult<Launched> {
        let delay = *self.launch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.specs.lock().unwrap().push(spec.clone());

        if let Some(kind) = self.spawn_errors.lock().unwrap().get(&spec.server) {
            return Err(HostError::spawn(
                &spec.server,
                &spec.command,
                &std::io::Error::from(*kind),
            ));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);

        let session = Arc::new(FakeSession {
            server: spec.server.clone(),
            tools: self
                .tools
                .lock()
                .unwrap()
                .get(&spec.server)
                .cloned()
                .unwrap_or_default(),
            failures_left: AtomicU32::new(
                self.discovery_failures
                    .lock()
                    .unwrap()
                    .get(&spec.server)
                    .copied()
                    .unwrap_or(0),
            ),
            fail_close: self.close_errors.lock().unwrap().contains(&spec.server),
            list_attempts: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.sessions
            .lock()
            .unwrap()
            .insert(spec.server.clone(), session.clone());

        let (kill_tx, kill_rx) = oneshot::channel();
        let (_, reaped_rx) = oneshot::channel();
        self.kills.lock().unwrap().insert(spec.server.clone(), kill_rx);
        *self.events.lock().unwrap() = Some(events);

        Ok(Launched {
            session,
            process: ProcessHandle::new(Some(4242), kill_tx, reaped_rx),
        })
    }
}

pub fn host_with(servers: Vec<ServerConfig>, security: SecurityConfig, launcher: Arc<FakeLauncher>) -> McpHost {
    let settings = HostSettings {
        security,
        servers,
        ..Default::default()
    };
    let (host, rejected) = McpHost::with_launcher(settings, launcher);
    assert!(rejected.is_empty(), "unexpected rejected configs: {:?}", rejected);
    host
}

pub fn host(servers: Vec<ServerConfig>, launcher: Arc<FakeLauncher>) -> McpHost {
    host_with(servers, SecurityConfig::default(), launcher)
}

/// Wait (real time) until `check` holds
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
