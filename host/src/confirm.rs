//! Confirmation of destructive tool calls
//!
//! A pending-confirmation table keyed by call id. The registry files a request
//! and waits; whoever presents it to the user answers through
//! [`ConfirmationBroker::resolve`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use crate::error::{HostError, HostResult};

/// Name fragments that mark a tool as destructive
const DESTRUCTIVE_WORDS: &[&str] = &[
    "delete", "remove", "write", "move", "rename", "exec", "execute", "run", "kill", "drop",
];

/// Whether a tool name looks like it changes or destroys something
///
/// The name is split into words on separators and camelCase boundaries, so
/// `deleteFile` and `kill_process` match but `truncate` does not.
pub fn is_destructive_tool(name: &str) -> bool {
    split_words(name)
        .iter()
        .any(|word| DESTRUCTIVE_WORDS.contains(&word.as_str()))
}

fn split_words(name: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in name.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_numeric();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// A tool call waiting for the user's decision
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationRequest {
    pub call_id: u64,
    pub tool_id: String,
    pub arguments: Value,
    pub requested_at: DateTime<Utc>,
}

struct Pending {
    request: ConfirmationRequest,
    respond: oneshot::Sender<bool>,
}

pub struct ConfirmationBroker {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    requests_tx: broadcast::Sender<ConfirmationRequest>,
}

impl Default for ConfirmationBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationBroker {
    pub fn new() -> Self {
        let (requests_tx, _) = broadcast::channel(16);
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            requests_tx,
        }
    }

    /// New requests as they are filed
    pub fn subscribe(&self) -> broadcast::Receiver<ConfirmationRequest> {
        self.requests_tx.subscribe()
    }

    /// Requests still waiting for an answer, oldest first
    pub fn pending(&self) -> Vec<ConfirmationRequest> {
        let mut requests: Vec<ConfirmationRequest> = self
            .lock()
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.call_id);
        requests
    }

    /// Answer a pending request; returns false if `call_id` is unknown
    pub fn resolve(&self, call_id: u64, approved: bool) -> bool {
        let Some(pending) = self.lock().remove(&call_id) else {
            return false;
        };
        tracing::info!(
            call_id,
            tool = %pending.request.tool_id,
            approved,
            "Confirmation resolved"
        );
        pending.respond.send(approved).is_ok()
    }

    /// File a request and wait for the answer
    pub async fn request(&self, tool_id: &str, arguments: &Value, timeout: Duration) -> HostResult<()> {
        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = ConfirmationRequest {
            call_id,
            tool_id: tool_id.to_string(),
            arguments: arguments.clone(),
            requested_at: Utc::now(),
        };
        let (respond, answer) = oneshot::channel();
        self.lock().insert(
            call_id,
            Pending {
                request: request.clone(),
                respond,
            },
        );
        let _forget = ForgetOnDrop {
            pending: &self.pending,
            call_id,
        };
        tracing::info!(call_id, tool = %tool_id, "Waiting for confirmation");
        let _ = self.requests_tx.send(request);

        match tokio::time::timeout(timeout, answer).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) | Ok(Err(_)) => Err(HostError::ConfirmationDenied(tool_id.to_string())),
            Err(_) => Err(HostError::ConfirmationTimeout(tool_id.to_string())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drops a pending entry once its waiter is gone, answered or not
struct ForgetOnDrop<'a> {
    pending: &'a Mutex<HashMap<u64, Pending>>,
    call_id: u64,
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.call_id);
    }
}
