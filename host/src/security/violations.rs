//! Append-only security violation log

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a recorded violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    RateLimit,
    SuspiciousInput,
    CommandNotAllowed,
    PathNotAllowed,
    PolicyExceeded,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationKind::RateLimit => write!(f, "rate_limit"),
            ViolationKind::SuspiciousInput => write!(f, "suspicious_input"),
            ViolationKind::CommandNotAllowed => write!(f, "command_not_allowed"),
            ViolationKind::PathNotAllowed => write!(f, "path_not_allowed"),
            ViolationKind::PolicyExceeded => write!(f, "policy_exceeded"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub kind: ViolationKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub server_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

#[derive(Debug, Default)]
pub struct ViolationLog {
    entries: Vec<SecurityViolation>,
}

impl ViolationLog {
    pub fn record(
        &mut self,
        kind: ViolationKind,
        message: impl Into<String>,
        server_name: &str,
        tool_name: Option<&str>,
    ) {
        let violation = SecurityViolation {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            server_name: server_name.to_string(),
            tool_name: tool_name.map(str::to_string),
        };
        tracing::warn!(
            kind = %violation.kind,
            server = %violation.server_name,
            tool = ?violation.tool_name,
            "Security violation: {}",
            violation.message
        );
        self.entries.push(violation);
    }

    pub fn entries(&self) -> &[SecurityViolation] {
        &self.entries
    }

    pub fn counts(&self) -> HashMap<ViolationKind, usize> {
        let mut counts = HashMap::new();
        for entry in &self.entries {
            *counts.entry(entry.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
