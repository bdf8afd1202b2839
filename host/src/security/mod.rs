//! Security policy engine
//!
//! Validates server configurations before anything is spawned and tool inputs
//! before anything is invoked. Besides the rate-limit counters and the
//! violation log it holds no state, and every check is synchronous.

mod patterns;
mod rate_limit;
mod violations;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::config::{SecurityConfig, ServerConfig, ServerSecurityPolicy};

pub use patterns::{command_allowed, command_basename, suspicious_reason};
pub use rate_limit::{RateDecision, RateLimitCounter, RateLimiter};
pub use violations::{SecurityViolation, ViolationKind, ViolationLog};

/// Server name recorded for violations raised by built-in tools
const BUILTIN_SERVER: &str = "builtin";

/// Outcome of a validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Calls left in the current minute window (tool input validation only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_remaining: Option<u32>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            ..Default::default()
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Fold another result into this one
    pub fn merge(&mut self, other: ValidationResult) {
        self.valid &= other.valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Split a unified tool id into (server, tool)
fn split_tool_id(tool_id: &str) -> (&str, &str) {
    tool_id.split_once(':').unwrap_or((BUILTIN_SERVER, tool_id))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The security policy engine
pub struct SecurityPolicy {
    config: RwLock<SecurityConfig>,
    limiter: Mutex<RateLimiter>,
    violations: Mutex<ViolationLog>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::new(SecurityConfig::default())
    }
}

impl SecurityPolicy {
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            config: RwLock::new(config),
            limiter: Mutex::new(RateLimiter::new()),
            violations: Mutex::new(ViolationLog::default()),
        }
    }

    /// Snapshot of the current security configuration
    pub fn security_config(&self) -> SecurityConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_security_config(&self, config: SecurityConfig) {
        tracing::info!(
            allowed_commands = config.allowed_commands.len(),
            per_minute = config.max_calls_per_minute,
            "Security configuration updated"
        );
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    // ========================================================================
    // Server configuration
    // ========================================================================

    /// Validate a server configuration before it is stored or spawned
    pub fn validate_server_config(&self, server: &ServerConfig) -> ValidationResult {
        let config = self.security_config();
        let mut result = ValidationResult::ok();
        let mut log = lock(&self.violations);

        if !command_allowed(&server.command, &config.allowed_commands) {
            let message = format!(
                "Command '{}' is not in the allowed commands list ({})",
                server.command,
                config.allowed_commands.join(", ")
            );
            log.record(ViolationKind::CommandNotAllowed, &message, &server.name, None);
            result.error(message);
        }

        for arg in &server.args {
            if let Some(reason) = suspicious_reason(arg) {
                let message = format!("Argument '{}' {}", arg, reason);
                log.record(ViolationKind::SuspiciousInput, &message, &server.name, None);
                result.error(message);
            }
            if let Some(warning) = domain_warning(arg, &config.allowed_domains) {
                result.warn(warning);
            }
        }

        if let Some(dir) = server.expanded_working_directory() {
            if let Some(message) = patterns::working_directory_violation(&dir) {
                log.record(ViolationKind::PathNotAllowed, &message, &server.name, None);
                result.error(message);
            }
        }

        match &server.security_policy {
            None => result.warn(format!(
                "Server '{}' has no explicit security policy",
                server.name
            )),
            Some(policy) => {
                for message in policy_violations(policy, &config) {
                    log.record(ViolationKind::PolicyExceeded, &message, &server.name, None);
                    result.error(message);
                }
                if policy.sandboxed && !config.enable_sandboxing {
                    result.warn(format!(
                        "Server '{}' requests sandboxing but sandboxing is disabled",
                        server.name
                    ));
                }
            }
        }

        result
    }

    // ========================================================================
    // Tool input
    // ========================================================================

    /// Validate tool arguments against the rate limit, schema and pattern checks
    pub fn validate_tool_input(
        &self,
        tool_id: &str,
        schema: Option<&Value>,
        args: &Value,
    ) -> ValidationResult {
        self.validate_tool_input_at(tool_id, schema, args, Instant::now())
    }

    pub fn validate_tool_input_at(
        &self,
        tool_id: &str,
        schema: Option<&Value>,
        args: &Value,
        now: Instant,
    ) -> ValidationResult {
        let config = self.security_config();
        let (server, tool) = split_tool_id(tool_id);
        let mut result = ValidationResult::ok();

        let decision = lock(&self.limiter).check(
            tool_id,
            now,
            config.max_calls_per_minute,
            config.max_calls_per_hour,
        );
        let remaining = match decision {
            RateDecision::Allowed { remaining } => remaining,
            RateDecision::MinuteExceeded { limit } | RateDecision::HourExceeded { limit } => {
                let window = if matches!(decision, RateDecision::MinuteExceeded { .. }) {
                    "minute"
                } else {
                    "hour"
                };
                let message = format!(
                    "Rate limit exceeded for tool '{}': more than {} calls per {}",
                    tool_id, limit, window
                );
                lock(&self.violations).record(ViolationKind::RateLimit, &message, server, Some(tool));
                result.error(message);
                return result;
            }
        };

        for name in required_properties(schema) {
            let present = args.get(name).map(|v| !v.is_null()).unwrap_or(false);
            if !present {
                result.error(format!("Missing required parameter '{}'", name));
            }
        }

        if let Some(object) = args.as_object() {
            let mut log = lock(&self.violations);
            for (key, value) in object {
                let Some(text) = value.as_str() else {
                    continue;
                };
                if let Some(reason) = suspicious_reason(text) {
                    let message = format!("Parameter '{}' {}", key, reason);
                    log.record(ViolationKind::SuspiciousInput, &message, server, Some(tool));
                    result.error(message);
                }
                if let Some(warning) = domain_warning(text, &config.allowed_domains) {
                    result.warn(warning);
                }
            }
        }

        if result.valid {
            result.rate_limit_remaining = Some(remaining);
        }
        result
    }

    /// Clamp a requested call timeout to the configured maximum
    ///
    /// Falls back to the server policy's timeout, then to `default`.
    pub fn effective_timeout(
        &self,
        requested: Option<Duration>,
        policy: Option<&ServerSecurityPolicy>,
        default: Duration,
    ) -> Duration {
        let max = Duration::from_secs(self.security_config().max_timeout_secs);
        requested
            .or_else(|| policy.and_then(|p| p.timeout_secs).map(Duration::from_secs))
            .unwrap_or(default)
            .min(max)
    }

    // ========================================================================
    // Violation log
    // ========================================================================

    pub fn violations(&self) -> Vec<SecurityViolation> {
        lock(&self.violations).entries().to_vec()
    }

    pub fn violation_counts(&self) -> HashMap<ViolationKind, usize> {
        lock(&self.violations).counts()
    }

    pub fn clear_violations(&self) {
        lock(&self.violations).clear();
    }

    /// Drop all rate-limit counters
    pub fn reset_rate_limits(&self) {
        lock(&self.limiter).reset();
    }
}

fn required_properties(schema: Option<&Value>) -> Vec<&str> {
    schema
        .and_then(|s| s.get("required"))
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn domain_warning(value: &str, allowed_domains: &[String]) -> Option<String> {
    if allowed_domains.is_empty() {
        return None;
    }
    let host = patterns::url_host(value)?;
    (!patterns::domain_allowed(&host, allowed_domains))
        .then(|| format!("URL host '{}' is not in the allowed domains list", host))
}

fn policy_violations(policy: &ServerSecurityPolicy, config: &SecurityConfig) -> Vec<String> {
    let mut messages = Vec::new();

    if let Some(timeout) = policy.timeout_secs {
        if timeout > config.max_timeout_secs {
            messages.push(format!(
                "Policy timeout {}s exceeds the maximum of {}s",
                timeout, config.max_timeout_secs
            ));
        }
    }
    if let Some(memory) = policy.max_memory_mb {
        if memory > config.max_memory_mb {
            messages.push(format!(
                "Policy memory limit {}MB exceeds the maximum of {}MB",
                memory, config.max_memory_mb
            ));
        }
    }
    for command in &policy.allowed_commands {
        if !command_allowed(command, &config.allowed_commands) {
            messages.push(format!(
                "Auxiliary command '{}' is not in the allowed commands list",
                command
            ));
        }
    }

    messages
}
