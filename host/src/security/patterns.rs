//! Pattern guards - static checks for commands, arguments and paths
//!
//! Shared by server-config validation and tool-input validation.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

/// A suspicious-input rule: compiled pattern plus a human-readable reason
struct SuspiciousPattern {
    regex: Regex,
    reason: &'static str,
}

static SUSPICIOUS_PATTERNS: LazyLock<Vec<SuspiciousPattern>> = LazyLock::new(|| {
    [
        (r"(curl|wget)\b.*\|\s*(ba|z|da|k)?sh\b", "pipes a downloaded script into a shell"),
        (r"[;&|`$]", "contains shell metacharacters"),
        (r"\.\.", "contains directory traversal"),
        (
            r"/etc/(passwd|shadow|sudoers|group)\b",
            "accesses sensitive system files",
        ),
        (r"(^|/)\.ssh(/|$)|id_(rsa|dsa|ecdsa|ed25519)\b", "accesses SSH keys"),
        (r"(^|/)\.(aws|gnupg|kube)(/|$)", "accesses credential stores"),
        (r"^/(proc|sys)(/|$)", "accesses kernel interfaces"),
    ]
    .into_iter()
    .map(|(pattern, reason)| SuspiciousPattern {
        regex: Regex::new(pattern).expect("Invalid suspicious pattern"),
        reason,
    })
    .collect()
});

/// Roots a server may never use as its working directory
const DISALLOWED_ROOTS: &[&str] = &["/etc", "/proc", "/sys", "/dev", "/root", "/var/log"];

/// Temp roots that must not host an executable working directory
const TEMP_ROOTS: &[&str] = &["/tmp", "/var/tmp", "/private/tmp"];

/// Extensions treated as executable when they appear in temp paths
const EXECUTABLE_EXTENSIONS: &[&str] = &["exe", "sh", "bat", "cmd", "ps1", "com", "bin", "run"];

/// Return the reason a value is suspicious, if any pattern matches
pub fn suspicious_reason(value: &str) -> Option<&'static str> {
    SUSPICIOUS_PATTERNS
        .iter()
        .find(|p| p.regex.is_match(value))
        .map(|p| p.reason)
}

/// Check a command against an allow-list by exact name, then by basename
pub fn command_allowed(command: &str, allowed: &[String]) -> bool {
    if allowed.iter().any(|a| a == command) {
        return true;
    }
    command_basename(command)
        .map(|base| allowed.iter().any(|a| a == base))
        .unwrap_or(false)
}

/// Basename of a command given as a path; `None` for bare names
pub fn command_basename(command: &str) -> Option<&str> {
    if !command.contains('/') && !command.contains('\\') {
        return None;
    }
    command.rsplit(['/', '\\']).next().filter(|s| !s.is_empty())
}

/// Normalize a path lexically, resolving `.` and `..` without touching the filesystem
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized
}

/// Return why a working directory is disallowed, if it is
pub fn working_directory_violation(dir: &Path) -> Option<String> {
    let resolved = dir.canonicalize().unwrap_or_else(|_| normalize_path(dir));

    for root in DISALLOWED_ROOTS {
        if resolved.starts_with(root) {
            return Some(format!(
                "Working directory {} is under disallowed root {}",
                resolved.display(),
                root
            ));
        }
    }

    let in_temp = TEMP_ROOTS.iter().any(|root| resolved.starts_with(root));
    let executable = resolved
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| EXECUTABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if in_temp && executable {
        return Some(format!(
            "Working directory {} is an executable path in a temp directory",
            resolved.display()
        ));
    }

    None
}

/// Host of a URL-looking value, if it parses as http(s)
pub fn url_host(value: &str) -> Option<String> {
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return None;
    }
    url::Url::parse(value)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Whether a host is covered by the domain allow-list (subdomains included)
pub fn domain_allowed(host: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|domain| {
        let domain = domain.to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{}", domain))
    })
}
