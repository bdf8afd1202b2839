//! Built-in tools
//!
//! Tools compiled into the host. They are registered once under a bare id and
//! never change afterwards.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;

use crate::error::{HostError, HostResult};

/// Largest file `echoFile` will return
pub const MAX_ECHO_FILE_BYTES: u64 = 1024 * 1024;

/// Most entries `listDirectory` will return
pub const MAX_LIST_ENTRIES: usize = 1000;

/// A tool implemented inside the host
#[async_trait]
pub trait BuiltInTool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema of the arguments
    fn input_schema(&self) -> Value;

    async fn execute(&self, args: Value) -> HostResult<Value>;
}

/// The tools every host starts with
pub fn default_builtins() -> Vec<Box<dyn BuiltInTool>> {
    vec![Box::new(EchoFile), Box::new(ListDirectory), Box::new(CurrentTime)]
}

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default()
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: Value) -> HostResult<T> {
    serde_json::from_value(args).map_err(|e| HostError::InvalidInput {
        tool: tool.to_string(),
        errors: vec![e.to_string()],
    })
}

fn io_failure(tool: &str, path: &str, err: std::io::Error) -> HostError {
    HostError::ToolFailed {
        tool: tool.to_string(),
        reason: format!("{}: {}", path, err),
    }
}

// ============================================================================
// echoFile
// ============================================================================

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct EchoFileParams {
    #[schemars(description = "Path of the UTF-8 text file to read")]
    pub path: String,
}

#[derive(Debug, Serialize)]
struct EchoFileResponse {
    path: String,
    content: String,
    size: u64,
}

/// Returns the contents of a text file
pub struct EchoFile;

#[async_trait]
impl BuiltInTool for EchoFile {
    fn name(&self) -> &'static str {
        "echoFile"
    }

    fn description(&self) -> &'static str {
        "Read a UTF-8 text file and return its contents"
    }

    fn input_schema(&self) -> Value {
        schema_of::<EchoFileParams>()
    }

    async fn execute(&self, args: Value) -> HostResult<Value> {
        let params: EchoFileParams = parse_args(self.name(), args)?;
        let path = shellexpand::tilde(&params.path).to_string();

        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| io_failure(self.name(), &path, e))?;
        if !metadata.is_file() {
            return Err(HostError::ToolFailed {
                tool: self.name().to_string(),
                reason: format!("{} is not a file", path),
            });
        }
        if metadata.len() > MAX_ECHO_FILE_BYTES {
            return Err(HostError::ToolFailed {
                tool: self.name().to_string(),
                reason: format!(
                    "{} is {} bytes, larger than the {} byte limit",
                    path,
                    metadata.len(),
                    MAX_ECHO_FILE_BYTES
                ),
            });
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| io_failure(self.name(), &path, e))?;

        Ok(serde_json::to_value(EchoFileResponse {
            path,
            content,
            size: metadata.len(),
        })?)
    }
}

// ============================================================================
// listDirectory
// ============================================================================

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListDirectoryParams {
    #[schemars(description = "Directory to list")]
    pub path: String,

    #[schemars(description = "Include entries whose name starts with a dot (default: false)")]
    #[serde(default)]
    pub include_hidden: bool,
}

#[derive(Debug, Serialize)]
struct DirectoryEntry {
    name: String,
    #[serde(rename = "type")]
    entry_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    modified: Option<DateTime<Utc>>,
}

/// Lists the entries of one directory
pub struct ListDirectory;

#[async_trait]
impl BuiltInTool for ListDirectory {
    fn name(&self) -> &'static str {
        "listDirectory"
    }

    fn description(&self) -> &'static str {
        "List the files and directories inside a directory"
    }

    fn input_schema(&self) -> Value {
        schema_of::<ListDirectoryParams>()
    }

    async fn execute(&self, args: Value) -> HostResult<Value> {
        let params: ListDirectoryParams = parse_args(self.name(), args)?;
        let path = shellexpand::tilde(&params.path).to_string();

        let mut read_dir = fs::read_dir(&path)
            .await
            .map_err(|e| io_failure(self.name(), &path, e))?;

        let mut entries = Vec::new();
        let mut truncated = false;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| io_failure(self.name(), &path, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !params.include_hidden && name.starts_with('.') {
                continue;
            }
            if entries.len() >= MAX_LIST_ENTRIES {
                truncated = true;
                break;
            }
            entries.push(describe_entry(name, &entry.path()).await);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(json!({
            "path": path,
            "entries": entries,
            "truncated": truncated,
        }))
    }
}

async fn describe_entry(name: String, path: &Path) -> DirectoryEntry {
    match fs::metadata(path).await {
        Ok(metadata) => DirectoryEntry {
            name,
            entry_type: if metadata.is_dir() { "directory" } else { "file" },
            size: metadata.is_file().then(|| metadata.len()),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        },
        // Dangling symlinks and entries removed mid-listing
        Err(_) => DirectoryEntry {
            name,
            entry_type: "unknown",
            size: None,
            modified: None,
        },
    }
}

// ============================================================================
// currentTime
// ============================================================================

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CurrentTimeParams {}

/// Reports the host's clock
pub struct CurrentTime;

#[async_trait]
impl BuiltInTool for CurrentTime {
    fn name(&self) -> &'static str {
        "currentTime"
    }

    fn description(&self) -> &'static str {
        "Get the current date and time (UTC)"
    }

    fn input_schema(&self) -> Value {
        schema_of::<CurrentTimeParams>()
    }

    async fn execute(&self, args: Value) -> HostResult<Value> {
        let _: CurrentTimeParams = parse_args(self.name(), args)?;
        let now = Utc::now();
        Ok(json!({
            "iso": now.to_rfc3339(),
            "unix": now.timestamp(),
        }))
    }
}
