//! Tools presented to the calling agent

mod builtin;
mod registry;
mod schema;

pub use builtin::{
    default_builtins, BuiltInTool, CurrentTime, EchoFile, ListDirectory, MAX_ECHO_FILE_BYTES,
    MAX_LIST_ENTRIES,
};
pub use registry::{ToolDescriptor, ToolOrigin, ToolOutcome, UnifiedToolRegistry};
pub use schema::{sanitize_schema, ACCEPTED_STRING_FORMATS};
