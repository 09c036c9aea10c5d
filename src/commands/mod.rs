//! Command implementations shared by the CLI and the HTTP API.
//!
//! - `issues` - Issue create / update / delete / list
//! - `agents` - Rate-limit status and transcripts

pub mod agents;
pub mod issues;

use serde::Serialize;

/// Command results that can be serialized to JSON or formatted for humans.
pub trait CommandResult {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

/// Serialize any value the way command results are printed.
pub fn json_string<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!(r#"{{"error": "{}"}}"#, e))
}
