//! Reader for agent transcripts (newline-delimited JSON).
//!
//! Paths are resolved against `<scenario_root>/tmp` first, then
//! `<scenario_root>`; anything outside both is rejected.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// Records read when the caller gives no limit.
pub const DEFAULT_MAX_ENTRIES: usize = 750;

/// Directory under the scenario root searched first.
pub const TRANSCRIPT_BASE: &str = "tmp";

/// Keys removed from `msg` before it is returned as `details`.
const MSG_CONSUMED_KEYS: &[&str] = &["type", "message", "text", "role"];

/// A parsed transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Transcript {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub entries: Vec<TranscriptEntry>,
    /// More records followed the last one read
    pub truncated: bool,
}

/// One classified transcript record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a single line was interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Metadata(Value),
    Prompt(String),
    Entry(TranscriptEntry),
}

/// Classify one transcript line.
pub fn classify_record(line: &str) -> Record {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return Record::Entry(TranscriptEntry {
                kind: "unparsed".to_string(),
                raw: Some(line.to_string()),
                error: Some(e.to_string()),
                ..TranscriptEntry::default()
            });
        }
    };

    let Some(object) = value.as_object() else {
        return Record::Entry(TranscriptEntry {
            kind: "event".to_string(),
            raw: Some(line.to_string()),
            ..TranscriptEntry::default()
        });
    };

    if object.contains_key("sandbox") {
        return Record::Metadata(value);
    }
    if let Some(prompt) = object.get("prompt").and_then(Value::as_str) {
        return Record::Prompt(prompt.to_string());
    }

    let timestamp = object.get("timestamp").cloned();
    let Some(msg) = object.get("msg").and_then(Value::as_object) else {
        return Record::Entry(TranscriptEntry {
            kind: "event".to_string(),
            timestamp,
            details: Some(object.clone()),
            ..TranscriptEntry::default()
        });
    };

    let msg_type = msg.get("type").and_then(Value::as_str).unwrap_or_default();
    let (kind, role) = match msg_type {
        "agent_message" | "final_response" => ("message", Some("assistant")),
        "agent_reasoning" | "reasoning" => ("reasoning", None),
        "user_message" => ("message", Some("user")),
        "tool_request" | "tool_result" | "tool_output" | "tool_error" => ("tool", None),
        _ => ("event", None),
    };
    let role = role
        .map(str::to_string)
        .or_else(|| msg.get("role").and_then(Value::as_str).map(str::to_string));

    let text = ["message", "text"]
        .iter()
        .find_map(|key| msg.get(*key).and_then(Value::as_str))
        .map(str::to_string);

    let mut details = msg.clone();
    for key in MSG_CONSUMED_KEYS {
        details.remove(*key);
    }

    Record::Entry(TranscriptEntry {
        kind: kind.to_string(),
        role,
        msg_type: (!msg_type.is_empty()).then(|| msg_type.to_string()),
        text,
        timestamp,
        details: (!details.is_empty()).then_some(details),
        ..TranscriptEntry::default()
    })
}

/// Lexically normalize a path, resolving `.` and `..` without touching disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn within(candidate: &Path, base: &Path) -> bool {
    if !candidate.starts_with(base) {
        return false;
    }
    // Follow symlinks once the file exists
    match (candidate.canonicalize(), base.canonicalize()) {
        (Ok(real), Ok(real_base)) => real.starts_with(real_base),
        _ => true,
    }
}

/// Resolve a caller-supplied transcript path against the allowlist.
pub fn resolve_transcript_path(scenario_root: &Path, requested: &str) -> Result<PathBuf> {
    let requested = requested.trim();
    if requested.is_empty() {
        return Err(Error::InvalidInput("transcript path is required".to_string()));
    }

    let root = normalize(scenario_root);
    let bases = [root.join(TRANSCRIPT_BASE), root];
    let requested = Path::new(requested);

    let mut first_allowed = None;
    for base in &bases {
        let candidate = if requested.is_absolute() {
            normalize(requested)
        } else {
            normalize(&base.join(requested))
        };
        if !within(&candidate, base) {
            continue;
        }
        if candidate.is_file() {
            return Ok(candidate);
        }
        first_allowed.get_or_insert(candidate);
    }

    first_allowed.ok_or_else(|| {
        Error::InvalidInput(format!(
            "transcript path {} is outside the scenario directory",
            requested.display()
        ))
    })
}

/// Read and classify up to `max_entries` records from a transcript file.
pub fn read_transcript(path: &Path, max_entries: usize) -> Result<Transcript> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(format!("transcript {}", path.display()))
        } else {
            Error::Io(e)
        }
    })?;

    let mut transcript = Transcript {
        path: path.display().to_string(),
        ..Transcript::default()
    };

    let mut read = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if read >= max_entries {
            transcript.truncated = true;
            break;
        }
        read += 1;

        match classify_record(line) {
            Record::Metadata(value) => transcript.metadata = Some(value),
            Record::Prompt(prompt) => transcript.prompt = Some(prompt),
            Record::Entry(entry) => transcript.entries.push(entry),
        }
    }
    Ok(transcript)
}

/// Resolve `requested` under `scenario_root` and read it.
pub fn load_transcript(scenario_root: &Path, requested: &str, max_entries: Option<usize>) -> Result<Transcript> {
    let path = resolve_transcript_path(scenario_root, requested)?;
    read_transcript(&path, max_entries.filter(|n| *n > 0).unwrap_or(DEFAULT_MAX_ENTRIES))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn entry(line: &str) -> TranscriptEntry {
        match classify_record(line) {
            Record::Entry(entry) => entry,
            other => panic!("expected entry, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_message_types() {
        let assistant = entry(r#"{"timestamp":"t1","msg":{"type":"agent_message","message":"Found it","id":7}}"#);
        assert_eq!(assistant.kind, "message");
        assert_eq!(assistant.role.as_deref(), Some("assistant"));
        assert_eq!(assistant.text.as_deref(), Some("Found it"));
        assert_eq!(assistant.timestamp, Some(Value::String("t1".to_string())));
        let details = assistant.details.unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details["id"], 7);

        assert_eq!(entry(r#"{"msg":{"type":"reasoning","text":"hmm"}}"#).kind, "reasoning");
        let user = entry(r#"{"msg":{"type":"user_message","message":"hi","role":"x"}}"#);
        assert_eq!(user.role.as_deref(), Some("user"));
        assert!(user.details.is_none());
        assert_eq!(entry(r#"{"msg":{"type":"tool_error"}}"#).kind, "tool");
        assert_eq!(entry(r#"{"msg":{"type":"token_count"}}"#).kind, "event");
        assert_eq!(entry(r#"{"msg":{"type":"something_new"}}"#).kind, "event");
    }

    #[test]
    fn test_classify_metadata_prompt_and_garbage() {
        assert!(matches!(
            classify_record(r#"{"sandbox":"workspace-write","model":"x"}"#),
            Record::Metadata(_)
        ));
        assert_eq!(
            classify_record(r#"{"prompt":"Fix the login"}"#),
            Record::Prompt("Fix the login".to_string())
        );
        let unparsed = entry("{not json");
        assert_eq!(unparsed.kind, "unparsed");
        assert_eq!(unparsed.raw.as_deref(), Some("{not json"));
        assert!(unparsed.error.is_some());
    }

    #[test]
    fn test_read_transcript_respects_max() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.jsonl");
        let mut content = String::from("{\"sandbox\":\"ro\"}\n{\"prompt\":\"p\"}\n\n");
        for i in 0..5 {
            content.push_str(&format!("{{\"msg\":{{\"type\":\"agent_message\",\"message\":\"m{}\"}}}}\n", i));
        }
        fs::write(&path, content).unwrap();

        let transcript = read_transcript(&path, 4).unwrap();
        assert!(transcript.metadata.is_some());
        assert_eq!(transcript.prompt.as_deref(), Some("p"));
        assert_eq!(transcript.entries.len(), 2);
        assert!(transcript.truncated);

        let full = read_transcript(&path, DEFAULT_MAX_ENTRIES).unwrap();
        assert_eq!(full.entries.len(), 5);
        assert!(!full.truncated);
    }

    #[test]
    fn test_resolve_prefers_tmp_then_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("tmp/transcripts")).unwrap();
        fs::write(root.join("tmp/transcripts/a.jsonl"), "").unwrap();
        fs::create_dir_all(root.join("logs")).unwrap();
        fs::write(root.join("logs/b.jsonl"), "").unwrap();

        let a = resolve_transcript_path(root, "transcripts/a.jsonl").unwrap();
        assert!(a.ends_with("tmp/transcripts/a.jsonl"));
        let b = resolve_transcript_path(root, "logs/b.jsonl").unwrap();
        assert!(b.ends_with("logs/b.jsonl"));
        let abs = resolve_transcript_path(root, &root.join("logs/b.jsonl").display().to_string()).unwrap();
        assert_eq!(abs, b);
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("scenario");
        fs::create_dir_all(&root).unwrap();
        assert!(matches!(
            resolve_transcript_path(&root, "../../etc/passwd"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            resolve_transcript_path(&root, "/etc/passwd"),
            Err(Error::InvalidInput(_))
        ));
        assert!(resolve_transcript_path(&root, "").is_err());
    }

    #[test]
    fn test_missing_transcript_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_transcript(dir.path(), "tmp/none.jsonl", None),
            Err(Error::NotFound(_))
        ));
    }
}
