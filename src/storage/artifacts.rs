//! Artifact persistence for issue attachments.
//!
//! Inline payloads are decoded, given a safe unique filename and written under
//! `<issue_dir>/artifacts/`. The returned [`Attachment`] records keep the
//! order in which payloads were supplied.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path};

use super::ARTIFACTS_DIR;
use crate::models::Attachment;
use crate::{Error, Result};

/// Fallback content type when nothing better is known.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// An inline artifact supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub content: String,

    /// One of `plain`, `text`, `markdown`, `json`, `base64` (empty means plain)
    #[serde(default)]
    pub encoding: String,

    #[serde(default)]
    pub content_type: String,

    /// Content type used when the payload does not carry one
    #[serde(skip)]
    pub default_content_type: Option<String>,
}

/// Supported content encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Plain,
    Text,
    Markdown,
    Json,
    Base64,
}

impl std::str::FromStr for ContentEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "plain" => Ok(ContentEncoding::Plain),
            "text" => Ok(ContentEncoding::Text),
            "markdown" => Ok(ContentEncoding::Markdown),
            "json" => Ok(ContentEncoding::Json),
            "base64" => Ok(ContentEncoding::Base64),
            other => Err(Error::InvalidInput(format!(
                "unsupported artifact encoding '{}'",
                other
            ))),
        }
    }
}

/// Decode an artifact body into raw bytes.
pub fn decode_content(content: &str, encoding: ContentEncoding) -> Result<Vec<u8>> {
    match encoding {
        ContentEncoding::Plain
        | ContentEncoding::Text
        | ContentEncoding::Markdown
        | ContentEncoding::Json => Ok(content.as_bytes().to_vec()),
        ContentEncoding::Base64 => {
            let mut body = content.trim();
            if body.starts_with("data:") {
                if let Some(idx) = body.find(";base64,") {
                    body = &body[idx + ";base64,".len()..];
                }
            }
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            STANDARD
                .decode(compact.as_bytes())
                .map_err(|e| Error::InvalidInput(format!("invalid base64 content: {}", e)))
        }
    }
}

/// Reduce a display name to a lowercase filesystem-safe slug.
pub fn sanitize_file_name(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().to_lowercase().chars() {
        let mapped = if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' {
            c
        } else {
            '-'
        };
        if mapped == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(mapped);
    }
    slug.trim_start_matches(['-', '_', '.'])
        .trim_end_matches('-')
        .to_string()
}

fn base_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

/// File extension implied by a content type.
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    match base_content_type(content_type).as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/webp" => Some("webp"),
        "application/json" => Some("json"),
        "text/plain" => Some("txt"),
        _ => None,
    }
}

/// Content type implied by a file extension.
pub fn content_type_for_extension(file_name: &str) -> Option<&'static str> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_lowercase();
    let content_type = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "json" => "application/json",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "har" => "application/json",
        _ => return None,
    };
    Some(content_type)
}

fn has_extension(name: &str) -> bool {
    Path::new(name).extension().is_some()
}

/// Derive the (not yet unique) filename for the payload at `index`.
fn candidate_name(payload: &ArtifactPayload, encoding: ContentEncoding, index: usize) -> String {
    let mut name = sanitize_file_name(&payload.name);
    if name.is_empty() {
        name = sanitize_file_name(&payload.category);
    }
    if name.is_empty() {
        name = format!("artifact-{}", index + 1);
    }

    if !has_extension(&name) {
        let hint = if payload.content_type.trim().is_empty() {
            payload.default_content_type.as_deref().unwrap_or_default()
        } else {
            payload.content_type.as_str()
        };
        if let Some(ext) = extension_for_content_type(hint) {
            name = format!("{}.{}", name, ext);
        }
    }
    if encoding == ContentEncoding::Json && !name.ends_with(".json") {
        name.push_str(".json");
    }
    name
}

fn resolve_content_type(payload: &ArtifactPayload, encoding: ContentEncoding, file_name: &str) -> String {
    let supplied = payload.content_type.trim();
    if !supplied.is_empty() {
        return supplied.to_string();
    }
    if encoding == ContentEncoding::Json {
        return "application/json".to_string();
    }
    if let Some(default) = payload.default_content_type.as_deref() {
        return default.to_string();
    }
    if matches!(
        encoding,
        ContentEncoding::Plain | ContentEncoding::Text | ContentEncoding::Markdown
    ) {
        return "text/plain".to_string();
    }
    content_type_for_extension(file_name)
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

/// Tracks filenames already used within one persistence call.
struct NameAllocator {
    taken: HashSet<String>,
    counters: HashMap<String, usize>,
}

impl NameAllocator {
    fn new(existing: HashSet<String>) -> Self {
        Self {
            taken: existing,
            counters: HashMap::new(),
        }
    }

    fn allocate(&mut self, candidate: String) -> String {
        if self.taken.insert(candidate.clone()) {
            return candidate;
        }
        let (stem, ext) = split_extension(&candidate);
        let counter = self.counters.entry(candidate.clone()).or_insert(0);
        loop {
            *counter += 1;
            let next = match ext {
                Some(ext) => format!("{}-{}.{}", stem, counter, ext),
                None => format!("{}-{}", stem, counter),
            };
            if self.taken.insert(next.clone()) {
                return next;
            }
        }
    }
}

/// Write a batch of payloads under `<issue_dir>/artifacts/`.
///
/// The first payload that cannot be decoded fails the whole batch; files
/// already written by this call are left for the caller to clean up.
pub fn persist_artifacts(issue_dir: &Path, payloads: &[ArtifactPayload]) -> Result<Vec<Attachment>> {
    if payloads.is_empty() {
        return Ok(Vec::new());
    }

    let artifacts_dir = issue_dir.join(ARTIFACTS_DIR);
    fs::create_dir_all(&artifacts_dir)?;

    let existing: HashSet<String> = fs::read_dir(&artifacts_dir)?
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    let mut names = NameAllocator::new(existing);

    let mut attachments = Vec::with_capacity(payloads.len());
    for (index, payload) in payloads.iter().enumerate() {
        let encoding: ContentEncoding = payload
            .encoding
            .parse()
            .map_err(|e| Error::InvalidInput(format!("artifact {}: {}", index, e)))?;
        let bytes = decode_content(&payload.content, encoding)
            .map_err(|e| Error::InvalidInput(format!("artifact {}: {}", index, e)))?;

        let file_name = names.allocate(candidate_name(payload, encoding, index));
        fs::write(artifacts_dir.join(&file_name), &bytes)?;

        let display = payload.name.trim();
        attachments.push(Attachment {
            name: if display.is_empty() {
                file_name.clone()
            } else {
                display.to_string()
            },
            content_type: resolve_content_type(payload, encoding, &file_name),
            path: format!("{}/{}", ARTIFACTS_DIR, file_name),
            size: bytes.len() as u64,
            category: payload.category.trim().to_string(),
        });
    }

    tracing::debug!(dir = %artifacts_dir.display(), count = attachments.len(), "persisted artifacts");
    Ok(attachments)
}

/// Normalize an attachment path relative to its issue directory.
///
/// Absolute paths and paths whose normalized form leaves the issue directory
/// are rejected. The result always uses forward slashes.
pub fn validate_attachment_path(path: &str) -> Result<String> {
    let unified = path.trim().replace('\\', "/");
    if unified.is_empty() {
        return Err(Error::InvalidInput("attachment path is empty".to_string()));
    }
    if unified.starts_with('/') || Path::new(&unified).has_root() || unified.contains(':') {
        return Err(Error::InvalidInput(format!(
            "attachment path must be relative: {}",
            path
        )));
    }

    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(Error::InvalidInput(format!(
                        "attachment path escapes the issue directory: {}",
                        path
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidInput(format!(
                    "attachment path must be relative: {}",
                    path
                )));
            }
        }
    }

    if parts.is_empty() {
        return Err(Error::InvalidInput(format!(
            "attachment path has no file component: {}",
            path
        )));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn payload(name: &str, content: &str, encoding: &str) -> ArtifactPayload {
        ArtifactPayload {
            name: name.to_string(),
            content: content.to_string(),
            encoding: encoding.to_string(),
            ..ArtifactPayload::default()
        }
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("Error Log (1).TXT"), "error-log-1-.txt");
        assert_eq!(sanitize_file_name("..hidden"), "hidden");
        assert_eq!(sanitize_file_name("--a  b--"), "a-b");
        assert_eq!(sanitize_file_name("___"), "");
        assert_eq!(sanitize_file_name("Überfall.log"), "überfall.log");
    }

    #[test]
    fn test_decode_base64_with_data_url() {
        let bytes = decode_content("data:image/png;base64,aGVs\nbG8=", ContentEncoding::Base64).unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_decode_invalid_base64() {
        assert!(matches!(
            decode_content("!!!not base64", ContentEncoding::Base64),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_unknown_encoding_rejected() {
        assert!("rot13".parse::<ContentEncoding>().is_err());
        assert_eq!("".parse::<ContentEncoding>().unwrap(), ContentEncoding::Plain);
    }

    #[test]
    fn test_persist_plain_artifact() {
        let dir = TempDir::new().unwrap();
        let mut p = payload("error.log", "Error at line 123", "plain");
        p.category = "logs".to_string();
        p.content_type = "text/plain".to_string();

        let attachments = persist_artifacts(dir.path(), &[p]).unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].path, "artifacts/error.log");
        assert_eq!(attachments[0].size, 17);
        assert_eq!(attachments[0].category, "logs");
        let content = fs::read_to_string(dir.path().join("artifacts/error.log")).unwrap();
        assert_eq!(content, "Error at line 123");
    }

    #[test]
    fn test_persist_collisions_are_numbered() {
        let dir = TempDir::new().unwrap();
        let attachments = persist_artifacts(
            dir.path(),
            &[
                payload("log.txt", "a", "plain"),
                payload("log.txt", "b", "plain"),
                payload("LOG.txt", "c", "plain"),
            ],
        )
        .unwrap();
        let paths: Vec<&str> = attachments.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["artifacts/log.txt", "artifacts/log-1.txt", "artifacts/log-2.txt"]
        );
    }

    #[test]
    fn test_persist_name_fallbacks_and_extensions() {
        let dir = TempDir::new().unwrap();
        let mut by_category = payload("", "{}", "json");
        by_category.category = "Network Logs".to_string();
        let mut image = payload("", "aGVsbG8=", "base64");
        image.content_type = "image/png".to_string();

        let attachments = persist_artifacts(dir.path(), &[by_category, image]).unwrap();
        assert_eq!(attachments[0].path, "artifacts/network-logs.json");
        assert_eq!(attachments[0].content_type, "application/json");
        assert_eq!(attachments[1].path, "artifacts/artifact-2.png");
        assert_eq!(attachments[1].content_type, "image/png");
    }

    #[test]
    fn test_content_type_fallbacks() {
        let dir = TempDir::new().unwrap();
        let mut defaulted = payload("shot", "aGVsbG8=", "base64");
        defaulted.default_content_type = Some("image/png".to_string());
        let by_extension = payload("photo.jpeg", "aGVsbG8=", "base64");
        let unknown = payload("blob", "aGVsbG8=", "base64");

        let attachments = persist_artifacts(dir.path(), &[defaulted, by_extension, unknown]).unwrap();
        assert_eq!(attachments[0].path, "artifacts/shot.png");
        assert_eq!(attachments[0].content_type, "image/png");
        assert_eq!(attachments[1].content_type, "image/jpeg");
        assert_eq!(attachments[2].content_type, OCTET_STREAM);
    }

    #[test]
    fn test_persist_fails_batch_on_bad_payload() {
        let dir = TempDir::new().unwrap();
        let err = persist_artifacts(
            dir.path(),
            &[payload("ok.txt", "fine", "plain"), payload("bad.bin", "%%%", "base64")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("artifact 1"));
    }

    #[test]
    fn test_validate_attachment_path() {
        assert_eq!(validate_attachment_path("artifacts/a.txt").unwrap(), "artifacts/a.txt");
        assert_eq!(validate_attachment_path("artifacts\\b.txt").unwrap(), "artifacts/b.txt");
        assert_eq!(validate_attachment_path("./x/../artifacts/c").unwrap(), "artifacts/c");
        assert!(validate_attachment_path("../metadata.yaml").is_err());
        assert!(validate_attachment_path("artifacts/../../etc").is_err());
        assert!(validate_attachment_path("/etc/passwd").is_err());
        assert!(validate_attachment_path("C:/windows").is_err());
        assert!(validate_attachment_path("").is_err());
    }
}
