//! Storage layer for issues.
//!
//! Issues are stored as directories under one folder per status:
//!
//! ```text
//! <data_dir>/
//!   open/issue-1a2b3c4d/metadata.yaml
//!   open/issue-1a2b3c4d/artifacts/error.log
//!   active/...
//!   waiting/ completed/ failed/ archived/
//! ```
//!
//! The folder an issue lives in is its status. A status change is a single
//! directory rename followed by a metadata rewrite; the rename is the commit
//! point. The store assumes one writer process per data directory.

pub mod artifacts;

use crate::lifecycle::apply_transition_fields;
use crate::models::{Issue, IssueStatus};
use crate::{Error, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the metadata file inside each issue directory.
pub const METADATA_FILE: &str = "metadata.yaml";

/// Name of the attachment directory inside each issue directory.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Prefix of generated issue ids.
pub const ISSUE_ID_PREFIX: &str = "issue";

/// Result of [`IssueStore::move_issue`].
#[derive(Debug, Clone)]
pub struct MoveOutcome {
    /// The issue as persisted after the move
    pub issue: Issue,
    pub from: IssueStatus,
    pub to: IssueStatus,
    /// False when the issue was already in the target folder
    pub moved: bool,
}

/// Filesystem-backed issue repository.
#[derive(Debug, Clone)]
pub struct IssueStore {
    root: PathBuf,
}

impl IssueStore {
    /// Open the store at `data_dir`, creating the status folders as needed.
    pub fn open(data_dir: &Path) -> Result<Self> {
        for status in IssueStatus::ALL {
            fs::create_dir_all(data_dir.join(status.as_str()))?;
        }
        Ok(Self {
            root: data_dir.to_path_buf(),
        })
    }

    /// Root of the data directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder holding all issues with `status`.
    pub fn status_dir(&self, status: IssueStatus) -> PathBuf {
        self.root.join(status.as_str())
    }

    /// Directory an issue with `id` would occupy in `status`.
    pub fn issue_dir(&self, status: IssueStatus, id: &str) -> PathBuf {
        self.status_dir(status).join(id)
    }

    /// Resolve the directory and status an issue currently lives in.
    ///
    /// Folders are searched in [`IssueStatus::ALL`] order. Within a folder a
    /// directory named after the id wins; otherwise entries are scanned and
    /// matched on the persisted `id` field.
    pub fn locate(&self, id: &str) -> Result<(PathBuf, IssueStatus)> {
        validate_issue_id(id)?;

        for status in IssueStatus::ALL {
            let direct = self.issue_dir(status, id);
            if direct.join(METADATA_FILE).is_file() {
                return Ok((direct, status));
            }

            let entries = match fs::read_dir(self.status_dir(status)) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let matches = read_issue_dir(&path)
                    .map(|issue| issue.id == id)
                    .unwrap_or(false);
                if matches {
                    return Ok((path, status));
                }
            }
        }

        Err(Error::NotFound(id.to_string()))
    }

    /// Load an issue and the status folder it was found in.
    pub fn load(&self, id: &str) -> Result<(Issue, IssueStatus)> {
        let (dir, status) = self.locate(id)?;
        let mut issue = read_issue_dir(&dir)?;
        issue.status = status;
        Ok((issue, status))
    }

    /// Check whether an issue exists anywhere in the store.
    pub fn exists(&self, id: &str) -> Result<bool> {
        match self.locate(id) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List issues, newest first.
    ///
    /// Entries that cannot be read are skipped with a warning.
    pub fn list(&self, status: Option<IssueStatus>) -> Result<Vec<Issue>> {
        let statuses: Vec<IssueStatus> = match status {
            Some(status) => vec![status],
            None => IssueStatus::ALL.to_vec(),
        };

        let mut issues = Vec::new();
        for status in statuses {
            let dir = self.status_dir(status);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                match read_issue_dir(&path) {
                    Ok(mut issue) => {
                        issue.status = status;
                        issues.push(issue);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable issue");
                    }
                }
            }
        }

        issues.sort_by(|a, b| b.metadata.created_at.cmp(&a.metadata.created_at));
        Ok(issues)
    }

    /// Write an issue into `status`, creating its directory if absent.
    pub fn save(&self, issue: &Issue, status: IssueStatus) -> Result<PathBuf> {
        validate_issue_id(&issue.id)?;
        let dir = self.issue_dir(status, &issue.id);
        fs::create_dir_all(&dir)?;

        let mut record = issue.clone();
        record.status = status;
        write_metadata(&dir, &record)?;
        Ok(dir)
    }

    /// Rewrite an issue's metadata where it currently lives.
    ///
    /// The persisted status is forced to the folder the issue was found in.
    pub fn save_in_place(&self, issue: &mut Issue) -> Result<IssueStatus> {
        let (dir, status) = self.locate(&issue.id)?;
        issue.status = status;
        write_metadata(&dir, issue)?;
        Ok(status)
    }

    /// Fail with `Conflict` if the `to` folder already holds a directory for `id`.
    pub fn ensure_vacant(&self, id: &str, to: IssueStatus) -> Result<()> {
        let dest = self.issue_dir(to, id);
        match fs::symlink_metadata(&dest) {
            Ok(_) => Err(Error::Conflict(format!("issue {} already exists in {}", id, to))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Conflict(format!(
                "cannot inspect destination {}: {}",
                dest.display(),
                e
            ))),
        }
    }

    /// Move an issue to another status folder.
    ///
    /// Moving to the current folder is a no-op that leaves `updated_at`
    /// untouched. A pre-existing destination directory is a conflict.
    pub fn move_issue(&self, id: &str, to: IssueStatus) -> Result<MoveOutcome> {
        let (src, from) = self.locate(id)?;
        let mut issue = read_issue_dir(&src)?;

        if from == to {
            issue.status = from;
            return Ok(MoveOutcome {
                issue,
                from,
                to,
                moved: false,
            });
        }

        let now = Utc::now();
        apply_transition_fields(&mut issue, from, to, now);
        issue.status = to;
        issue.metadata.updated_at = now;

        fs::create_dir_all(self.status_dir(to))?;
        self.ensure_vacant(&issue.id, to)?;
        let dest = self.issue_dir(to, &issue.id);

        fs::rename(&src, &dest)?;
        write_metadata(&dest, &issue)?;

        tracing::debug!(issue_id = %issue.id, %from, %to, "moved issue");
        Ok(MoveOutcome {
            issue,
            from,
            to,
            moved: true,
        })
    }

    /// Remove an issue directory recursively.
    ///
    /// Partial removal is tolerated as long as the metadata file is gone,
    /// since the issue can no longer be resolved afterwards.
    pub fn delete(&self, id: &str) -> Result<(Issue, IssueStatus)> {
        let (dir, status) = self.locate(id)?;
        let mut issue = read_issue_dir(&dir)?;
        issue.status = status;

        if let Err(e) = fs::remove_dir_all(&dir) {
            tracing::warn!(issue_id = %id, error = %e, "issue directory not fully removed");
            let metadata = dir.join(METADATA_FILE);
            if metadata.exists() {
                fs::remove_file(&metadata)?;
            }
        }

        Ok((issue, status))
    }

    /// Generate an id that is not used by any stored issue.
    pub fn generate_issue_id(&self, seed: &str) -> Result<String> {
        loop {
            let id = generate_id(ISSUE_ID_PREFIX, seed);
            if !self.exists(&id)? {
                return Ok(id);
            }
        }
    }

    /// Count issues per status folder.
    pub fn stats(&self) -> Result<BTreeMap<&'static str, usize>> {
        let mut counts = BTreeMap::new();
        for status in IssueStatus::ALL {
            let count = match fs::read_dir(self.status_dir(status)) {
                Ok(entries) => entries
                    .flatten()
                    .filter(|e| e.path().join(METADATA_FILE).is_file())
                    .count(),
                Err(_) => 0,
            };
            counts.insert(status.as_str(), count);
        }
        Ok(counts)
    }

    /// Resolve an attachment path of an issue to an absolute file path.
    pub fn attachment_path(&self, id: &str, relative: &str) -> Result<PathBuf> {
        let (dir, _) = self.locate(id)?;
        let relative = artifacts::validate_attachment_path(relative)?;
        Ok(dir.join(relative))
    }
}

/// Read `metadata.yaml` from an issue directory.
pub fn read_issue_dir(dir: &Path) -> Result<Issue> {
    let content = fs::read_to_string(dir.join(METADATA_FILE))?;
    let issue: Issue = serde_yaml::from_str(&content)?;
    Ok(issue)
}

/// Write `metadata.yaml` atomically (temp file + rename in the same directory).
fn write_metadata(dir: &Path, issue: &Issue) -> Result<()> {
    let yaml = serde_yaml::to_string(issue)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(yaml.as_bytes())?;
    tmp.flush()?;
    tmp.persist(dir.join(METADATA_FILE))
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Reject ids that cannot be used as a single directory name.
pub fn validate_issue_id(id: &str) -> Result<()> {
    let trimmed = id.trim();
    if trimmed.is_empty()
        || trimmed != id
        || id == "."
        || id == ".."
        || id.contains('/')
        || id.contains('\\')
    {
        return Err(Error::InvalidInput(format!("Invalid issue id: '{}'", id)));
    }
    Ok(())
}

/// Generate a unique ID.
///
/// Format: `<prefix>-<8 hex chars>`
pub fn generate_id(prefix: &str, seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(0)
            .to_le_bytes(),
    );
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    let hash = hasher.finalize();
    let hash_hex = format!("{:x}", hash);
    format!("{}-{}", prefix, &hash_hex[..8])
}
