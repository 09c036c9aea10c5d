//! Data models for tracked issues.
//!
//! This module defines the core data structures:
//! - `Issue` - The root aggregate persisted as `metadata.yaml`
//! - `IssueStatus` - The status value, which doubles as the on-disk folder name
//! - `Attachment` - A file stored under the issue's `artifacts/` directory
//! - `Reporter`, `ErrorContext`, `Investigation`, `Fix`, `IssueMetadata` - nested records

pub mod prompts;
pub mod report;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// Deadline after which a rate-limited issue may return to `open`.
pub const EXTRA_RATE_LIMIT_UNTIL: &str = "rate_limit_until";
/// Agent that hit the rate limit.
pub const EXTRA_RATE_LIMIT_AGENT: &str = "rate_limit_agent";
/// Last error reported by an agent run.
pub const EXTRA_AGENT_LAST_ERROR: &str = "agent_last_error";
/// Classification of the last failed agent run.
pub const EXTRA_AGENT_LAST_STATUS: &str = "agent_last_status";
/// When the last agent failure was recorded.
pub const EXTRA_AGENT_FAILURE_TIME: &str = "agent_failure_time";
/// Transcript written for the last agent run, relative to the scenario root.
pub const EXTRA_AGENT_TRANSCRIPT_PATH: &str = "agent_transcript_path";
/// Test plan produced by the agent.
pub const EXTRA_TEST_PLAN: &str = "test_plan";
/// Run id of the most recent investigation.
pub const EXTRA_RUN_ID: &str = "run_id";

/// Scheduler hints purged when an issue is moved back to `open`.
pub const RESET_EXTRA_KEYS: &[&str] = &[
    EXTRA_AGENT_LAST_ERROR,
    EXTRA_AGENT_LAST_STATUS,
    EXTRA_AGENT_FAILURE_TIME,
    EXTRA_RATE_LIMIT_UNTIL,
    EXTRA_RATE_LIMIT_AGENT,
];

/// Issue status in the workflow.
///
/// Every status has a folder of the same name under the data directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    #[default]
    Open,
    Active,
    Waiting,
    Completed,
    Failed,
    Archived,
}

impl IssueStatus {
    /// All statuses, in the order folders are searched when resolving an id.
    pub const ALL: [IssueStatus; 6] = [
        IssueStatus::Open,
        IssueStatus::Active,
        IssueStatus::Waiting,
        IssueStatus::Completed,
        IssueStatus::Failed,
        IssueStatus::Archived,
    ];

    /// Folder / wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::Active => "active",
            IssueStatus::Waiting => "waiting",
            IssueStatus::Completed => "completed",
            IssueStatus::Failed => "failed",
            IssueStatus::Archived => "archived",
        }
    }

    /// Whether moving from `self` to `to` rewinds the issue for a fresh run.
    pub fn is_backward_to(&self, to: IssueStatus) -> bool {
        to == IssueStatus::Open
            && matches!(
                self,
                IssueStatus::Active | IssueStatus::Completed | IssueStatus::Failed
            )
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for IssueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(IssueStatus::Open),
            "active" => Ok(IssueStatus::Active),
            "waiting" => Ok(IssueStatus::Waiting),
            "completed" => Ok(IssueStatus::Completed),
            "failed" => Ok(IssueStatus::Failed),
            "archived" => Ok(IssueStatus::Archived),
            other => Err(Error::InvalidInput(format!(
                "Invalid status: '{}' (expected one of open, active, waiting, completed, failed, archived)",
                other
            ))),
        }
    }
}

/// Who reported the issue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reporter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// When the report was submitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Error details captured with the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_logs: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stack_trace: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_files: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_components: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_info: BTreeMap<String, String>,
}

/// Results of an agent investigation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Investigation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Narrative report produced by the agent
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub report: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root_cause: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub suggested_fix: String,

    /// Agent confidence, 0-10
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub investigation_duration_minutes: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<f64>,
}

/// Remediation state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub suggested_fix: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub implementation_plan: String,

    #[serde(default)]
    pub applied: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit_hash: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pr_url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub verification_status: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rollback_plan: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_duration_minutes: Option<i64>,
}

/// A file stored with the issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Display name
    pub name: String,

    /// MIME content type
    #[serde(rename = "type")]
    pub content_type: String,

    /// Path relative to the issue directory, always with forward slashes
    pub path: String,

    /// Size in bytes
    #[serde(default)]
    pub size: u64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
}

/// Bookkeeping timestamps, labels and scheduler hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueMetadata {
    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Set on the first transition into `completed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watchers: Vec<String>,

    /// Open-ended hints (see the `EXTRA_*` constants)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// A tracked issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Unique identifier (e.g., "issue-1a2b3c4d")
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub description: String,

    /// Free-form kind, e.g. "bug" or "feature"
    #[serde(rename = "type", default)]
    pub issue_type: String,

    #[serde(default)]
    pub priority: String,

    #[serde(default)]
    pub app_id: String,

    /// Always equal to the folder the issue lives in
    #[serde(default)]
    pub status: IssueStatus,

    #[serde(default)]
    pub reporter: Reporter,

    #[serde(default)]
    pub error_context: ErrorContext,

    #[serde(default)]
    pub investigation: Investigation,

    #[serde(default)]
    pub fix: Fix,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    #[serde(default)]
    pub metadata: IssueMetadata,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

impl Issue {
    /// Create a new open issue with both timestamps set to now.
    pub fn new(id: String, title: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            description: String::new(),
            issue_type: String::new(),
            priority: String::new(),
            app_id: String::new(),
            status: IssueStatus::default(),
            reporter: Reporter::default(),
            error_context: ErrorContext::default(),
            investigation: Investigation::default(),
            fix: Fix::default(),
            attachments: Vec::new(),
            metadata: IssueMetadata {
                created_at: now,
                updated_at: now,
                ..IssueMetadata::default()
            },
            notes: String::new(),
        }
    }

    /// Read a scheduler hint.
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.metadata.extra.get(key).map(String::as_str)
    }

    /// Set a scheduler hint.
    pub fn set_extra(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.extra.insert(key.to_string(), value.into());
    }

    /// Remove a scheduler hint.
    pub fn clear_extra(&mut self, key: &str) {
        self.metadata.extra.remove(key);
    }

    /// Refresh `metadata.updated_at`.
    pub fn touch(&mut self) {
        self.metadata.updated_at = Utc::now();
    }
}
