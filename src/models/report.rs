//! The JSON report an agent prints on stdout when a run succeeds.
//!
//! ```json
//! {"issue_id": "issue-1a2b3c4d", "status": "completed",
//!  "investigation": {"report": "...", "root_cause": "...", "confidence_score": 8},
//!  "fix": {"summary": "...", "test_plan": "...", "status": "generated"}}
//! ```
//!
//! Every field is optional; absent or empty values leave the issue untouched.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::IssueStatus;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentReport {
    pub issue_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
    pub investigation: Option<ReportInvestigation>,
    pub fix: Option<ReportFix>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReportInvestigation {
    pub report: Option<String>,
    pub root_cause: Option<String>,
    pub suggested_fix: Option<String>,
    pub confidence_score: Option<i64>,
    pub affected_files: Vec<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReportFix {
    pub summary: Option<String>,
    pub implementation_plan: Option<String>,
    pub test_plan: Option<String>,
    pub rollback_plan: Option<String>,
    pub status: Option<String>,
}

impl AgentReport {
    /// Parse the agent's stdout as a single JSON document.
    pub fn parse(stdout: &str) -> Result<Self> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("agent produced no report".to_string()));
        }
        serde_json::from_str(trimmed)
            .map_err(|e| Error::InvalidInput(format!("malformed agent report: {}", e)))
    }

    /// Map the reported status onto the status the issue should end in.
    ///
    /// `completed|success` finish the issue, `failed|error|cancelled|canceled`
    /// fail it, anything else keeps it `active`. A generated or completed fix
    /// upgrades `active` to `completed`, as does `auto_resolve`.
    pub fn final_status(&self, auto_resolve: bool) -> IssueStatus {
        let reported = self
            .status
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .unwrap_or_default();

        let mut status = match reported.as_str() {
            "completed" | "success" => IssueStatus::Completed,
            "failed" | "error" | "cancelled" | "canceled" => IssueStatus::Failed,
            _ => IssueStatus::Active,
        };

        let fix_done = self
            .fix
            .as_ref()
            .and_then(|fix| fix.status.as_deref())
            .map(|s| matches!(s.trim().to_lowercase().as_str(), "generated" | "completed"))
            .unwrap_or(false);

        if status == IssueStatus::Active && (fix_done || auto_resolve) {
            status = IssueStatus::Completed;
        }
        status
    }
}

/// Return the trimmed value when it carries content.
pub fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Parse an agent-supplied RFC 3339 timestamp, ignoring malformed values.
pub fn parse_timestamp(value: &Option<String>) -> Option<DateTime<Utc>> {
    non_empty(value)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
