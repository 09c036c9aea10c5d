//! Issue commands: create, update, delete, list, show.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

use super::{CommandResult, json_string};
use crate::events::Event;
use crate::lifecycle::Lifecycle;
use crate::models::{Attachment, Issue, IssueStatus, Reporter};
use crate::storage::artifacts::{ArtifactPayload, persist_artifacts, validate_attachment_path};
use crate::storage::IssueStore;
use crate::{Error, Result};

/// Attachment in the legacy `attachments` list of a create request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyAttachment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "type")]
    pub content_type: String,
    #[serde(default)]
    pub encoding: String,
}

/// Body of an issue create request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateIssueRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type", alias = "issue_type")]
    pub issue_type: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub reporter: Option<Reporter>,

    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub error_logs: String,
    #[serde(default)]
    pub stack_trace: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub affected_components: Vec<String>,
    #[serde(default)]
    pub environment_info: BTreeMap<String, String>,

    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub watchers: Vec<String>,
    #[serde(default)]
    pub notes: String,

    #[serde(default)]
    pub artifacts: Vec<ArtifactPayload>,
    #[serde(default)]
    pub app_logs: Option<String>,
    #[serde(default)]
    pub console_logs: Option<String>,
    #[serde(default)]
    pub network_logs: Option<String>,
    #[serde(default)]
    pub screenshot_data: Option<String>,
    #[serde(default)]
    pub screenshot_content_type: Option<String>,
    #[serde(default)]
    pub screenshot_filename: Option<String>,
    #[serde(default)]
    pub attachments: Vec<LegacyAttachment>,
}

impl CreateIssueRequest {
    /// All artifact payloads in merge order: explicit artifacts, the three
    /// log shorthands, the screenshot, then legacy attachments.
    pub fn artifact_payloads(&self) -> Vec<ArtifactPayload> {
        let mut payloads = self.artifacts.clone();

        let logs = [
            (&self.app_logs, "app-logs", "logs"),
            (&self.console_logs, "console-logs", "console"),
            (&self.network_logs, "network-logs", "network"),
        ];
        for (content, name, category) in logs {
            if let Some(content) = content.as_deref().filter(|c| !c.trim().is_empty()) {
                payloads.push(ArtifactPayload {
                    name: name.to_string(),
                    category: category.to_string(),
                    content: content.to_string(),
                    encoding: "plain".to_string(),
                    content_type: String::new(),
                    default_content_type: Some("text/plain".to_string()),
                });
            }
        }

        if let Some(data) = self.screenshot_data.as_deref().filter(|d| !d.trim().is_empty()) {
            payloads.push(ArtifactPayload {
                name: self
                    .screenshot_filename
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| "screenshot".to_string()),
                category: "screenshot".to_string(),
                content: data.to_string(),
                encoding: "base64".to_string(),
                content_type: self.screenshot_content_type.clone().unwrap_or_default(),
                default_content_type: Some("image/png".to_string()),
            });
        }

        for legacy in &self.attachments {
            payloads.push(ArtifactPayload {
                name: legacy.name.clone(),
                category: "attachment".to_string(),
                content: legacy.content.clone(),
                encoding: if legacy.encoding.trim().is_empty() {
                    "plain".to_string()
                } else {
                    legacy.encoding.clone()
                },
                content_type: legacy.content_type.clone(),
                default_content_type: None,
            });
        }

        payloads
    }
}

/// Body of an issue update request. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateIssueRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type", alias = "issue_type")]
    pub issue_type: Option<String>,
    pub priority: Option<String>,
    pub app_id: Option<String>,
    pub status: Option<String>,
    pub notes: Option<String>,
    pub reporter: Option<Reporter>,
    pub error_message: Option<String>,
    pub error_logs: Option<String>,
    pub stack_trace: Option<String>,
    pub affected_files: Option<Vec<String>>,
    pub affected_components: Option<Vec<String>>,
    pub environment_info: Option<BTreeMap<String, String>>,
    pub tags: Option<Vec<String>>,
    pub labels: Option<BTreeMap<String, String>>,
    pub watchers: Option<Vec<String>>,
    /// Replaces the attachment list; every path is validated
    pub attachments: Option<Vec<Attachment>>,
    /// New artifacts appended to the attachment list
    #[serde(default)]
    pub artifacts: Vec<ArtifactPayload>,
}

impl UpdateIssueRequest {
    /// Request that only changes the status.
    pub fn status(status: IssueStatus) -> Self {
        Self {
            status: Some(status.as_str().to_string()),
            ..Self::default()
        }
    }

    /// Apply non-status fields; returns whether anything changed.
    fn apply(&self, issue: &mut Issue) -> Result<bool> {
        let before = issue.clone();

        if let Some(title) = &self.title {
            let title = title.trim();
            if title.is_empty() {
                return Err(Error::InvalidInput("title must not be empty".to_string()));
            }
            issue.title = title.to_string();
        }
        set_trimmed(&mut issue.description, &self.description);
        set_trimmed(&mut issue.issue_type, &self.issue_type);
        set_trimmed(&mut issue.priority, &self.priority);
        set_trimmed(&mut issue.app_id, &self.app_id);
        set_trimmed(&mut issue.notes, &self.notes);
        if let Some(reporter) = &self.reporter {
            issue.reporter = reporter.clone();
        }

        let ctx = &mut issue.error_context;
        set_trimmed(&mut ctx.error_message, &self.error_message);
        set_trimmed(&mut ctx.error_logs, &self.error_logs);
        set_trimmed(&mut ctx.stack_trace, &self.stack_trace);
        if let Some(files) = &self.affected_files {
            ctx.affected_files = files.clone();
        }
        if let Some(components) = &self.affected_components {
            ctx.affected_components = components.clone();
        }
        if let Some(env) = &self.environment_info {
            ctx.environment_info = env.clone();
        }

        if let Some(tags) = &self.tags {
            issue.metadata.tags = tags.clone();
        }
        if let Some(labels) = &self.labels {
            issue.metadata.labels = labels.clone();
        }
        if let Some(watchers) = &self.watchers {
            issue.metadata.watchers = watchers.clone();
        }
        if let Some(attachments) = &self.attachments {
            let mut validated = Vec::with_capacity(attachments.len());
            for attachment in attachments {
                let mut attachment = attachment.clone();
                attachment.path = validate_attachment_path(&attachment.path)?;
                validated.push(attachment);
            }
            issue.attachments = validated;
        }

        Ok(*issue != before)
    }
}

fn set_trimmed(field: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        *field = value.trim().to_string();
    }
}

/// Create an issue in `open`: artifacts first, then metadata, then the event.
pub fn create(lifecycle: &Lifecycle, request: &CreateIssueRequest) -> Result<Issue> {
    let title = request.title.trim();
    if title.is_empty() {
        return Err(Error::InvalidInput("title is required".to_string()));
    }

    let store = lifecycle.store();
    let id = store.generate_issue_id(title)?;
    let mut issue = Issue::new(id.clone(), title.to_string());
    issue.description = request.description.trim().to_string();
    issue.issue_type = request.issue_type.trim().to_string();
    issue.priority = request.priority.trim().to_string();
    issue.app_id = request.app_id.trim().to_string();
    issue.notes = request.notes.clone();
    if let Some(reporter) = &request.reporter {
        issue.reporter = reporter.clone();
        if issue.reporter.timestamp.is_none() {
            issue.reporter.timestamp = Some(issue.metadata.created_at);
        }
    }

    let ctx = &mut issue.error_context;
    ctx.error_message = request.error_message.trim().to_string();
    ctx.error_logs = request.error_logs.clone();
    ctx.stack_trace = request.stack_trace.clone();
    ctx.affected_files = request.affected_files.clone();
    ctx.affected_components = request.affected_components.clone();
    ctx.environment_info = request.environment_info.clone();

    issue.metadata.tags = request.tags.clone();
    issue.metadata.labels = request.labels.clone();
    issue.metadata.watchers = request.watchers.clone();

    let dir = store.issue_dir(IssueStatus::Open, &id);
    fs::create_dir_all(&dir)?;
    match persist_artifacts(&dir, &request.artifact_payloads()) {
        Ok(attachments) => issue.attachments = attachments,
        Err(e) => {
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                tracing::warn!(issue_id = %id, error = %cleanup, "failed to clean up after artifact error");
            }
            return Err(e);
        }
    }

    store.save(&issue, IssueStatus::Open)?;
    tracing::info!(issue_id = %id, attachments = issue.attachments.len(), "issue created");
    lifecycle.publish(Event::issue_created(&issue));
    Ok(issue)
}

/// Update an issue's fields and, if requested, its status.
///
/// Field edits publish `issue.updated`; a status change publishes only
/// `issue.status_changed`.
pub fn update(lifecycle: &Lifecycle, id: &str, request: &UpdateIssueRequest) -> Result<Issue> {
    let target = request
        .status
        .as_deref()
        .map(str::parse::<IssueStatus>)
        .transpose()?;

    lifecycle.update(id, target, |issue, dir| {
        let mut changed = request.apply(issue)?;
        if !request.artifacts.is_empty() {
            let added = persist_artifacts(dir, &request.artifacts)?;
            issue.attachments.extend(added);
            changed = true;
        }
        Ok(changed)
    })
}

/// Delete an issue no agent is working on.
pub fn delete(lifecycle: &Lifecycle, id: &str) -> Result<Issue> {
    lifecycle.delete(id)
}

/// List issues, newest first, optionally filtered by status and truncated.
pub fn list(store: &IssueStore, status: Option<&str>, limit: Option<usize>) -> Result<Vec<Issue>> {
    let status = status
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<IssueStatus>)
        .transpose()?;
    let mut issues = store.list(status)?;
    if let Some(limit) = limit.filter(|l| *l > 0) {
        issues.truncate(limit);
    }
    Ok(issues)
}

/// A single issue, as printed by the CLI.
pub struct IssueShow {
    pub issue: Issue,
}

impl CommandResult for IssueShow {
    fn to_json(&self) -> String {
        json_string(&self.issue)
    }

    fn to_human(&self) -> String {
        let issue = &self.issue;
        let mut lines = vec![
            format!("{} [{}] {}", issue.id, issue.status, issue.title),
        ];
        if !issue.issue_type.is_empty() || !issue.priority.is_empty() {
            lines.push(format!("  Type: {}  Priority: {}", issue.issue_type, issue.priority));
        }
        if !issue.app_id.is_empty() {
            lines.push(format!("  App: {}", issue.app_id));
        }
        lines.push(format!(
            "  Created: {}  Updated: {}",
            issue.metadata.created_at.format("%Y-%m-%d %H:%M:%S"),
            issue.metadata.updated_at.format("%Y-%m-%d %H:%M:%S")
        ));
        if let Some(resolved) = issue.metadata.resolved_at {
            lines.push(format!("  Resolved: {}", resolved.format("%Y-%m-%d %H:%M:%S")));
        }
        if !issue.error_context.error_message.is_empty() {
            lines.push(format!("  Error: {}", issue.error_context.error_message));
        }
        if !issue.investigation.root_cause.is_empty() {
            lines.push(format!("  Root cause: {}", issue.investigation.root_cause));
        }
        for attachment in &issue.attachments {
            lines.push(format!(
                "  Attachment: {} ({}, {} bytes)",
                attachment.path, attachment.content_type, attachment.size
            ));
        }
        if !issue.description.is_empty() {
            lines.push(String::new());
            lines.push(issue.description.clone());
        }
        lines.join("\n")
    }
}

/// Result of `issue list`.
#[derive(Serialize)]
pub struct IssueList {
    pub issues: Vec<Issue>,
    pub count: usize,
}

impl IssueList {
    pub fn new(issues: Vec<Issue>) -> Self {
        let count = issues.len();
        Self { issues, count }
    }
}

impl CommandResult for IssueList {
    fn to_json(&self) -> String {
        json_string(self)
    }

    fn to_human(&self) -> String {
        if self.issues.is_empty() {
            return "No issues found.".to_string();
        }
        let mut lines = vec![format!("{} issue(s):", self.count)];
        for issue in &self.issues {
            lines.push(format!(
                "  {} [{}] {} ({})",
                issue.id,
                issue.status,
                issue.title,
                issue.metadata.created_at.format("%Y-%m-%d %H:%M")
            ));
        }
        lines.join("\n")
    }
}

/// Result of a status move or a delete.
#[derive(Serialize)]
pub struct IssueChanged {
    pub id: String,
    pub action: &'static str,
    pub status: IssueStatus,
}

impl CommandResult for IssueChanged {
    fn to_json(&self) -> String {
        json_string(self)
    }

    fn to_human(&self) -> String {
        format!("{} {} ({})", self.action, self.id, self.status)
    }
}

/// Stamp for reporters that omit a timestamp, used by the CLI.
pub fn cli_reporter(name: Option<String>, email: Option<String>) -> Option<Reporter> {
    if name.is_none() && email.is_none() {
        return None;
    }
    Some(Reporter {
        name: name.unwrap_or_default(),
        email: email.unwrap_or_default(),
        user_id: None,
        timestamp: Some(Utc::now()),
    })
}
