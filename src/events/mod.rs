//! Lifecycle events published to observers.
//!
//! Every event is serialized as an envelope:
//!
//! ```json
//! {"type": "issue.status_changed", "timestamp": "2030-01-02T03:04:05Z",
//!  "data": {"issue_id": "issue-1a2b3c4d", "old_status": "open", "new_status": "active"}}
//! ```

mod hub;

pub use hub::{EventHub, Subscription, EVENT_BUFFER};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::rate_limit::RateLimitStatus;
use crate::models::{Issue, IssueStatus};
use crate::processor::ProcessorState;

/// `{issue_id, old_status, new_status}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub issue_id: String,
    pub old_status: IssueStatus,
    pub new_status: IssueStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueDeleted {
    pub issue_id: String,
    pub status: IssueStatus,
}

/// `{issue_id, agent_id, start_time}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStarted {
    pub issue_id: String,
    pub agent_id: String,
    pub start_time: DateTime<Utc>,
    pub run_id: String,
}

/// `{issue_id, agent_id, success, end_time, new_status}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFinished {
    pub issue_id: String,
    pub agent_id: String,
    pub success: bool,
    pub end_time: DateTime<Utc>,
    pub new_status: IssueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event payload, tagged by its wire type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventKind {
    #[serde(rename = "issue.created")]
    IssueCreated(Box<Issue>),
    #[serde(rename = "issue.updated")]
    IssueUpdated(Box<Issue>),
    #[serde(rename = "issue.status_changed")]
    IssueStatusChanged(StatusChange),
    #[serde(rename = "issue.deleted")]
    IssueDeleted(IssueDeleted),
    #[serde(rename = "agent.started")]
    AgentStarted(AgentStarted),
    #[serde(rename = "agent.completed")]
    AgentCompleted(AgentFinished),
    #[serde(rename = "agent.failed")]
    AgentFailed(AgentFinished),
    #[serde(rename = "processor.state_changed")]
    ProcessorStateChanged(ProcessorState),
    #[serde(rename = "rate_limit.changed")]
    RateLimitChanged(RateLimitStatus),
}

impl EventKind {
    /// Wire name of the event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::IssueCreated(_) => "issue.created",
            EventKind::IssueUpdated(_) => "issue.updated",
            EventKind::IssueStatusChanged(_) => "issue.status_changed",
            EventKind::IssueDeleted(_) => "issue.deleted",
            EventKind::AgentStarted(_) => "agent.started",
            EventKind::AgentCompleted(_) => "agent.completed",
            EventKind::AgentFailed(_) => "agent.failed",
            EventKind::ProcessorStateChanged(_) => "processor.state_changed",
            EventKind::RateLimitChanged(_) => "rate_limit.changed",
        }
    }
}

/// A timestamped event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn issue_created(issue: &Issue) -> Self {
        Self::new(EventKind::IssueCreated(Box::new(issue.clone())))
    }

    pub fn issue_updated(issue: &Issue) -> Self {
        Self::new(EventKind::IssueUpdated(Box::new(issue.clone())))
    }

    pub fn status_changed(issue_id: &str, old_status: IssueStatus, new_status: IssueStatus) -> Self {
        Self::new(EventKind::IssueStatusChanged(StatusChange {
            issue_id: issue_id.to_string(),
            old_status,
            new_status,
        }))
    }

    pub fn issue_deleted(issue_id: &str, status: IssueStatus) -> Self {
        Self::new(EventKind::IssueDeleted(IssueDeleted {
            issue_id: issue_id.to_string(),
            status,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let event = Event::status_changed("issue-1", IssueStatus::Open, IssueStatus::Active);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "issue.status_changed");
        assert_eq!(value["data"]["issue_id"], "issue-1");
        assert_eq!(value["data"]["old_status"], "open");
        assert_eq!(value["data"]["new_status"], "active");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let event = Event::new(EventKind::AgentFailed(AgentFinished {
            issue_id: "issue-1".to_string(),
            agent_id: "unified-resolver".to_string(),
            success: false,
            end_time: Utc::now(),
            new_status: IssueStatus::Failed,
            error: Some("boom".to_string()),
        }));
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.type_name(), "agent.failed");
    }
}
