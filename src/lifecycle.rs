//! Issue state machine.
//!
//! Every status change goes through [`Lifecycle`], which couples the folder
//! move in [`IssueStore`] with the running-agent guard in
//! [`ProcessRegistry`] and publishes the resulting events.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

use crate::agents::registry::{ProcessRegistry, RunningProcess};
use crate::events::{Event, EventHub};
use crate::models::{Fix, Investigation, Issue, IssueStatus, RESET_EXTRA_KEYS};
use crate::storage::{IssueStore, MoveOutcome};
use crate::{Error, Result};

/// Apply the field updates that accompany a move from `from` to `to`.
///
/// Backward moves to `open` clear the investigation, the fix, the resolved
/// timestamp and the scheduler hints. Entering `active` stamps
/// `investigation.started_at` and entering `completed` stamps
/// `metadata.resolved_at`, each only if unset.
pub fn apply_transition_fields(issue: &mut Issue, from: IssueStatus, to: IssueStatus, now: DateTime<Utc>) {
    if from.is_backward_to(to) {
        issue.investigation = Investigation::default();
        issue.fix = Fix::default();
        issue.metadata.resolved_at = None;
        for key in RESET_EXTRA_KEYS {
            issue.clear_extra(key);
        }
    }
    if to == IssueStatus::Active && issue.investigation.started_at.is_none() {
        issue.investigation.started_at = Some(now);
    }
    if to == IssueStatus::Completed && issue.metadata.resolved_at.is_none() {
        issue.metadata.resolved_at = Some(now);
    }
}

/// Couples the store, the running-agent registry and the event hub.
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<IssueStore>,
    hub: EventHub,
    registry: ProcessRegistry,
}

impl Lifecycle {
    pub fn new(store: Arc<IssueStore>, hub: EventHub, registry: ProcessRegistry) -> Self {
        Self {
            store,
            hub,
            registry,
        }
    }

    pub fn store(&self) -> &IssueStore {
        &self.store
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn publish(&self, event: Event) {
        self.hub.publish(event);
    }

    /// User-requested status change.
    ///
    /// While an agent is registered for the issue, `active` is the only
    /// permitted target. The registry stays read-locked across the check and
    /// the move so no run can start in between.
    pub fn transition(&self, id: &str, to: IssueStatus) -> Result<MoveOutcome> {
        let running = self.registry.read();
        if running.contains_key(id) && to != IssueStatus::Active {
            return Err(Error::Conflict(format!(
                "an agent is running for {}; it can only stay active",
                id
            )));
        }
        let outcome = self.store.move_issue(id, to)?;
        drop(running);

        self.announce_move(&outcome);
        Ok(outcome)
    }

    /// Apply `edit` and then move the issue to `target`, as one step.
    ///
    /// The running-agent guard and the destination folder are checked before
    /// anything is written, so a rejected move leaves the issue untouched.
    /// `edit` receives the issue directory and returns whether it changed
    /// anything; changes publish `issue.updated`.
    pub fn update<F>(&self, id: &str, target: Option<IssueStatus>, edit: F) -> Result<Issue>
    where
        F: FnOnce(&mut Issue, &Path) -> Result<bool>,
    {
        let running = self.registry.read();
        if let Some(to) = target {
            if running.contains_key(id) && to != IssueStatus::Active {
                return Err(Error::Conflict(format!(
                    "an agent is running for {}; it can only stay active",
                    id
                )));
            }
        }

        let (dir, from) = self.store.locate(id)?;
        if let Some(to) = target {
            if to != from {
                self.store.ensure_vacant(id, to)?;
            }
        }

        let (mut issue, _) = self.store.load(id)?;
        let changed = edit(&mut issue, &dir)?;
        if changed {
            issue.touch();
            self.store.save_in_place(&mut issue)?;
        }
        let outcome = match target {
            Some(to) => Some(self.store.move_issue(id, to)?),
            None => None,
        };
        drop(running);

        if changed {
            self.hub.publish(Event::issue_updated(&issue));
        }
        match outcome {
            Some(outcome) => {
                self.announce_move(&outcome);
                Ok(outcome.issue)
            }
            None => Ok(issue),
        }
    }

    /// Register an agent run for `id` and move the issue to `active`.
    ///
    /// Fails with `Conflict` if the issue already has a run or if `max_running`
    /// runs are already registered.
    pub fn start_run(
        &self,
        id: &str,
        agent_id: &str,
        run_id: &str,
        max_running: Option<usize>,
    ) -> Result<RunningProcess> {
        let mut running = self.registry.write();
        if running.contains_key(id) {
            return Err(Error::Conflict(format!("an agent is already running for {}", id)));
        }
        if let Some(cap) = max_running {
            if running.len() >= cap {
                return Err(Error::Conflict(format!(
                    "all {} agent slots are busy",
                    cap
                )));
            }
        }

        let outcome = self.store.move_issue(id, IssueStatus::Active)?;
        let process = RunningProcess {
            issue_id: id.to_string(),
            agent_id: agent_id.to_string(),
            run_id: run_id.to_string(),
            start_time: Utc::now(),
            cancel: self.registry.child_token(),
        };
        running.insert(id.to_string(), process.clone());
        drop(running);

        tracing::info!(issue_id = %id, %agent_id, %run_id, "agent run registered");
        self.announce_move(&outcome);
        Ok(process)
    }

    /// Move a finished run's issue to `to` and unregister it.
    ///
    /// The registry stays write-locked across both steps. The run is
    /// unregistered even if the move fails.
    pub fn finish_run(&self, id: &str, to: IssueStatus) -> Result<Option<MoveOutcome>> {
        let mut running = self.registry.write();
        let result = if to == IssueStatus::Active {
            Ok(None)
        } else {
            self.store.move_issue(id, to).map(Some)
        };
        running.remove(id);
        drop(running);

        match &result {
            Ok(Some(outcome)) => self.announce_move(outcome),
            Ok(None) => {}
            Err(e) => tracing::warn!(issue_id = %id, to = %to, error = %e, "failed to move finished run"),
        }
        tracing::debug!(issue_id = %id, "agent run unregistered");
        result
    }

    /// Persist an edit without publishing.
    pub fn save_quiet(&self, issue: &mut Issue) -> Result<IssueStatus> {
        issue.touch();
        self.store.save_in_place(issue)
    }

    /// Delete an issue that no agent is working on.
    pub fn delete(&self, id: &str) -> Result<Issue> {
        let running = self.registry.read();
        if running.contains_key(id) {
            return Err(Error::Conflict(format!(
                "an agent is running for {}; stop it before deleting",
                id
            )));
        }
        let (issue, status) = self.store.delete(id)?;
        drop(running);

        tracing::info!(issue_id = %id, %status, "issue deleted");
        self.hub.publish(Event::issue_deleted(id, status));
        Ok(issue)
    }

    fn announce_move(&self, outcome: &MoveOutcome) {
        if outcome.moved {
            tracing::info!(issue_id = %outcome.issue.id, from = %outcome.from, to = %outcome.to, "issue status changed");
            self.hub
                .publish(Event::status_changed(&outcome.issue.id, outcome.from, outcome.to));
        }
    }
}
