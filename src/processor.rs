//! Background scheduler.
//!
//! Each cycle releases expired `waiting` issues, then admits `open` issues to
//! the investigator (newest first) while agent slots are free. State changes
//! made through [`ProcessorControl::update`] wake the loop early and apply to
//! the next cycle.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::agents::investigate::{DEFAULT_AGENT_ID, Investigator};
use crate::agents::rate_limit::RateLimitTracker;
use crate::agents::registry::ProcessRegistry;
use crate::events::{Event, EventHub, EventKind};
use crate::lifecycle::Lifecycle;
use crate::models::IssueStatus;
use crate::{Error, Result};

pub const DEFAULT_CONCURRENT_SLOTS: usize = 2;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;

/// Scheduler settings plus derived counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorState {
    pub active: bool,
    pub concurrent_slots: usize,
    /// Seconds between cycles
    pub refresh_interval: u64,
    /// Agents registered right now
    #[serde(default)]
    pub currently_running: usize,
    #[serde(default)]
    pub max_issues: Option<u64>,
    #[serde(default)]
    pub max_issues_disabled: bool,
    #[serde(default)]
    pub issues_processed: u64,
}

impl Default for ProcessorState {
    fn default() -> Self {
        Self {
            active: false,
            concurrent_slots: DEFAULT_CONCURRENT_SLOTS,
            refresh_interval: DEFAULT_REFRESH_INTERVAL_SECS,
            currently_running: 0,
            max_issues: None,
            max_issues_disabled: false,
            issues_processed: 0,
        }
    }
}

impl ProcessorState {
    /// Admissions still allowed by the max-issues cap, if one applies.
    pub fn remaining_issues(&self) -> Option<u64> {
        if self.max_issues_disabled {
            return None;
        }
        self.max_issues
            .map(|max| max.saturating_sub(self.issues_processed))
    }
}

/// Partial update of [`ProcessorState`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorPatch {
    pub active: Option<bool>,
    pub concurrent_slots: Option<usize>,
    pub refresh_interval: Option<u64>,
    /// `Some(None)` clears the cap
    #[serde(default, with = "double_option")]
    pub max_issues: Option<Option<u64>>,
    pub max_issues_disabled: Option<bool>,
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Shared handle on the scheduler state.
#[derive(Clone)]
pub struct ProcessorControl {
    state: Arc<RwLock<ProcessorState>>,
    issues_processed: Arc<Mutex<u64>>,
    wake: Arc<Notify>,
    registry: ProcessRegistry,
    hub: EventHub,
}

impl ProcessorControl {
    pub fn new(initial: ProcessorState, registry: ProcessRegistry, hub: EventHub) -> Self {
        let processed = initial.issues_processed;
        Self {
            state: Arc::new(RwLock::new(initial)),
            issues_processed: Arc::new(Mutex::new(processed)),
            wake: Arc::new(Notify::new()),
            registry,
            hub,
        }
    }

    /// Current state with derived counters filled in.
    pub fn snapshot(&self) -> ProcessorState {
        let mut state = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        state.currently_running = self.registry.len();
        state.issues_processed = self.issues_processed();
        state
    }

    pub fn concurrent_slots(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .concurrent_slots
    }

    /// Apply a partial update, publish it and wake the loop.
    pub fn update(&self, patch: &ProcessorPatch) -> Result<ProcessorState> {
        if patch.concurrent_slots == Some(0) {
            return Err(Error::InvalidInput("concurrent_slots must be at least 1".to_string()));
        }
        if patch.refresh_interval == Some(0) {
            return Err(Error::InvalidInput("refresh_interval must be at least 1 second".to_string()));
        }

        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(active) = patch.active {
                state.active = active;
            }
            if let Some(slots) = patch.concurrent_slots {
                state.concurrent_slots = slots;
            }
            if let Some(interval) = patch.refresh_interval {
                state.refresh_interval = interval;
            }
            if let Some(max) = patch.max_issues {
                state.max_issues = max;
            }
            if let Some(disabled) = patch.max_issues_disabled {
                state.max_issues_disabled = disabled;
            }
        }

        let snapshot = self.snapshot();
        tracing::info!(
            active = snapshot.active,
            slots = snapshot.concurrent_slots,
            interval = snapshot.refresh_interval,
            "processor state updated"
        );
        self.publish(&snapshot);
        self.wake.notify_one();
        Ok(snapshot)
    }

    pub fn issues_processed(&self) -> u64 {
        *self
            .issues_processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_processed(&self) {
        *self
            .issues_processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
    }

    /// Zero the processed-issues counter.
    pub fn reset_counter(&self) -> ProcessorState {
        *self
            .issues_processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = 0;
        let snapshot = self.snapshot();
        self.publish(&snapshot);
        self.wake.notify_one();
        snapshot
    }

    fn publish(&self, snapshot: &ProcessorState) {
        self.hub
            .publish(Event::new(EventKind::ProcessorStateChanged(snapshot.clone())));
    }
}

/// What one scheduler pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// Waiting issues moved back to `open`
    pub released: Vec<String>,
    /// Issues handed to the investigator
    pub admitted: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl CycleReport {
    fn skipped(reason: &str, released: Vec<String>) -> Self {
        Self {
            released,
            admitted: Vec::new(),
            skipped: Some(reason.to_string()),
        }
    }
}

/// The scheduler loop.
pub struct Processor {
    control: ProcessorControl,
    investigator: Investigator,
    lifecycle: Lifecycle,
    rate_limits: RateLimitTracker,
}

impl Processor {
    pub fn new(control: ProcessorControl, investigator: Investigator, lifecycle: Lifecycle) -> Self {
        let rate_limits = RateLimitTracker::new(lifecycle.clone());
        Self {
            control,
            investigator,
            lifecycle,
            rate_limits,
        }
    }

    /// Run a single scheduler pass.
    pub fn run_cycle(&self) -> Result<CycleReport> {
        let state = self.control.snapshot();
        if !state.active {
            return Ok(CycleReport::skipped("processor inactive", Vec::new()));
        }

        let released = self.rate_limits.release_expired()?.released;

        let open = self.lifecycle.store().list(Some(IssueStatus::Open))?;
        let running = self.lifecycle.registry().len();
        let mut budget = state.concurrent_slots.saturating_sub(running);
        if budget == 0 {
            return Ok(CycleReport::skipped("no free agent slots", released));
        }
        if let Some(remaining) = state.remaining_issues() {
            budget = budget.min(usize::try_from(remaining).unwrap_or(usize::MAX));
            if budget == 0 {
                return Ok(CycleReport::skipped("max issues reached", released));
            }
        }

        let mut admitted = Vec::new();
        for issue in &open {
            if admitted.len() >= budget {
                break;
            }
            match self.investigator.start(&issue.id, Some(DEFAULT_AGENT_ID), true) {
                Ok(ticket) => {
                    tracing::info!(issue_id = %issue.id, run_id = %ticket.run_id, "processor admitted issue");
                    self.control.record_processed();
                    admitted.push(issue.id.clone());
                }
                Err(Error::Conflict(reason)) => {
                    tracing::debug!(issue_id = %issue.id, %reason, "processor could not admit issue");
                    break;
                }
                Err(e) => {
                    tracing::warn!(issue_id = %issue.id, error = %e, "processor failed to start investigation");
                }
            }
        }

        Ok(CycleReport {
            released,
            admitted,
            skipped: None,
        })
    }

    /// Run cycles until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("processor loop started");
        loop {
            match self.run_cycle() {
                Ok(report) if !report.admitted.is_empty() || !report.released.is_empty() => {
                    tracing::debug!(admitted = ?report.admitted, released = ?report.released, "processor cycle");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "processor cycle failed"),
            }

            let interval = Duration::from_secs(self.control.snapshot().refresh_interval.max(1));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.control.wake.notified() => {}
            }
        }
        tracing::info!("processor loop stopped");
    }
}
