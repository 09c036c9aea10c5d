//! Registry of agents currently working on an issue.
//!
//! The registry is a plain map keyed by issue id. Registration and removal go
//! through [`crate::lifecycle::Lifecycle`], which holds the lock across the
//! matching folder move so a registered id is always found in `active`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

/// An in-flight agent run.
#[derive(Debug, Clone, Serialize)]
pub struct RunningProcess {
    pub issue_id: String,
    pub agent_id: String,
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    /// Cancelled by `stop` or by process shutdown
    #[serde(skip)]
    pub cancel: CancellationToken,
}

/// Shared map of running agents, keyed by issue id.
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    inner: Arc<RwLock<HashMap<String, RunningProcess>>>,
    root: CancellationToken,
}

impl ProcessRegistry {
    /// Create an empty registry with its own root token.
    pub fn new() -> Self {
        Self::with_parent(CancellationToken::new())
    }

    /// Create an empty registry whose run tokens are children of `root`.
    pub fn with_parent(root: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            root,
        }
    }

    /// Token for a new run; cancelled together with the root.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RunningProcess>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RunningProcess>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, issue_id: &str) -> bool {
        self.read().contains_key(issue_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, issue_id: &str) -> Option<RunningProcess> {
        self.read().get(issue_id).cloned()
    }

    /// Snapshot of all running agents, oldest first.
    pub fn list(&self) -> Vec<RunningProcess> {
        let mut processes: Vec<RunningProcess> = self.read().values().cloned().collect();
        processes.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        processes
    }

    /// Request cancellation of the run for `issue_id`.
    ///
    /// Returns false if nothing is running for that issue.
    pub fn cancel(&self, issue_id: &str) -> bool {
        match self.read().get(issue_id) {
            Some(process) => {
                process.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}
