//! Rate-limit detection and the `waiting` folder.
//!
//! A rate-limited run parks its issue in `waiting` with
//! `extra.rate_limit_until` holding the reset deadline found in the agent's
//! output. Issues are released back to `open` once the deadline passes.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::events::{Event, EventKind};
use crate::lifecycle::Lifecycle;
use crate::models::{EXTRA_RATE_LIMIT_AGENT, EXTRA_RATE_LIMIT_UNTIL, Issue, IssueStatus};
use crate::{Error, Result};

/// Delay applied when the output carries no reset timestamp.
pub const DEFAULT_RESET_DELAY_SECS: i64 = 300;

fn timestamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"20\d{2}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?")
            .expect("Invalid regex")
    })
}

/// Reset deadline for a rate-limited run.
///
/// Returns the first timestamp-looking text in `output` verbatim, or
/// `now + 5 minutes` in RFC 3339 form.
pub fn detect_reset_deadline(output: &str, now: DateTime<Utc>) -> String {
    match timestamp_regex().find(output) {
        Some(m) => m.as_str().to_string(),
        None => (now + Duration::seconds(DEFAULT_RESET_DELAY_SECS)).to_rfc3339(),
    }
}

/// Parse a stored deadline. Zone-less values are read as UTC.
pub fn parse_deadline(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Record the rate-limit hints on an issue.
pub fn mark_rate_limited(issue: &mut Issue, until: &str, agent_id: &str) {
    issue.set_extra(EXTRA_RATE_LIMIT_UNTIL, until);
    issue.set_extra(EXTRA_RATE_LIMIT_AGENT, agent_id);
}

/// Aggregate view over the `waiting` folder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub rate_limited: bool,
    pub rate_limited_count: usize,
    /// Agent of the issue with the earliest reset
    pub rate_limit_agent: Option<String>,
    pub reset_time: Option<DateTime<Utc>>,
    pub seconds_until_reset: i64,
}

/// What a pass over the `waiting` folder did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReleaseReport {
    /// Issues moved back to `open`
    pub released: Vec<String>,
    /// Issues whose malformed deadline was cleared
    pub cleared: Vec<String>,
}

/// Reads and maintains the `waiting` folder.
#[derive(Clone)]
pub struct RateLimitTracker {
    lifecycle: Lifecycle,
}

impl RateLimitTracker {
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self { lifecycle }
    }

    /// Release waiting issues whose deadline elapsed or is missing.
    ///
    /// Malformed deadlines are cleared in place; such issues are released on
    /// the next pass. Publishes `rate_limit.changed` when anything moved.
    pub fn release_expired(&self) -> Result<ReleaseReport> {
        let now = Utc::now();
        let mut report = ReleaseReport::default();

        for mut issue in self.lifecycle.store().list(Some(IssueStatus::Waiting))? {
            let deadline = issue.extra(EXTRA_RATE_LIMIT_UNTIL).map(str::to_string);
            match deadline.as_deref().map(|d| (d, parse_deadline(d))) {
                Some((_, Some(at))) if at > now => continue,
                Some((raw, None)) => {
                    tracing::warn!(issue_id = %issue.id, deadline = %raw, "clearing malformed rate-limit deadline");
                    issue.clear_extra(EXTRA_RATE_LIMIT_UNTIL);
                    if let Err(e) = self.lifecycle.save_quiet(&mut issue) {
                        tracing::warn!(issue_id = %issue.id, error = %e, "failed to clear rate-limit deadline");
                        continue;
                    }
                    report.cleared.push(issue.id);
                }
                _ => {
                    issue.clear_extra(EXTRA_RATE_LIMIT_UNTIL);
                    issue.clear_extra(EXTRA_RATE_LIMIT_AGENT);
                    if let Err(e) = self.lifecycle.save_quiet(&mut issue) {
                        tracing::warn!(issue_id = %issue.id, error = %e, "failed to release waiting issue");
                        continue;
                    }
                    match self.lifecycle.transition(&issue.id, IssueStatus::Open) {
                        Ok(_) => {
                            tracing::info!(issue_id = %issue.id, "rate limit expired, issue reopened");
                            report.released.push(issue.id);
                        }
                        Err(Error::NotFound(_)) => {}
                        Err(e) => {
                            tracing::warn!(issue_id = %issue.id, error = %e, "failed to release waiting issue");
                        }
                    }
                }
            }
        }

        if !report.released.is_empty() {
            self.publish_status()?;
        }
        Ok(report)
    }

    /// Aggregate status after releasing expired issues.
    pub fn status(&self) -> Result<RateLimitStatus> {
        self.release_expired()?;
        self.aggregate()
    }

    /// Publish `rate_limit.changed` with the current aggregate.
    pub fn publish_status(&self) -> Result<RateLimitStatus> {
        let status = self.aggregate()?;
        self.lifecycle
            .publish(Event::new(EventKind::RateLimitChanged(status.clone())));
        Ok(status)
    }

    fn aggregate(&self) -> Result<RateLimitStatus> {
        let now = Utc::now();
        let mut status = RateLimitStatus::default();

        for issue in self.lifecycle.store().list(Some(IssueStatus::Waiting))? {
            let Some(at) = issue.extra(EXTRA_RATE_LIMIT_UNTIL).and_then(parse_deadline) else {
                continue;
            };
            if at <= now {
                continue;
            }
            status.rate_limited_count += 1;
            let earlier = status.reset_time.map(|current| at < current).unwrap_or(true);
            if earlier {
                status.reset_time = Some(at);
                status.rate_limit_agent = issue.extra(EXTRA_RATE_LIMIT_AGENT).map(str::to_string);
            }
        }

        status.rate_limited = status.rate_limited_count > 0;
        status.seconds_until_reset = status
            .reset_time
            .map(|at| (at - now).num_seconds().max(0))
            .unwrap_or(0);
        Ok(status)
    }
}
