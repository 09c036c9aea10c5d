//! Investigation orchestrator.
//!
//! [`Investigator::start`] registers a run, stamps the issue and returns a
//! [`RunTicket`] immediately; the agent itself runs on the shared
//! [`TaskTracker`]. When the agent finishes, its outcome decides where the
//! issue goes:
//!
//! - rate limited (or timed out with a rate-limit signal): `waiting`
//! - any other failure: `failed` with `agent_last_*` hints
//! - success: the JSON report is merged and the reported status applied

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::executor::{
    AgentOutcome, AgentOutput, AgentRequest, AgentRunner, ExitKind, classify_output, mentions_rate_limit,
};
use super::rate_limit::{RateLimitTracker, detect_reset_deadline, mark_rate_limited};
use super::settings::AgentSettingsRegistry;
use crate::events::{AgentFinished, AgentStarted, Event, EventKind};
use crate::lifecycle::Lifecycle;
use crate::models::prompts::{load_prefix_override, render_investigation_prompt};
use crate::models::report::{AgentReport, non_empty, parse_timestamp};
use crate::models::{
    EXTRA_AGENT_FAILURE_TIME, EXTRA_AGENT_LAST_ERROR, EXTRA_AGENT_LAST_STATUS, EXTRA_AGENT_TRANSCRIPT_PATH,
    EXTRA_RUN_ID, EXTRA_TEST_PLAN, IssueStatus,
};
use crate::processor::ProcessorControl;
use crate::{Error, Result};

/// Agent used when the caller names none.
pub const DEFAULT_AGENT_ID: &str = "unified-resolver";

/// Where run output is kept, relative to the scenario root.
pub const TRANSCRIPT_DIR: &str = "tmp/transcripts";

/// Verification status set when the agent supplies a test plan.
pub const PENDING_VALIDATION: &str = "pending-validation";

/// Returned to callers as soon as a run is registered.
#[derive(Debug, Clone, Serialize)]
pub struct RunTicket {
    pub run_id: String,
    pub issue_id: String,
    pub agent_id: String,
    pub start_time: DateTime<Utc>,
}

struct RunContext {
    ticket: RunTicket,
    auto_resolve: bool,
    cancel: CancellationToken,
}

/// Drives agent runs for issues.
#[derive(Clone)]
pub struct Investigator {
    lifecycle: Lifecycle,
    settings: Arc<AgentSettingsRegistry>,
    runner: Arc<dyn AgentRunner>,
    control: ProcessorControl,
    rate_limits: RateLimitTracker,
    scenario_root: PathBuf,
    tracker: TaskTracker,
}

impl Investigator {
    pub fn new(
        lifecycle: Lifecycle,
        settings: Arc<AgentSettingsRegistry>,
        runner: Arc<dyn AgentRunner>,
        control: ProcessorControl,
        scenario_root: &Path,
        tracker: TaskTracker,
    ) -> Self {
        let rate_limits = RateLimitTracker::new(lifecycle.clone());
        Self {
            lifecycle,
            settings,
            runner,
            control,
            rate_limits,
            scenario_root: scenario_root.to_path_buf(),
            tracker,
        }
    }

    /// Register a run for `issue_id` and start the agent in the background.
    ///
    /// Fails with `NotFound` for unknown issues and `Conflict` when the issue
    /// already has a run or every agent slot is taken.
    pub fn start(&self, issue_id: &str, agent_id: Option<&str>, auto_resolve: bool) -> Result<RunTicket> {
        let agent_id = agent_id
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(DEFAULT_AGENT_ID)
            .to_string();
        let run_id = format!("run-{}", uuid::Uuid::new_v4());

        let process = self.lifecycle.start_run(
            issue_id,
            &agent_id,
            &run_id,
            Some(self.control.concurrent_slots()),
        )?;

        if let Err(e) = self.stamp(issue_id, &agent_id, &run_id, process.start_time) {
            if let Err(release) = self.lifecycle.finish_run(issue_id, IssueStatus::Active) {
                tracing::warn!(issue_id = %issue_id, error = %release, "failed to unregister run after stamp failure");
            }
            return Err(e);
        }

        let ticket = RunTicket {
            run_id,
            issue_id: issue_id.to_string(),
            agent_id,
            start_time: process.start_time,
        };
        self.lifecycle.publish(Event::new(EventKind::AgentStarted(AgentStarted {
            issue_id: ticket.issue_id.clone(),
            agent_id: ticket.agent_id.clone(),
            start_time: ticket.start_time,
            run_id: ticket.run_id.clone(),
        })));

        let ctx = RunContext {
            ticket: ticket.clone(),
            auto_resolve,
            cancel: process.cancel,
        };
        let this = self.clone();
        self.tracker.spawn(async move { this.execute(ctx).await });

        Ok(ticket)
    }

    /// Cancel the run for `issue_id`.
    pub fn stop(&self, issue_id: &str) -> Result<()> {
        if self.lifecycle.registry().cancel(issue_id) {
            tracing::info!(issue_id = %issue_id, "agent stop requested");
            Ok(())
        } else {
            Err(Error::NotFound(format!("no running agent for {}", issue_id)))
        }
    }

    /// Wait for every spawned run to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn stamp(&self, issue_id: &str, agent_id: &str, run_id: &str, now: DateTime<Utc>) -> Result<()> {
        let (mut issue, _) = self.lifecycle.store().load(issue_id)?;
        issue.investigation.agent_id = agent_id.to_string();
        issue.investigation.started_at = Some(now);
        issue.investigation.completed_at = None;
        issue.set_extra(EXTRA_RUN_ID, run_id);
        self.lifecycle.save_quiet(&mut issue)?;
        Ok(())
    }

    async fn execute(self, ctx: RunContext) {
        let issue_id = ctx.ticket.issue_id.clone();
        let outcome = self.invoke(&ctx).await;
        tracing::info!(
            issue_id = %issue_id,
            run_id = %ctx.ticket.run_id,
            kind = %outcome.kind,
            duration_ms = outcome.output.duration.as_millis() as u64,
            "agent run finished"
        );

        let transcript = self.save_transcript(&issue_id, &outcome.output);
        let result = if outcome.success {
            self.apply_success(&ctx, &outcome, transcript.as_deref())
        } else {
            self.apply_failure(&ctx, &outcome, transcript.as_deref())
        };

        if let Err(e) = result {
            tracing::error!(issue_id = %issue_id, error = %e, "failed to record agent result");
            if self.lifecycle.registry().contains(&issue_id) {
                if let Err(e) = self.lifecycle.finish_run(&issue_id, IssueStatus::Active) {
                    tracing::warn!(issue_id = %issue_id, error = %e, "failed to unregister run");
                }
            }
        }
    }

    async fn invoke(&self, ctx: &RunContext) -> AgentOutcome {
        let settings = self.settings.get();
        let prepared = self
            .lifecycle
            .store()
            .load(&ctx.ticket.issue_id)
            .map(|(issue, _)| issue);

        let issue = match prepared {
            Ok(issue) => issue,
            Err(e) => return spawn_failure(e),
        };

        let now = Utc::now();
        let prefix = load_prefix_override(&self.scenario_root);
        let prompt = render_investigation_prompt(
            &issue,
            &ctx.ticket.agent_id,
            &self.scenario_root,
            &now.to_rfc3339(),
            prefix.as_deref(),
        );

        let request = AgentRequest {
            issue_id: issue.id.clone(),
            agent_id: ctx.ticket.agent_id.clone(),
            prompt,
            started_at: ctx.ticket.start_time,
            timeout: Duration::from_secs(settings.timeout_seconds),
            cancel: ctx.cancel.clone(),
        };

        match self.runner.run(request, &settings).await {
            Ok(output) => classify_output(output, &settings),
            Err(e) => spawn_failure(e),
        }
    }

    fn save_transcript(&self, issue_id: &str, output: &AgentOutput) -> Option<String> {
        if output.stdout.trim().is_empty() {
            return None;
        }
        let file_name = format!("{}-{}.jsonl", issue_id, Utc::now().format("%Y%m%dT%H%M%S"));
        let relative = format!("{}/{}", TRANSCRIPT_DIR, file_name);
        let dir = self.scenario_root.join(TRANSCRIPT_DIR);
        let written = fs::create_dir_all(&dir).and_then(|_| fs::write(dir.join(&file_name), &output.stdout));
        match written {
            Ok(()) => Some(relative),
            Err(e) => {
                tracing::warn!(issue_id = %issue_id, error = %e, "failed to save agent transcript");
                None
            }
        }
    }

    fn apply_failure(&self, ctx: &RunContext, outcome: &AgentOutcome, transcript: Option<&str>) -> Result<()> {
        let issue_id = &ctx.ticket.issue_id;
        let agent_id = &ctx.ticket.agent_id;
        let (mut issue, _) = self.lifecycle.store().load(issue_id)?;
        let now = Utc::now();
        let error = outcome
            .error
            .clone()
            .unwrap_or_else(|| "agent run failed".to_string());

        let settings = self.settings.get();
        let park = match outcome.kind {
            ExitKind::RateLimited => true,
            ExitKind::Timeout => mentions_rate_limit(&outcome.output.combined, &settings.rate_limit_phrases),
            _ => false,
        };

        let target = if park {
            let until = detect_reset_deadline(&outcome.output.combined, now);
            tracing::warn!(issue_id = %issue_id, %agent_id, until = %until, "agent rate limited, parking issue");
            mark_rate_limited(&mut issue, &until, agent_id);
            IssueStatus::Waiting
        } else {
            tracing::warn!(issue_id = %issue_id, %agent_id, kind = %outcome.kind, error = %error, "agent run failed");
            issue.set_extra(EXTRA_AGENT_LAST_ERROR, error.clone());
            issue.set_extra(EXTRA_AGENT_LAST_STATUS, outcome.kind.as_str());
            issue.set_extra(EXTRA_AGENT_FAILURE_TIME, now.to_rfc3339());
            IssueStatus::Failed
        };
        if let Some(path) = transcript {
            issue.set_extra(EXTRA_AGENT_TRANSCRIPT_PATH, path);
        }

        self.lifecycle.save_quiet(&mut issue)?;
        self.lifecycle.finish_run(issue_id, target)?;

        self.lifecycle.publish(Event::new(EventKind::AgentFailed(AgentFinished {
            issue_id: issue_id.clone(),
            agent_id: agent_id.clone(),
            success: false,
            end_time: Utc::now(),
            new_status: target,
            error: Some(error),
        })));
        if park {
            self.rate_limits.publish_status()?;
        }
        Ok(())
    }

    fn apply_success(&self, ctx: &RunContext, outcome: &AgentOutcome, transcript: Option<&str>) -> Result<()> {
        let issue_id = &ctx.ticket.issue_id;
        let agent_id = &ctx.ticket.agent_id;

        let report = match AgentReport::parse(&outcome.output.stdout) {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(issue_id = %issue_id, error = %e, "agent report unreadable, leaving issue active");
                if let Some(path) = transcript {
                    let (mut issue, _) = self.lifecycle.store().load(issue_id)?;
                    issue.set_extra(EXTRA_AGENT_TRANSCRIPT_PATH, path);
                    self.lifecycle.save_quiet(&mut issue)?;
                }
                self.lifecycle.finish_run(issue_id, IssueStatus::Active)?;
                self.lifecycle.publish(Event::new(EventKind::AgentFailed(AgentFinished {
                    issue_id: issue_id.clone(),
                    agent_id: agent_id.clone(),
                    success: false,
                    end_time: Utc::now(),
                    new_status: IssueStatus::Active,
                    error: Some(e.to_string()),
                })));
                return Ok(());
            }
        };

        let (mut issue, _) = self.lifecycle.store().load(issue_id)?;
        let now = Utc::now();

        issue.investigation.agent_id = agent_id.clone();
        issue.investigation.completed_at = Some(now);
        if let Some(inv) = &report.investigation {
            if let Some(text) = non_empty(&inv.report) {
                issue.investigation.report = text.to_string();
            }
            if let Some(text) = non_empty(&inv.root_cause) {
                issue.investigation.root_cause = text.to_string();
            }
            if let Some(text) = non_empty(&inv.suggested_fix) {
                issue.investigation.suggested_fix = text.to_string();
            }
            if let Some(score) = inv.confidence_score {
                issue.investigation.confidence_score = Some(score.clamp(0, 10) as u8);
            }
            if !inv.affected_files.is_empty() {
                issue.error_context.affected_files = inv.affected_files.clone();
            }
            if let Some(completed) = parse_timestamp(&inv.completed_at) {
                issue.investigation.completed_at = Some(completed);
            }
        }
        if let Some(fix) = &report.fix {
            if let Some(text) = non_empty(&fix.summary) {
                issue.fix.suggested_fix = text.to_string();
            }
            if let Some(text) = non_empty(&fix.implementation_plan) {
                issue.fix.implementation_plan = text.to_string();
            }
            if let Some(text) = non_empty(&fix.rollback_plan) {
                issue.fix.rollback_plan = text.to_string();
            }
            if let Some(text) = non_empty(&fix.test_plan) {
                issue.set_extra(EXTRA_TEST_PLAN, text);
                issue.fix.verification_status = PENDING_VALIDATION.to_string();
            }
        }
        if let Some(started) = issue.investigation.started_at {
            let minutes = (issue.investigation.completed_at.unwrap_or(now) - started).num_minutes();
            issue.investigation.investigation_duration_minutes = Some(minutes.max(0));
        }

        let final_status = report.final_status(ctx.auto_resolve);
        issue.clear_extra(EXTRA_AGENT_LAST_ERROR);
        issue.clear_extra(EXTRA_AGENT_LAST_STATUS);
        issue.clear_extra(EXTRA_AGENT_FAILURE_TIME);
        if final_status == IssueStatus::Failed {
            let error = non_empty(&report.error).unwrap_or("agent reported failure");
            issue.set_extra(EXTRA_AGENT_LAST_ERROR, error);
            issue.set_extra(EXTRA_AGENT_LAST_STATUS, "reported_failure");
            issue.set_extra(EXTRA_AGENT_FAILURE_TIME, now.to_rfc3339());
        }
        if let Some(path) = transcript {
            issue.set_extra(EXTRA_AGENT_TRANSCRIPT_PATH, path);
        }

        self.lifecycle.save_quiet(&mut issue)?;
        self.lifecycle.finish_run(issue_id, final_status)?;

        tracing::info!(issue_id = %issue_id, %agent_id, status = %final_status, "investigation recorded");
        self.lifecycle.publish(Event::new(EventKind::AgentCompleted(AgentFinished {
            issue_id: issue_id.clone(),
            agent_id: agent_id.clone(),
            success: final_status == IssueStatus::Completed,
            end_time: Utc::now(),
            new_status: final_status,
            error: None,
        })));
        Ok(())
    }
}

fn spawn_failure(error: Error) -> AgentOutcome {
    AgentOutcome {
        success: false,
        kind: ExitKind::HardFailure,
        error: Some(error.to_string()),
        output: AgentOutput::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::{ScriptedRunner, investigator_for};
    use crate::models::{EXTRA_RATE_LIMIT_AGENT, EXTRA_RATE_LIMIT_UNTIL, Issue};
    use crate::test_utils::TestEnv;

    fn seed(env: &TestEnv, id: &str) {
        let mut issue = Issue::new(id.to_string(), "Login fails".to_string());
        issue.error_context.error_message = "TypeError".to_string();
        env.store().save(&issue, IssueStatus::Open).unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_parks_issue_in_waiting() {
        let env = TestEnv::new();
        seed(&env, "issue-1");
        let runner = ScriptedRunner::exit(1, "rate limit reached until 2030-01-02T03:04:05");
        let (investigator, lifecycle) = investigator_for(&env, runner);

        investigator.start("issue-1", None, true).unwrap();
        investigator.drain().await;

        let (issue, status) = lifecycle.store().load("issue-1").unwrap();
        assert_eq!(status, IssueStatus::Waiting);
        assert_eq!(issue.extra(EXTRA_RATE_LIMIT_UNTIL), Some("2030-01-02T03:04:05"));
        assert_eq!(issue.extra(EXTRA_RATE_LIMIT_AGENT), Some(DEFAULT_AGENT_ID));
        assert!(lifecycle.registry().is_empty());
    }

    #[tokio::test]
    async fn test_success_merges_report_and_completes() {
        let env = TestEnv::new();
        seed(&env, "issue-1");
        let report = r#"{"issue_id":"issue-1","status":"active",
            "investigation":{"report":"full report","root_cause":"null check","confidence_score":14,
                             "affected_files":["src/login.ts"]},
            "fix":{"summary":"add guard","implementation_plan":"1. guard","test_plan":"run e2e","status":"generated"}}"#;
        let (investigator, lifecycle) = investigator_for(&env, ScriptedRunner::exit(0, report));

        let ticket = investigator.start("issue-1", Some("resolver-x"), false).unwrap();
        assert!(ticket.run_id.starts_with("run-"));
        investigator.drain().await;

        let (issue, status) = lifecycle.store().load("issue-1").unwrap();
        assert_eq!(status, IssueStatus::Completed);
        assert_eq!(issue.investigation.agent_id, "resolver-x");
        assert_eq!(issue.investigation.root_cause, "null check");
        assert_eq!(issue.investigation.confidence_score, Some(10));
        assert_eq!(issue.error_context.affected_files, vec!["src/login.ts".to_string()]);
        assert_eq!(issue.fix.suggested_fix, "add guard");
        assert_eq!(issue.fix.verification_status, PENDING_VALIDATION);
        assert_eq!(issue.extra(EXTRA_TEST_PLAN), Some("run e2e"));
        assert_eq!(issue.extra(EXTRA_RUN_ID), Some(ticket.run_id.as_str()));
        assert!(issue.metadata.resolved_at.is_some());
        assert!(issue.investigation.investigation_duration_minutes.is_some());

        let transcript = issue.extra(EXTRA_AGENT_TRANSCRIPT_PATH).unwrap();
        assert!(transcript.starts_with("tmp/transcripts/issue-1-"));
        assert!(env.scenario_path().join(transcript).is_file());
    }

    #[tokio::test]
    async fn test_hard_failure_moves_to_failed() {
        let env = TestEnv::new();
        seed(&env, "issue-1");
        let (investigator, lifecycle) = investigator_for(&env, ScriptedRunner::exit(3, "segfault"));

        investigator.start("issue-1", None, true).unwrap();
        investigator.drain().await;

        let (issue, status) = lifecycle.store().load("issue-1").unwrap();
        assert_eq!(status, IssueStatus::Failed);
        assert!(issue.extra(EXTRA_AGENT_LAST_ERROR).unwrap().contains("segfault"));
        assert_eq!(issue.extra(EXTRA_AGENT_LAST_STATUS), Some("hard_failure"));
        assert!(issue.extra(EXTRA_AGENT_FAILURE_TIME).is_some());
    }

    #[tokio::test]
    async fn test_timeout_without_rate_limit_fails() {
        let env = TestEnv::new();
        seed(&env, "issue-1");
        let (investigator, lifecycle) = investigator_for(&env, ScriptedRunner::timed_out("still working"));

        investigator.start("issue-1", None, true).unwrap();
        investigator.drain().await;

        let (issue, status) = lifecycle.store().load("issue-1").unwrap();
        assert_eq!(status, IssueStatus::Failed);
        assert_eq!(issue.extra(EXTRA_AGENT_LAST_STATUS), Some("timeout"));
    }

    #[tokio::test]
    async fn test_timeout_with_rate_limit_parks() {
        let env = TestEnv::new();
        seed(&env, "issue-1");
        let (investigator, lifecycle) =
            investigator_for(&env, ScriptedRunner::timed_out("429 too many requests"));

        investigator.start("issue-1", None, true).unwrap();
        investigator.drain().await;

        let (issue, status) = lifecycle.store().load("issue-1").unwrap();
        assert_eq!(status, IssueStatus::Waiting);
        assert!(issue.extra(EXTRA_RATE_LIMIT_UNTIL).is_some());
    }

    #[tokio::test]
    async fn test_unparseable_report_leaves_issue_active() {
        let env = TestEnv::new();
        seed(&env, "issue-1");
        let (investigator, lifecycle) =
            investigator_for(&env, ScriptedRunner::exit(0, "## Investigation Summary\nlooks fine"));

        investigator.start("issue-1", None, true).unwrap();
        investigator.drain().await;

        assert_eq!(lifecycle.store().load("issue-1").unwrap().1, IssueStatus::Active);
        assert!(lifecycle.registry().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_running_and_missing() {
        let env = TestEnv::new();
        seed(&env, "issue-1");
        let (investigator, _) = investigator_for(&env, ScriptedRunner::until_cancelled());

        investigator.start("issue-1", None, true).unwrap();
        assert!(matches!(investigator.start("issue-1", None, true), Err(Error::Conflict(_))));
        assert!(matches!(investigator.start("issue-nope", None, true), Err(Error::NotFound(_))));

        investigator.stop("issue-1").unwrap();
        investigator.drain().await;
        assert!(matches!(investigator.stop("issue-1"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stop_marks_failed_as_cancelled() {
        let env = TestEnv::new();
        seed(&env, "issue-1");
        let (investigator, lifecycle) = investigator_for(&env, ScriptedRunner::until_cancelled());

        investigator.start("issue-1", None, true).unwrap();
        investigator.stop("issue-1").unwrap();
        investigator.drain().await;

        let (issue, status) = lifecycle.store().load("issue-1").unwrap();
        assert_eq!(status, IssueStatus::Failed);
        assert_eq!(issue.extra(EXTRA_AGENT_LAST_STATUS), Some("cancelled"));
    }
}
