//! Prompt templates for investigation runs.
//!
//! The rendered prompt is `prefix + task + suffix`. The prefix can be replaced
//! on disk by `<scenario_root>/prompts/unified-resolver.md`; the suffix always
//! comes from [`INVESTIGATION_SUFFIX_TEMPLATE`].

use std::path::Path;

use super::Issue;

/// Relative location of the prompt prefix override.
pub const PROMPT_OVERRIDE_PATH: &str = "prompts/unified-resolver.md";

/// Built-in prompt prefix.
pub const INVESTIGATION_PREFIX: &str = r#"You are the unified issue resolver for this scenario. You investigate reported application issues end to end: reproduce the failure from the supplied artifacts, find the root cause in the codebase, and propose (or apply, when safe) a minimal fix. Work inside the scenario directory only. Prefer reading code over guessing. Do not modify files outside the scenario. When the fix touches behaviour, describe how to validate it."#;

/// Suffix appended to every investigation prompt.
///
/// Placeholders: `{issue_id}`, `{agent_id}`, `{scenario_root}`, `{timestamp}`.
pub const INVESTIGATION_SUFFIX_TEMPLATE: &str = r#"Issue ID: {issue_id}
Agent: {agent_id}
Scenario root: {scenario_root}
Started: {timestamp}

Structure your findings with these sections:
1. Investigation Summary
2. Root Cause Analysis
3. Affected Components
4. Recommended Solutions
5. Testing Strategy
6. Related Issues
7. Confidence Level (0-10)

Finish by printing a single JSON document on stdout with the keys issue_id, agent_id, status (completed|failed|active), investigation {report, root_cause, suggested_fix, confidence_score, affected_files} and fix {summary, implementation_plan, test_plan, rollback_plan, status}."#;

/// Build the task sentence for an issue.
pub fn task_sentence(issue: &Issue) -> String {
    let mut task = format!(
        "Perform a full investigation and resolution for issue: {}.",
        issue.title.trim()
    );
    let error = issue.error_context.error_message.trim();
    if !error.is_empty() {
        task.push_str(&format!(" Error: {}", error));
    }
    task
}

/// Render the investigation prompt.
///
/// `prefix` is the override loaded from disk, if any.
pub fn render_investigation_prompt(
    issue: &Issue,
    agent_id: &str,
    scenario_root: &Path,
    timestamp: &str,
    prefix: Option<&str>,
) -> String {
    let prefix = prefix
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(INVESTIGATION_PREFIX);
    let suffix = INVESTIGATION_SUFFIX_TEMPLATE
        .replace("{issue_id}", &issue.id)
        .replace("{agent_id}", agent_id)
        .replace("{scenario_root}", &scenario_root.display().to_string())
        .replace("{timestamp}", timestamp);

    format!("{}\n\n{}\n\n{}\n", prefix, task_sentence(issue), suffix)
}

/// Load the prefix override from the scenario root, if present.
pub fn load_prefix_override(scenario_root: &Path) -> Option<String> {
    std::fs::read_to_string(scenario_root.join(PROMPT_OVERRIDE_PATH)).ok()
}
