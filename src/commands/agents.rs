//! Agent-side commands: rate-limit status and transcripts.

use std::path::Path;

use super::{CommandResult, json_string};
use crate::agents::rate_limit::{RateLimitStatus, RateLimitTracker};
use crate::agents::transcript::{Transcript, load_transcript};
use crate::lifecycle::Lifecycle;
use crate::Result;

impl CommandResult for RateLimitStatus {
    fn to_json(&self) -> String {
        json_string(self)
    }

    fn to_human(&self) -> String {
        if !self.rate_limited {
            return "Not rate limited.".to_string();
        }
        let mut lines = vec![format!("{} issue(s) waiting on a rate limit", self.rate_limited_count)];
        if let Some(agent) = &self.rate_limit_agent {
            lines.push(format!("  Agent: {}", agent));
        }
        if let Some(reset) = self.reset_time {
            lines.push(format!(
                "  Resets: {} (in {}s)",
                reset.format("%Y-%m-%d %H:%M:%S UTC"),
                self.seconds_until_reset
            ));
        }
        lines.join("\n")
    }
}

/// Release expired waits, then report what is still parked.
pub fn rate_limit_status(lifecycle: &Lifecycle) -> Result<RateLimitStatus> {
    RateLimitTracker::new(lifecycle.clone()).status()
}

impl CommandResult for Transcript {
    fn to_json(&self) -> String {
        json_string(self)
    }

    fn to_human(&self) -> String {
        let mut lines = vec![format!("Transcript: {}", self.path)];
        if let Some(prompt) = &self.prompt {
            let first = prompt.lines().next().unwrap_or_default();
            lines.push(format!("Prompt: {}", first));
        }
        for entry in &self.entries {
            let label = match (&entry.role, &entry.msg_type) {
                (Some(role), _) => format!("{}/{}", entry.kind, role),
                (None, Some(msg_type)) => format!("{}/{}", entry.kind, msg_type),
                (None, None) => entry.kind.clone(),
            };
            let text = entry
                .text
                .as_deref()
                .or(entry.error.as_deref())
                .unwrap_or_default();
            lines.push(format!("[{}] {}", label, text));
        }
        if self.truncated {
            lines.push("... (truncated)".to_string());
        }
        lines.join("\n")
    }
}

pub fn transcript(scenario_root: &Path, path: &str, max_entries: Option<usize>) -> Result<Transcript> {
    load_transcript(scenario_root, path, max_entries)
}
