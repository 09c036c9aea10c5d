//! Agent subprocess execution and outcome classification.
//!
//! [`CliAgentRunner`] spawns the configured agent CLI, pipes the prompt on
//! stdin and streams stdout/stderr line by line until EOF. The deadline and
//! the run's cancellation token both kill the child. [`classify_output`]
//! turns the captured output into an [`AgentOutcome`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::settings::AgentSettings;
use crate::{Error, Result};

/// Substituted when the agent printed nothing at all.
pub const NO_OUTPUT_SENTINEL: &str = "(no output captured from Claude Code)";

/// Prefix of the per-run tag handed to the agent CLI.
pub const RUN_TAG_PREFIX: &str = "app-issue-tracker-";

/// Minimum output length for a failed run to still count as a report.
pub const REPORT_MIN_CHARS: usize = 500;

/// Read buffer size; lines up to this length are read in one pass.
const LINE_BUFFER_BYTES: usize = 1024 * 1024;

/// How long readers may keep draining after the child was killed.
const READER_GRACE: Duration = Duration::from_secs(5);

/// Run tag for an issue.
pub fn run_tag(issue_id: &str) -> String {
    format!("{}{}", RUN_TAG_PREFIX, issue_id)
}

/// How an agent run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    Success,
    Timeout,
    MaxTurns,
    RateLimited,
    HardFailure,
    Cancelled,
}

impl ExitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::Success => "success",
            ExitKind::Timeout => "timeout",
            ExitKind::MaxTurns => "max_turns",
            ExitKind::RateLimited => "rate_limited",
            ExitKind::HardFailure => "hard_failure",
            ExitKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub issue_id: String,
    pub agent_id: String,
    pub prompt: String,
    pub started_at: DateTime<Utc>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// Raw result of an agent process.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub stdout: String,
    pub stderr: String,
    /// Both streams interleaved in arrival order
    pub combined: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

/// Classified result of an agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub kind: ExitKind,
    pub error: Option<String>,
    pub output: AgentOutput,
}

/// Something that can run the agent for an issue.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: AgentRequest, settings: &AgentSettings) -> Result<AgentOutput>;
}

/// Environment injected into the agent process.
///
/// Each key is set under its generic name and with a `CODEX_` prefix;
/// Codex additionally gets `CODEX_SKIP_CONFIRMATIONS`.
pub fn agent_env(settings: &AgentSettings, tag: &str) -> Vec<(String, String)> {
    let skip = if settings.skip_permissions { "yes" } else { "no" };
    let pairs = [
        ("MAX_TURNS", settings.max_turns.to_string()),
        ("ALLOWED_TOOLS", settings.allowed_tools.clone()),
        ("TIMEOUT", settings.timeout_seconds.to_string()),
        ("SKIP_PERMISSIONS", skip.to_string()),
        ("AGENT_TAG", tag.to_string()),
    ];

    let mut env = Vec::with_capacity(pairs.len() * 2 + 1);
    for (key, value) in pairs {
        env.push((key.to_string(), value.clone()));
        env.push((format!("CODEX_{}", key), value));
    }
    if settings.is_codex() {
        env.push((
            "CODEX_SKIP_CONFIRMATIONS".to_string(),
            settings.skip_permissions.to_string(),
        ));
    }
    env
}

/// Classify captured output, in priority order: timeout, cancellation, max
/// turns, rate limit, non-zero exit (with or without a usable report), then
/// zero exit.
pub fn classify_output(mut output: AgentOutput, settings: &AgentSettings) -> AgentOutcome {
    if output.combined.trim().is_empty() {
        output.combined = NO_OUTPUT_SENTINEL.to_string();
    }
    let lower = output.combined.to_lowercase();

    let failure = |kind: ExitKind, error: String, output: AgentOutput| AgentOutcome {
        success: false,
        kind,
        error: Some(error),
        output,
    };

    if output.timed_out {
        let error = Error::Timeout(settings.timeout_seconds).to_string();
        return failure(ExitKind::Timeout, error, output);
    }
    if output.cancelled {
        return failure(ExitKind::Cancelled, "agent run was cancelled".to_string(), output);
    }
    if lower.contains("max turns") && lower.contains("reached") {
        return failure(ExitKind::MaxTurns, Error::MaxTurnsExceeded.to_string(), output);
    }
    if let Some(line) = find_rate_limit_line(&output.combined, &settings.rate_limit_phrases) {
        return failure(ExitKind::RateLimited, format!("RATE_LIMIT: {}", line), output);
    }

    match output.exit_code {
        Some(0) => AgentOutcome {
            success: true,
            kind: ExitKind::Success,
            error: None,
            output,
        },
        code => {
            let has_report = output.combined.chars().count() >= REPORT_MIN_CHARS
                && settings.report_phrases.iter().any(|p| lower.contains(p.as_str()));
            if has_report {
                tracing::info!(exit_code = ?code, "agent exited with an error but produced a report");
                return AgentOutcome {
                    success: true,
                    kind: ExitKind::Success,
                    error: None,
                    output,
                };
            }
            let code = code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string());
            let error = format!("agent exited with {}: {}", code, tail(&output.combined, 500));
            failure(ExitKind::HardFailure, error, output)
        }
    }
}

/// Whether `output` carries a rate-limit signal.
pub fn mentions_rate_limit(output: &str, phrases: &[String]) -> bool {
    find_rate_limit_line(output, phrases).is_some()
}

fn find_rate_limit_line(output: &str, phrases: &[String]) -> Option<String> {
    output
        .lines()
        .find(|line| {
            let lower = line.to_lowercase();
            phrases.iter().any(|p| lower.contains(p.as_str()))
        })
        .map(|line| line.trim().chars().take(300).collect())
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max_chars).collect()
}

/// Runs the configured agent CLI as a child process.
#[derive(Debug, Clone)]
pub struct CliAgentRunner {
    working_dir: PathBuf,
}

impl CliAgentRunner {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl AgentRunner for CliAgentRunner {
    async fn run(&self, request: AgentRequest, settings: &AgentSettings) -> Result<AgentOutput> {
        let start = Instant::now();
        let tag = run_tag(&request.issue_id);

        let mut child = Command::new(&settings.cli_command)
            .args(settings.render_args(&tag))
            .envs(agent_env(settings, &tag))
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::Other(format!("agent command not found: {}", settings.cli_command))
                } else {
                    Error::Io(e)
                }
            })?;

        tracing::info!(
            issue_id = %request.issue_id,
            agent_id = %request.agent_id,
            command = %settings.cli_command,
            pid = ?child.id(),
            "agent process started"
        );

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::debug!(error = %e, "agent closed stdin early");
                }
                // Dropping stdin signals EOF
            });
        }

        let combined = Arc::new(Mutex::new(String::new()));
        let last_activity = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
        let stdout_reader = child
            .stdout
            .take()
            .map(|out| spawn_reader(out, "stdout", combined.clone(), last_activity.clone()));
        let stderr_reader = child
            .stderr
            .take()
            .map(|err| spawn_reader(err, "stderr", combined.clone(), last_activity.clone()));

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        let (status, timed_out, cancelled) = tokio::select! {
            status = child.wait() => (Some(status?), false, false),
            _ = &mut deadline => {
                tracing::warn!(issue_id = %request.issue_id, timeout = ?request.timeout, "agent deadline exceeded, killing");
                let _ = child.start_kill();
                (child.wait().await.ok(), true, false)
            }
            _ = request.cancel.cancelled() => {
                tracing::info!(issue_id = %request.issue_id, "agent run cancelled, killing");
                let _ = child.start_kill();
                (child.wait().await.ok(), false, true)
            }
        };

        let (stdout, stderr) = tokio::join!(join_reader(stdout_reader), join_reader(stderr_reader));
        let combined = std::mem::take(&mut *combined.lock().unwrap_or_else(PoisonError::into_inner));

        Ok(AgentOutput {
            stdout,
            stderr,
            combined,
            exit_code: status.and_then(|s| s.code()),
            timed_out,
            cancelled,
            duration: start.elapsed(),
        })
    }
}

/// A stream reader and the text it has captured so far.
struct StreamCapture {
    handle: JoinHandle<()>,
    captured: Arc<Mutex<String>>,
}

fn spawn_reader<R>(
    stream: R,
    name: &'static str,
    combined: Arc<Mutex<String>>,
    last_activity: Arc<AtomicI64>,
) -> StreamCapture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let captured = Arc::new(Mutex::new(String::new()));
    let own = captured.clone();
    let handle = tokio::spawn(async move {
        let mut reader = BufReader::with_capacity(LINE_BUFFER_BYTES, stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    last_activity.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                    tracing::trace!(stream = name, line = %line.trim_end(), "agent output");
                    own.lock().unwrap_or_else(PoisonError::into_inner).push_str(&line);
                    combined
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push_str(&line);
                }
                Err(e) => {
                    tracing::debug!(stream = name, error = %e, "agent stream read failed");
                    break;
                }
            }
        }
    });
    StreamCapture { handle, captured }
}

/// Wait up to [`READER_GRACE`] for EOF, then return whatever was captured.
///
/// A background process the agent left behind can hold the pipe open; its
/// reader is aborted but the lines already read are kept.
async fn join_reader(reader: Option<StreamCapture>) -> String {
    let Some(StreamCapture { mut handle, captured }) = reader else {
        return String::new();
    };
    match tokio::time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "agent output reader failed"),
        Err(_) => {
            tracing::warn!("agent output reader still open after grace period, aborting");
            handle.abort();
        }
    }
    std::mem::take(&mut *captured.lock().unwrap_or_else(PoisonError::into_inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(combined: &str, exit_code: Option<i32>) -> AgentOutput {
        AgentOutput {
            stdout: combined.to_string(),
            combined: combined.to_string(),
            exit_code,
            ..AgentOutput::default()
        }
    }

    fn classify(out: AgentOutput) -> AgentOutcome {
        classify_output(out, &AgentSettings::default())
    }

    #[test]
    fn test_timeout_wins_over_everything() {
        let mut out = output("rate limit reached; max turns reached", Some(0));
        out.timed_out = true;
        let outcome = classify(out);
        assert!(!outcome.success);
        assert_eq!(outcome.kind, ExitKind::Timeout);
    }

    #[test]
    fn test_max_turns_before_rate_limit() {
        let outcome = classify(output("Max turns (80) reached. Also 429.", Some(1)));
        assert_eq!(outcome.kind, ExitKind::MaxTurns);
    }

    #[test]
    fn test_rate_limit_phrases() {
        for text in [
            "Claude AI usage limit reached|1767225600",
            "HTTP 429",
            "Error: Too Many Requests",
            "quota exceeded for model",
        ] {
            let outcome = classify(output(text, Some(0)));
            assert_eq!(outcome.kind, ExitKind::RateLimited, "{}", text);
            assert!(outcome.error.unwrap().starts_with("RATE_LIMIT: "));
        }
    }

    #[test]
    fn test_nonzero_exit_with_report_is_success() {
        let mut text = String::from("## Investigation Summary\nThe root cause is a missing null check.\n");
        text.push_str(&"detail ".repeat(80));
        let outcome = classify(output(&text, Some(2)));
        assert!(outcome.success);
        assert_eq!(outcome.kind, ExitKind::Success);
    }

    #[test]
    fn test_short_report_on_nonzero_exit_fails() {
        let outcome = classify(output("root cause: unknown", Some(2)));
        assert!(!outcome.success);
        assert_eq!(outcome.kind, ExitKind::HardFailure);
        assert!(outcome.error.unwrap().contains("root cause: unknown"));
    }

    #[test]
    fn test_zero_exit_is_success() {
        let outcome = classify(output("{\"status\":\"completed\"}", Some(0)));
        assert!(outcome.success);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_empty_output_gets_sentinel() {
        let outcome = classify(output("  \n", Some(1)));
        assert_eq!(outcome.kind, ExitKind::HardFailure);
        assert_eq!(outcome.output.combined, NO_OUTPUT_SENTINEL);
    }

    #[test]
    fn test_cancelled_is_failure() {
        let mut out = output("partial", None);
        out.cancelled = true;
        let outcome = classify(out);
        assert!(!outcome.success);
        assert_eq!(outcome.kind, ExitKind::Cancelled);
    }

    #[test]
    fn test_agent_env_sets_both_prefixes() {
        let settings = AgentSettings {
            skip_permissions: false,
            ..AgentSettings::default()
        };
        let env: std::collections::HashMap<String, String> =
            agent_env(&settings, "app-issue-tracker-issue-1").into_iter().collect();
        assert_eq!(env["MAX_TURNS"], "80");
        assert_eq!(env["CODEX_MAX_TURNS"], "80");
        assert_eq!(env["ALLOWED_TOOLS"], "Read,Write,Edit,Bash,LS,Glob,Grep");
        assert_eq!(env["TIMEOUT"], "600");
        assert_eq!(env["SKIP_PERMISSIONS"], "no");
        assert_eq!(env["CODEX_SKIP_PERMISSIONS"], "no");
        assert_eq!(env["AGENT_TAG"], "app-issue-tracker-issue-1");
        assert!(!env.contains_key("CODEX_SKIP_CONFIRMATIONS"));
    }

    #[test]
    fn test_skip_confirmations_only_for_codex() {
        let settings = AgentSettings {
            provider: "codex".to_string(),
            skip_permissions: true,
            ..AgentSettings::default()
        };
        let env: std::collections::HashMap<String, String> =
            agent_env(&settings, "tag").into_iter().collect();
        assert_eq!(env["CODEX_SKIP_CONFIRMATIONS"], "true");
        assert_eq!(env["SKIP_PERMISSIONS"], "yes");
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn shell(script: &str, timeout_seconds: u64) -> AgentSettings {
            AgentSettings {
                cli_command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string(), "{{TAG}}".to_string()],
                timeout_seconds,
                ..AgentSettings::default()
            }
        }

        fn request(prompt: &str, timeout: Duration) -> AgentRequest {
            AgentRequest {
                issue_id: "issue-1".to_string(),
                agent_id: "unified-resolver".to_string(),
                prompt: prompt.to_string(),
                started_at: Utc::now(),
                timeout,
                cancel: CancellationToken::new(),
            }
        }

        #[tokio::test]
        async fn test_prompt_on_stdin_and_env() {
            let dir = tempfile::TempDir::new().unwrap();
            let runner = CliAgentRunner::new(dir.path());
            let settings = shell(
                r#"cat; echo "tag=$0 env=$AGENT_TAG turns=$CODEX_MAX_TURNS"; echo oops >&2"#,
                5,
            );
            let out = runner
                .run(request("hello agent\n", Duration::from_secs(5)), &settings)
                .await
                .unwrap();
            assert_eq!(out.exit_code, Some(0));
            assert!(out.stdout.contains("hello agent"));
            assert!(out.stdout.contains(
                "tag=app-issue-tracker-issue-1 env=app-issue-tracker-issue-1 turns=80"
            ));
            assert_eq!(out.stderr.trim(), "oops");
            assert!(out.combined.contains("oops") && out.combined.contains("hello agent"));
            assert!(!out.timed_out);
        }

        #[tokio::test]
        async fn test_output_kept_when_background_child_holds_pipe() {
            let dir = tempfile::TempDir::new().unwrap();
            let runner = CliAgentRunner::new(dir.path());
            let settings = shell(r#"echo '{"investigation":"x"}'; sleep 30 &"#, 60);
            let started = Instant::now();
            let out = runner
                .run(request("", Duration::from_secs(60)), &settings)
                .await
                .unwrap();
            assert_eq!(out.exit_code, Some(0));
            assert!(out.stdout.contains("investigation"));
            assert!(out.combined.contains("investigation"));
            assert!(started.elapsed() < Duration::from_secs(20));
        }

        #[tokio::test]
        async fn test_deadline_kills_child() {
            let dir = tempfile::TempDir::new().unwrap();
            let runner = CliAgentRunner::new(dir.path());
            let settings = shell("exec sleep 30", 1);
            let started = Instant::now();
            let out = runner
                .run(request("", Duration::from_millis(200)), &settings)
                .await
                .unwrap();
            assert!(out.timed_out);
            assert!(started.elapsed() < Duration::from_secs(10));
            assert_eq!(classify_output(out, &settings).kind, ExitKind::Timeout);
        }

        #[tokio::test]
        async fn test_cancellation_kills_child() {
            let dir = tempfile::TempDir::new().unwrap();
            let runner = CliAgentRunner::new(dir.path());
            let settings = shell("exec sleep 30", 60);
            let req = request("", Duration::from_secs(60));
            let cancel = req.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            });
            let out = runner.run(req, &settings).await.unwrap();
            assert!(out.cancelled);
            assert!(!out.timed_out);
        }

        #[tokio::test]
        async fn test_missing_command_is_an_error() {
            let dir = tempfile::TempDir::new().unwrap();
            let runner = CliAgentRunner::new(dir.path());
            let settings = AgentSettings {
                cli_command: "definitely-not-an-agent-binary".to_string(),
                ..AgentSettings::default()
            };
            let err = runner
                .run(request("", Duration::from_secs(1)), &settings)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("not found"));
        }
    }
}
