//! Common test utilities for issue tracker integration tests.
//!
//! Provides `TestEnv` for isolated test environments: every test gets its own
//! scenario root and data directory, passed to the binary through the
//! environment so tests stay parallel-safe.

#![allow(dead_code)]

use assert_cmd::Command;
use async_trait::async_trait;
use std::sync::Arc;
pub use tempfile::TempDir;

use app_issue_tracker::agents::{AgentOutput, AgentRequest, AgentRunner, AgentSettings};
use app_issue_tracker::app::App;
use app_issue_tracker::config::{Paths, ServerConfig};

/// A test environment with isolated data storage.
pub struct TestEnv {
    pub scenario_dir: TempDir,
    pub data_dir: TempDir,
}

impl TestEnv {
    /// Create a new test environment with isolated directories.
    pub fn new() -> Self {
        Self {
            scenario_dir: TempDir::new().unwrap(),
            data_dir: TempDir::new().unwrap(),
        }
    }

    /// Get a Command for the issue-tracker binary bound to this environment.
    pub fn tracker(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_issue-tracker"));
        cmd.current_dir(self.scenario_dir.path());
        cmd.env("ISSUE_TRACKER_SCENARIO_ROOT", self.scenario_dir.path());
        cmd.env("ISSUE_TRACKER_DATA_DIR", self.data_dir.path());
        cmd.env_remove("API_PORT");
        cmd.env("RUST_LOG", "error");
        cmd
    }

    pub fn scenario_path(&self) -> &std::path::Path {
        self.scenario_dir.path()
    }

    pub fn data_path(&self) -> &std::path::Path {
        self.data_dir.path()
    }

    /// Server configuration pointing at this environment.
    pub fn config(&self) -> ServerConfig {
        ServerConfig::new(Paths::resolve(Some(self.scenario_path()), Some(self.data_path())).unwrap())
    }

    /// Build an app whose agent prints `stdout` and exits 0.
    pub fn app(&self, stdout: &str) -> App {
        App::with_runner(self.config(), Arc::new(StaticRunner::new(stdout))).unwrap()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Agent runner that returns canned stdout without spawning anything.
pub struct StaticRunner {
    stdout: String,
}

impl StaticRunner {
    pub fn new(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
        }
    }
}

#[async_trait]
impl AgentRunner for StaticRunner {
    async fn run(
        &self,
        _request: AgentRequest,
        _settings: &AgentSettings,
    ) -> app_issue_tracker::Result<AgentOutput> {
        Ok(AgentOutput {
            stdout: self.stdout.clone(),
            combined: self.stdout.clone(),
            exit_code: Some(0),
            ..AgentOutput::default()
        })
    }
}

/// Parse a CLI JSON line.
pub fn parse_json(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes).unwrap()
}
