//! Agent integration.
//!
//! | Module         | Role                                                        |
//! |----------------|-------------------------------------------------------------|
//! | `settings`     | Provider settings loaded from the scenario root             |
//! | `executor`     | Spawns the agent CLI and classifies how the run ended       |
//! | `investigate`  | Orchestrates a run from prompt to persisted result          |
//! | `registry`     | Tracks in-flight runs by issue id                           |
//! | `rate_limit`   | Parks throttled issues in `waiting` and releases them later |
//! | `transcript`   | Reads NDJSON transcripts for display                        |

pub mod executor;
pub mod investigate;
pub mod rate_limit;
pub mod registry;
pub mod settings;
pub mod transcript;

pub use executor::{AgentOutcome, AgentOutput, AgentRequest, AgentRunner, CliAgentRunner, ExitKind};
pub use investigate::{DEFAULT_AGENT_ID, Investigator, RunTicket};
pub use rate_limit::{RateLimitStatus, RateLimitTracker};
pub use registry::{ProcessRegistry, RunningProcess};
pub use settings::{AgentSettings, AgentSettingsPatch, AgentSettingsRegistry};

/// Scripted agent runners for tests.
#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tokio_util::task::TaskTracker;

    use super::*;
    use crate::Result;
    use crate::events::EventHub;
    use crate::lifecycle::Lifecycle;
    use crate::processor::{ProcessorControl, ProcessorState};
    use crate::test_utils::TestEnv;

    enum Script {
        Exit(i32, String),
        TimedOut(String),
        UntilCancelled,
    }

    /// Returns canned output instead of spawning a process.
    pub struct ScriptedRunner {
        script: Script,
        pub prompts: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new(script: Script) -> Self {
            Self {
                script,
                prompts: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Exit with `code` after printing `stdout`.
        pub fn exit(code: i32, stdout: &str) -> Self {
            Self::new(Script::Exit(code, stdout.to_string()))
        }

        /// Hit the deadline after printing `stdout`.
        pub fn timed_out(stdout: &str) -> Self {
            Self::new(Script::TimedOut(stdout.to_string()))
        }

        /// Block until the run is cancelled.
        pub fn until_cancelled() -> Self {
            Self::new(Script::UntilCancelled)
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn run(&self, request: AgentRequest, _settings: &AgentSettings) -> Result<AgentOutput> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let output = match &self.script {
                Script::Exit(code, stdout) => AgentOutput {
                    stdout: stdout.clone(),
                    combined: stdout.clone(),
                    exit_code: Some(*code),
                    ..AgentOutput::default()
                },
                Script::TimedOut(stdout) => AgentOutput {
                    stdout: stdout.clone(),
                    combined: stdout.clone(),
                    timed_out: true,
                    ..AgentOutput::default()
                },
                Script::UntilCancelled => {
                    request.cancel.cancelled().await;
                    AgentOutput {
                        cancelled: true,
                        ..AgentOutput::default()
                    }
                }
            };
            Ok(output)
        }
    }

    /// Investigator wired to `runner` with its own processor state.
    pub fn investigator_with(
        env: &TestEnv,
        runner: ScriptedRunner,
        state: ProcessorState,
    ) -> (Investigator, Lifecycle, ProcessorControl) {
        let lifecycle = env.lifecycle();
        let control = ProcessorControl::new(state, lifecycle.registry().clone(), EventHub::noop());
        let investigator = Investigator::new(
            lifecycle.clone(),
            Arc::new(AgentSettingsRegistry::new(env.scenario_path())),
            Arc::new(runner),
            control.clone(),
            env.scenario_path(),
            TaskTracker::new(),
        );
        (investigator, lifecycle, control)
    }

    pub fn investigator_for(env: &TestEnv, runner: ScriptedRunner) -> (Investigator, Lifecycle) {
        let (investigator, lifecycle, _) = investigator_with(env, runner, ProcessorState::default());
        (investigator, lifecycle)
    }
}
