//! Agent provider settings.
//!
//! Settings are read lazily from
//! `<scenario_root>/initialization/configuration/agent-settings.json`:
//!
//! ```json
//! {
//!   "agent_backend": {"provider": "claude-code", "skip_permissions": true},
//!   "providers": {
//!     "claude-code": {
//!       "cli_command": "resource-claude-code",
//!       "operations": {
//!         "investigate": {"command": ["run", "--tag", "{{TAG}}", "-"],
//!                         "max_turns": 80, "allowed_tools": "Read,Write",
//!                         "timeout_seconds": 600}
//!       }
//!     }
//!   },
//!   "detection": {"rate_limit_phrases": ["rate limit"], "report_phrases": ["root cause"]}
//! }
//! ```
//!
//! A missing or malformed file yields the built-in defaults. Unknown keys are
//! preserved when the file is rewritten by [`AgentSettingsRegistry::update`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::{Error, Result};

/// Settings file location relative to the scenario root.
pub const SETTINGS_PATH: &str = "initialization/configuration/agent-settings.json";

/// Placeholder replaced by the run tag in argument templates.
pub const TAG_PLACEHOLDER: &str = "{{TAG}}";

/// Operation whose settings drive investigations.
pub const INVESTIGATE_OPERATION: &str = "investigate";

pub const DEFAULT_PROVIDER: &str = "claude-code";
pub const DEFAULT_CLI_COMMAND: &str = "resource-claude-code";
pub const DEFAULT_MAX_TURNS: u32 = 80;
pub const DEFAULT_ALLOWED_TOOLS: &str = "Read,Write,Edit,Bash,LS,Glob,Grep";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;

/// Phrases that mark agent output as rate limited.
pub const DEFAULT_RATE_LIMIT_PHRASES: &[&str] = &[
    "usage limit",
    "rate limit",
    "ai usage limit reached",
    "rate/usage limit reached",
    "429",
    "too many requests",
    "quota exceeded",
];

/// Phrases that mark output as a usable report despite a non-zero exit.
pub const DEFAULT_REPORT_PHRASES: &[&str] = &[
    "investigation summary",
    "root cause",
    "remediation",
    "validation plan",
    "confidence assessment",
];

fn default_args() -> Vec<String> {
    ["run", "--tag", TAG_PLACEHOLDER, "-"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn to_strings(phrases: &[&str]) -> Vec<String> {
    phrases.iter().map(|s| s.to_string()).collect()
}

/// Effective settings for the investigate operation of the active provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSettings {
    pub provider: String,
    pub cli_command: String,
    /// Argument template; `{{TAG}}` is replaced per run
    pub args: Vec<String>,
    pub max_turns: u32,
    /// Comma-separated tool allowlist
    pub allowed_tools: String,
    pub timeout_seconds: u64,
    pub skip_permissions: bool,
    pub rate_limit_phrases: Vec<String>,
    pub report_phrases: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            cli_command: DEFAULT_CLI_COMMAND.to_string(),
            args: default_args(),
            max_turns: DEFAULT_MAX_TURNS,
            allowed_tools: DEFAULT_ALLOWED_TOOLS.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            skip_permissions: true,
            rate_limit_phrases: to_strings(DEFAULT_RATE_LIMIT_PHRASES),
            report_phrases: to_strings(DEFAULT_REPORT_PHRASES),
        }
    }
}

impl AgentSettings {
    /// Arguments with the tag placeholder substituted.
    pub fn render_args(&self, tag: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(TAG_PLACEHOLDER, tag))
            .collect()
    }

    /// Whether the active provider is a Codex variant.
    pub fn is_codex(&self) -> bool {
        self.provider.to_lowercase().contains("codex")
    }
}

/// Partial update accepted by [`AgentSettingsRegistry::update`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSettingsPatch {
    pub provider: Option<String>,
    pub cli_command: Option<String>,
    pub args: Option<Vec<String>>,
    pub max_turns: Option<u32>,
    pub allowed_tools: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub skip_permissions: Option<bool>,
    pub rate_limit_phrases: Option<Vec<String>>,
    pub report_phrases: Option<Vec<String>>,
}

// On-disk shape. Every level keeps unknown keys in `rest`.

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct SettingsFile {
    agent_backend: BackendSection,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    providers: BTreeMap<String, ProviderSection>,
    detection: DetectionSection,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct BackendSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skip_permissions: Option<bool>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ProviderSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    cli_command: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    operations: BTreeMap<String, OperationSection>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct OperationSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_turns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_tools: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_seconds: Option<u64>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct DetectionSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    rate_limit_phrases: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report_phrases: Option<Vec<String>>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl SettingsFile {
    fn effective(&self) -> AgentSettings {
        let mut settings = AgentSettings::default();

        if let Some(provider) = non_blank(&self.agent_backend.provider) {
            settings.provider = provider.to_string();
        }
        if let Some(skip) = self.agent_backend.skip_permissions {
            settings.skip_permissions = skip;
        }

        if let Some(provider) = self.providers.get(&settings.provider) {
            if let Some(cli) = non_blank(&provider.cli_command) {
                settings.cli_command = cli.to_string();
            }
            if let Some(op) = provider.operations.get(INVESTIGATE_OPERATION) {
                if let Some(command) = op.command.as_ref().filter(|c| !c.is_empty()) {
                    settings.args = command.clone();
                }
                if let Some(max_turns) = op.max_turns.filter(|n| *n > 0) {
                    settings.max_turns = max_turns;
                }
                if let Some(tools) = non_blank(&op.allowed_tools) {
                    settings.allowed_tools = tools.to_string();
                }
                if let Some(timeout) = op.timeout_seconds.filter(|n| *n > 0) {
                    settings.timeout_seconds = timeout;
                }
            }
        }

        if let Some(phrases) = self.detection.rate_limit_phrases.as_ref().filter(|p| !p.is_empty()) {
            settings.rate_limit_phrases = lowercase_all(phrases);
        }
        if let Some(phrases) = self.detection.report_phrases.as_ref().filter(|p| !p.is_empty()) {
            settings.report_phrases = lowercase_all(phrases);
        }
        settings
    }

    fn apply(&mut self, patch: &AgentSettingsPatch, current: &AgentSettings) {
        if let Some(provider) = &patch.provider {
            self.agent_backend.provider = Some(provider.trim().to_string());
        }
        if let Some(skip) = patch.skip_permissions {
            self.agent_backend.skip_permissions = Some(skip);
        }

        let provider_id = patch
            .provider
            .as_deref()
            .map(str::trim)
            .unwrap_or(current.provider.as_str())
            .to_string();
        let provider = self.providers.entry(provider_id).or_default();
        if let Some(cli) = &patch.cli_command {
            provider.cli_command = Some(cli.clone());
        }

        let op = provider
            .operations
            .entry(INVESTIGATE_OPERATION.to_string())
            .or_default();
        if let Some(args) = &patch.args {
            op.command = Some(args.clone());
        }
        if let Some(max_turns) = patch.max_turns {
            op.max_turns = Some(max_turns);
        }
        if let Some(tools) = &patch.allowed_tools {
            op.allowed_tools = Some(tools.clone());
        }
        if let Some(timeout) = patch.timeout_seconds {
            op.timeout_seconds = Some(timeout);
        }

        if let Some(phrases) = &patch.rate_limit_phrases {
            self.detection.rate_limit_phrases = Some(phrases.clone());
        }
        if let Some(phrases) = &patch.report_phrases {
            self.detection.report_phrases = Some(phrases.clone());
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn lowercase_all(phrases: &[String]) -> Vec<String> {
    phrases.iter().map(|p| p.to_lowercase()).collect()
}

/// Lazily loaded, reloadable agent settings shared by all runs.
#[derive(Debug)]
pub struct AgentSettingsRegistry {
    path: PathBuf,
    current: RwLock<Option<Arc<AgentSettings>>>,
}

impl AgentSettingsRegistry {
    pub fn new(scenario_root: &Path) -> Self {
        Self {
            path: scenario_root.join(SETTINGS_PATH),
            current: RwLock::new(None),
        }
    }

    /// Registry that never touches disk.
    pub fn fixed(settings: AgentSettings) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(Some(Arc::new(settings))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings, loading them on first use.
    pub fn get(&self) -> Arc<AgentSettings> {
        {
            let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(settings) = current.as_ref() {
                return settings.clone();
            }
        }

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(settings) = current.as_ref() {
            return settings.clone();
        }
        let settings = Arc::new(self.load());
        *current = Some(settings.clone());
        settings
    }

    /// Re-read the settings file and swap the record.
    pub fn reload(&self) -> Arc<AgentSettings> {
        let settings = Arc::new(self.load());
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(settings.clone());
        tracing::info!(
            provider = %settings.provider,
            cli = %settings.cli_command,
            timeout = settings.timeout_seconds,
            "agent settings reloaded"
        );
        settings
    }

    /// Write a partial update to the settings file, then reload.
    pub fn update(&self, patch: &AgentSettingsPatch) -> Result<Arc<AgentSettings>> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::Other("settings are not backed by a file".to_string()));
        }
        validate_patch(patch)?;

        let current = self.get();
        let mut file = match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str::<SettingsFile>(&content).map_err(|e| {
                tracing::warn!(path = %self.path.display(), error = %e, "refusing to overwrite malformed agent settings");
                Error::Other(format!(
                    "agent settings file {} is malformed, fix it before updating: {}",
                    self.path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SettingsFile::default(),
            Err(e) => return Err(e.into()),
        };
        file.apply(patch, &current);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&file)? + "\n")?;

        Ok(self.reload())
    }

    fn load(&self) -> AgentSettings {
        if self.path.as_os_str().is_empty() {
            return AgentSettings::default();
        }
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "cannot read agent settings, using defaults");
                }
                return AgentSettings::default();
            }
        };
        match serde_json::from_str::<SettingsFile>(&content) {
            Ok(file) => file.effective(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "malformed agent settings, using defaults");
                AgentSettings::default()
            }
        }
    }
}

fn validate_patch(patch: &AgentSettingsPatch) -> Result<()> {
    if matches!(&patch.provider, Some(p) if p.trim().is_empty()) {
        return Err(Error::InvalidInput("provider must not be empty".to_string()));
    }
    if matches!(&patch.cli_command, Some(c) if c.trim().is_empty()) {
        return Err(Error::InvalidInput("cli_command must not be empty".to_string()));
    }
    if matches!(&patch.args, Some(args) if args.is_empty()) {
        return Err(Error::InvalidInput("args must not be empty".to_string()));
    }
    if patch.max_turns == Some(0) {
        return Err(Error::InvalidInput("max_turns must be at least 1".to_string()));
    }
    if patch.timeout_seconds == Some(0) {
        return Err(Error::InvalidInput("timeout_seconds must be at least 1".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_settings(root: &Path, content: &str) {
        let path = root.join(SETTINGS_PATH);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let registry = AgentSettingsRegistry::new(dir.path());
        let settings = registry.get();
        assert_eq!(*settings, AgentSettings::default());
        assert_eq!(settings.max_turns, 80);
        assert_eq!(settings.allowed_tools, "Read,Write,Edit,Bash,LS,Glob,Grep");
        assert_eq!(settings.timeout_seconds, 600);
        assert!(settings.skip_permissions);
        assert_eq!(settings.cli_command, "resource-claude-code");
    }

    #[test]
    fn test_malformed_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        write_settings(dir.path(), "{not json");
        let registry = AgentSettingsRegistry::new(dir.path());
        assert_eq!(*registry.get(), AgentSettings::default());
    }

    #[test]
    fn test_provider_operation_overrides() {
        let dir = TempDir::new().unwrap();
        write_settings(
            dir.path(),
            r#"{
                "agent_backend": {"provider": "codex", "skip_permissions": false},
                "providers": {
                    "codex": {
                        "cli_command": "resource-codex",
                        "operations": {"investigate": {"max_turns": 12, "timeout_seconds": 30,
                                                       "command": ["exec", "{{TAG}}"]}}
                    },
                    "claude-code": {"cli_command": "ignored"}
                }
            }"#,
        );
        let registry = AgentSettingsRegistry::new(dir.path());
        let settings = registry.get();
        assert_eq!(settings.provider, "codex");
        assert_eq!(settings.cli_command, "resource-codex");
        assert_eq!(settings.max_turns, 12);
        assert_eq!(settings.timeout_seconds, 30);
        assert!(!settings.skip_permissions);
        assert!(settings.is_codex());
        assert_eq!(settings.allowed_tools, DEFAULT_ALLOWED_TOOLS);
        assert_eq!(settings.render_args("t-1"), vec!["exec", "t-1"]);
    }

    #[test]
    fn test_get_is_cached_until_reload() {
        let dir = TempDir::new().unwrap();
        let registry = AgentSettingsRegistry::new(dir.path());
        assert_eq!(registry.get().max_turns, 80);

        write_settings(
            dir.path(),
            r#"{"providers": {"claude-code": {"operations": {"investigate": {"max_turns": 5}}}}}"#,
        );
        assert_eq!(registry.get().max_turns, 80);
        assert_eq!(registry.reload().max_turns, 5);
        assert_eq!(registry.get().max_turns, 5);
    }

    #[test]
    fn test_update_writes_and_preserves_unknown_keys() {
        let dir = TempDir::new().unwrap();
        write_settings(
            dir.path(),
            r#"{"ui": {"theme": "dark"},
                "providers": {"claude-code": {"model": "opus", "operations": {"investigate": {"max_turns": 5}}}}}"#,
        );
        let registry = AgentSettingsRegistry::new(dir.path());
        let patch = AgentSettingsPatch {
            timeout_seconds: Some(42),
            rate_limit_phrases: Some(vec!["Slow Down".to_string()]),
            ..AgentSettingsPatch::default()
        };
        let settings = registry.update(&patch).unwrap();
        assert_eq!(settings.timeout_seconds, 42);
        assert_eq!(settings.max_turns, 5);
        assert_eq!(settings.rate_limit_phrases, vec!["slow down"]);

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(registry.path()).unwrap()).unwrap();
        assert_eq!(raw["ui"]["theme"], "dark");
        assert_eq!(raw["providers"]["claude-code"]["model"], "opus");
        assert_eq!(raw["providers"]["claude-code"]["operations"]["investigate"]["timeout_seconds"], 42);
    }

    #[test]
    fn test_update_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let registry = AgentSettingsRegistry::new(dir.path());
        let patch = AgentSettingsPatch {
            max_turns: Some(0),
            ..AgentSettingsPatch::default()
        };
        assert!(matches!(registry.update(&patch), Err(Error::InvalidInput(_))));
        assert!(!registry.path().exists());
    }

    #[test]
    fn test_update_keeps_malformed_file() {
        let dir = TempDir::new().unwrap();
        write_settings(dir.path(), "{not json");
        let registry = AgentSettingsRegistry::new(dir.path());
        let patch = AgentSettingsPatch {
            max_turns: Some(7),
            ..AgentSettingsPatch::default()
        };
        let err = registry.update(&patch).unwrap_err();
        assert!(err.to_string().contains("malformed"));
        assert_eq!(fs::read_to_string(registry.path()).unwrap(), "{not json");
        assert_eq!(registry.get().max_turns, 80);
    }
}
