//! Engine configuration file support

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tern_ai::Model;

use crate::compaction::CompactionConfig;
use crate::coordinator::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::permission::{PermissionBehavior, PermissionMode, RuleSource, ToolPermissionContext, validate_rule};
use crate::retry::RetryConfig;

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "TERN_CONFIG_PATH";

/// Configuration for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on model turns per prompt
    pub max_turns: u32,
    pub system_prompt: Option<String>,
    pub model: Model,
    pub compaction: CompactionConfig,
    pub tools: ToolsConfig,
    pub retry: RetrySettings,
    pub permissions: PermissionSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: 50,
            system_prompt: None,
            model: Model::default(),
            compaction: CompactionConfig::default(),
            tools: ToolsConfig::default(),
            retry: RetrySettings::default(),
            permissions: PermissionSettings::default(),
        }
    }
}

/// Tool execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            jitter_factor: 0.2,
        }
    }
}

/// Model request retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Permission rules as written in the file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSettings {
    pub mode: PermissionMode,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub ask: Vec<String>,
    pub additional_directories: Vec<PathBuf>,
}

impl EngineConfig {
    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tern")
            .join("config.toml")
    }

    /// Load from the default location; a missing file gives the defaults
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&content).map_err(|e| match e {
            Error::Config(message) => Error::Config(format!("{}: {message}", path.display())),
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_concurrency: self.tools.max_concurrency.max(1),
            retry: RetryConfig {
                max_retries: self.tools.max_attempts.max(1) - 1,
                initial_delay: Duration::from_millis(self.tools.base_delay_ms),
                max_delay: Duration::from_millis(self.tools.max_delay_ms),
                backoff_multiplier: 2.0,
                jitter_factor: self.tools.jitter_factor,
            },
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            jitter_factor: 0.0,
        }
    }

    /// Build the permission snapshot, loading configured rules as user settings.
    ///
    /// Every invalid rule is reported, not just the first.
    pub fn permission_context(&self) -> Result<ToolPermissionContext> {
        let settings = &self.permissions;
        let mut context = ToolPermissionContext::with_mode(settings.mode);
        context.additional_directories = settings.additional_directories.clone();

        let mut problems = Vec::new();
        for (behavior, rules) in [
            (PermissionBehavior::Allow, &settings.allow),
            (PermissionBehavior::Deny, &settings.deny),
            (PermissionBehavior::Ask, &settings.ask),
        ] {
            for rule in rules {
                match validate_rule(rule) {
                    Ok(value) => {
                        context = context.with_rule(RuleSource::UserSettings, behavior, value);
                    }
                    Err(e) => {
                        let mut problem = format!("{behavior} rule '{rule}': {e}");
                        if let Some(suggestion) = &e.suggestion {
                            problem.push_str(&format!(" (try '{suggestion}')"));
                        }
                        problems.push(problem);
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(context)
        } else {
            Err(Error::Config(format!("invalid permission rules:\n{}", problems.join("\n"))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_turns, 50);
        assert_eq!(config.compaction.token_threshold, 150_000);
        assert_eq!(config.coordinator_config().max_concurrency, 4);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
max_turns = 8
system_prompt = "be brief"

[model]
id = "claude-test"

[compaction]
token_threshold = 1000
window = 3

[tools]
max_concurrency = 2
base_delay_ms = 10

[retry]
max_retries = 1

[permissions]
mode = "deny"
allow = ["Read", "Bash(git:*)"]
deny = ["WebFetch(domain:example.com)"]
additional_directories = ["/tmp/work"]
"#
        )
        .unwrap();

        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.max_turns, 8);
        assert_eq!(config.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(config.model.id, "claude-test");
        assert_eq!(config.model.max_tokens, Model::default().max_tokens);
        assert_eq!(config.compaction.window, 3);
        assert_eq!(config.compaction.min_messages, 10);

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.max_concurrency, 2);
        assert_eq!(coordinator.retry.initial_delay, Duration::from_millis(10));
        assert_eq!(coordinator.retry.max_attempts(), 3);
        assert_eq!(config.retry_config().max_retries, 1);

        let permissions = config.permission_context().unwrap();
        assert_eq!(permissions.mode, PermissionMode::Deny);
        let allow = &permissions.allow[&RuleSource::UserSettings];
        assert_eq!(allow.len(), 2);
        assert_eq!(allow[1].to_string(), "Bash(git:*)");
        assert_eq!(permissions.deny[&RuleSource::UserSettings].len(), 1);
        assert_eq!(permissions.additional_directories, vec![PathBuf::from("/tmp/work")]);
    }

    #[test]
    fn test_invalid_rules_are_all_reported() {
        let config = EngineConfig::parse(
            r#"
[permissions]
allow = ["bash(ls)", "Read"]
deny = ["Bash(npm *)"]
"#,
        )
        .unwrap();
        let Err(Error::Config(message)) = config.permission_context() else {
            panic!("expected a config error");
        };
        assert!(message.contains("'bash(ls)'"));
        assert!(message.contains("try 'Bash(ls)'"));
        assert!(message.contains("'Bash(npm *)'"));
        assert!(!message.contains("'Read'"));
    }

    #[test]
    fn test_malformed_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "max_turns = \"many\"").unwrap();
        let err = EngineConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains(&file.path().display().to_string())));
    }
}
