//! Permission rules: sources, behaviors, the `ToolName(pattern)` grammar and
//! rule validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a rule came from.
///
/// Variants are declared in precedence order, so `Ord` sorts the highest
/// precedence source first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleSource {
    CliArg,
    Session,
    LocalSettings,
    ProjectSettings,
    PolicySettings,
    UserSettings,
    FlagSettings,
}

impl RuleSource {
    /// All sources, highest precedence first
    pub const PRECEDENCE: [RuleSource; 7] = [
        RuleSource::CliArg,
        RuleSource::Session,
        RuleSource::LocalSettings,
        RuleSource::ProjectSettings,
        RuleSource::PolicySettings,
        RuleSource::UserSettings,
        RuleSource::FlagSettings,
    ];
}

impl fmt::Display for RuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleSource::CliArg => "cliArg",
            RuleSource::Session => "session",
            RuleSource::LocalSettings => "localSettings",
            RuleSource::ProjectSettings => "projectSettings",
            RuleSource::PolicySettings => "policySettings",
            RuleSource::UserSettings => "userSettings",
            RuleSource::FlagSettings => "flagSettings",
        };
        f.write_str(name)
    }
}

/// What a matching rule does to a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionBehavior {
    Allow,
    Deny,
    Ask,
}

impl fmt::Display for PermissionBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PermissionBehavior::Allow => "allow",
            PermissionBehavior::Deny => "deny",
            PermissionBehavior::Ask => "ask",
        })
    }
}

/// Fallback behavior when no rule matches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    Allow,
    Deny,
    #[default]
    Ask,
}

impl PermissionMode {
    pub fn behavior(self) -> PermissionBehavior {
        match self {
            PermissionMode::Allow => PermissionBehavior::Allow,
            PermissionMode::Deny => PermissionBehavior::Deny,
            PermissionMode::Ask => PermissionBehavior::Ask,
        }
    }
}

/// A rule string that failed to parse or validate
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RuleValidationError {
    pub message: String,
    pub suggestion: Option<String>,
}

impl RuleValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
        }
    }

    fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// The `ToolName` or `ToolName(pattern)` part of a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionRuleValue {
    pub tool_name: String,
    pub pattern: Option<String>,
}

impl PermissionRuleValue {
    pub fn new(tool_name: impl Into<String>, pattern: Option<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            pattern,
        }
    }

    /// Parse the rule grammar. Only structure is checked here; see
    /// [`validate_rule`] for the full set of checks.
    pub fn parse(rule: &str) -> Result<Self, RuleValidationError> {
        let rule = rule.trim();
        if rule.is_empty() {
            return Err(RuleValidationError::new("Permission rule cannot be empty"));
        }

        let opens = rule.matches('(').count();
        let closes = rule.matches(')').count();
        if opens != closes {
            return Err(RuleValidationError::new("Mismatched parentheses in permission rule")
                .with_suggestion("Use the form ToolName(pattern)"));
        }

        let Some(open) = rule.find('(') else {
            return Ok(Self::new(rule, None));
        };
        if !rule.ends_with(')') {
            return Err(RuleValidationError::new("Permission rule must end with ')' after its pattern")
                .with_suggestion("Use the form ToolName(pattern)"));
        }

        let tool_name = rule[..open].trim();
        if tool_name.is_empty() {
            return Err(RuleValidationError::new("Permission rule is missing a tool name"));
        }
        let pattern = &rule[open + 1..rule.len() - 1];
        if pattern.trim().is_empty() {
            return Err(RuleValidationError::new(format!("Empty pattern in rule '{rule}'"))
                .with_suggestion(format!("Use '{tool_name}' to match every call")));
        }

        Ok(Self::new(tool_name, Some(pattern.to_string())))
    }

    /// True for names of the form `server__tool`
    pub fn is_namespaced(&self) -> bool {
        is_namespaced(&self.tool_name)
    }
}

impl fmt::Display for PermissionRuleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pattern {
            Some(pattern) => write!(f, "{}({})", self.tool_name, pattern),
            None => f.write_str(&self.tool_name),
        }
    }
}

impl TryFrom<String> for PermissionRuleValue {
    type Error = RuleValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PermissionRuleValue> for String {
    fn from(value: PermissionRuleValue) -> Self {
        value.to_string()
    }
}

/// A rule attached to its source and behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub source: RuleSource,
    pub behavior: PermissionBehavior,
    pub value: PermissionRuleValue,
}

impl fmt::Display for PermissionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} rule from {})", self.value, self.behavior, self.source)
    }
}

pub(crate) fn is_namespaced(tool_name: &str) -> bool {
    tool_name.contains("__")
}

pub(crate) const SHELL_TOOL: &str = "Bash";
pub(crate) const DOMAIN_TOOL: &str = "WebFetch";
pub(crate) const FILE_TOOLS: &[&str] = &["Read", "Write", "Edit", "MultiEdit", "NotebookEdit", "Glob", "Grep", "LS"];
pub(crate) const PREFIX_WILDCARD: &str = ":*";
pub(crate) const DOMAIN_PREFIX: &str = "domain:";

/// Parse and fully validate a rule string before it is persisted.
pub fn validate_rule(rule: &str) -> Result<PermissionRuleValue, RuleValidationError> {
    let value = PermissionRuleValue::parse(rule)?;

    if value.is_namespaced() {
        if value.pattern.is_some() {
            return Err(RuleValidationError::new(format!(
                "Rules for namespaced tool '{}' cannot carry a pattern",
                value.tool_name
            ))
            .with_suggestion(value.tool_name.clone()));
        }
        return Ok(value);
    }

    if !value.tool_name.starts_with(|c: char| c.is_ascii_uppercase()) {
        let mut chars = value.tool_name.chars();
        let suggestion = chars
            .next()
            .map(|first| first.to_uppercase().chain(chars).collect::<String>());
        let mut err = RuleValidationError::new(format!(
            "Tool name '{}' must start with an uppercase letter",
            value.tool_name
        ));
        if let Some(name) = suggestion {
            err = err.with_suggestion(match &value.pattern {
                Some(p) => format!("{name}({p})"),
                None => name,
            });
        }
        return Err(err);
    }

    if let Some(pattern) = &value.pattern {
        validate_pattern(&value.tool_name, pattern)?;
    }
    Ok(value)
}

fn validate_pattern(tool_name: &str, pattern: &str) -> Result<(), RuleValidationError> {
    let trimmed = pattern.trim();
    if trimmed == "*" {
        return Err(RuleValidationError::new("A bare '*' pattern is not allowed")
            .with_suggestion(format!("Use '{tool_name}' to match every call")));
    }

    if !quotes_balanced(pattern) {
        return Err(RuleValidationError::new(format!("Unbalanced quotes in pattern '{pattern}'")));
    }

    match tool_name {
        SHELL_TOOL => validate_shell_pattern(pattern),
        DOMAIN_TOOL => {
            let Some(host) = pattern.strip_prefix(DOMAIN_PREFIX) else {
                return Err(RuleValidationError::new(format!(
                    "{DOMAIN_TOOL} rules must use the '{DOMAIN_PREFIX}' prefix"
                ))
                .with_suggestion(format!("{DOMAIN_TOOL}({DOMAIN_PREFIX}{})", host_hint(pattern))));
            };
            if host.trim().is_empty() {
                return Err(RuleValidationError::new("Domain pattern is missing a host"));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_shell_pattern(pattern: &str) -> Result<(), RuleValidationError> {
    if let Some(pos) = pattern.find(PREFIX_WILDCARD) {
        if pos + PREFIX_WILDCARD.len() != pattern.len() {
            return Err(RuleValidationError::new(format!(
                "The '{PREFIX_WILDCARD}' wildcard must be at the end of the pattern"
            ))
            .with_suggestion(format!("{SHELL_TOOL}({}{PREFIX_WILDCARD})", &pattern[..pos])));
        }
        if pattern[..pos].trim().is_empty() {
            return Err(RuleValidationError::new("Prefix pattern needs a command before ':*'"));
        }
        return Ok(());
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        let prefix = prefix.trim_end();
        return Err(RuleValidationError::new("Prefix patterns must end with ':*'")
            .with_suggestion(format!("{SHELL_TOOL}({prefix}{PREFIX_WILDCARD})")));
    }
    Ok(())
}

fn quotes_balanced(pattern: &str) -> bool {
    let mut double = 0usize;
    let mut single = 0usize;
    let mut escaped = false;
    for c in pattern.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => double += 1,
            '\'' => single += 1,
            _ => {}
        }
    }
    double % 2 == 0 && single % 2 == 0
}

fn host_hint(pattern: &str) -> String {
    url::Url::parse(pattern)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_else(|| pattern.to_string())
}
