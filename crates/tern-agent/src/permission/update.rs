//! Permission-update intents and their application to a snapshot

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::engine::ToolPermissionContext;
use super::rule::{PermissionBehavior, PermissionMode, PermissionRuleValue, RuleSource, validate_rule};
use crate::error::{Error, Result};

/// A change to the permission state, addressed to one rule source.
///
/// The engine never persists these itself; they are emitted for an external
/// settings store, which re-supplies the resolved snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PermissionUpdate {
    #[serde(rename_all = "camelCase")]
    AddRules {
        destination: RuleSource,
        behavior: PermissionBehavior,
        rules: Vec<PermissionRuleValue>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveRules {
        destination: RuleSource,
        behavior: PermissionBehavior,
        rules: Vec<PermissionRuleValue>,
    },
    #[serde(rename_all = "camelCase")]
    ReplaceRules {
        destination: RuleSource,
        behavior: PermissionBehavior,
        rules: Vec<PermissionRuleValue>,
    },
    #[serde(rename_all = "camelCase")]
    SetMode {
        destination: RuleSource,
        mode: PermissionMode,
    },
    #[serde(rename_all = "camelCase")]
    AddDirectories {
        destination: RuleSource,
        directories: Vec<PathBuf>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveDirectories {
        destination: RuleSource,
        directories: Vec<PathBuf>,
    },
}

impl PermissionUpdate {
    pub fn destination(&self) -> RuleSource {
        match self {
            PermissionUpdate::AddRules { destination, .. }
            | PermissionUpdate::RemoveRules { destination, .. }
            | PermissionUpdate::ReplaceRules { destination, .. }
            | PermissionUpdate::SetMode { destination, .. }
            | PermissionUpdate::AddDirectories { destination, .. }
            | PermissionUpdate::RemoveDirectories { destination, .. } => *destination,
        }
    }
}

/// Apply an update to a snapshot, producing the next snapshot.
///
/// Rules being added are validated first; one invalid rule rejects the whole
/// update and the input snapshot is left as it was.
pub fn apply_update(context: &ToolPermissionContext, update: &PermissionUpdate) -> Result<ToolPermissionContext> {
    let mut next = context.clone();

    match update {
        PermissionUpdate::AddRules {
            destination,
            behavior,
            rules,
        } => {
            validate_all(rules)?;
            let existing = next.rules_for_mut(*behavior).entry(*destination).or_default();
            for rule in rules {
                if !existing.contains(rule) {
                    existing.push(rule.clone());
                }
            }
        }
        PermissionUpdate::RemoveRules {
            destination,
            behavior,
            rules,
        } => {
            let by_source = next.rules_for_mut(*behavior);
            if let Some(existing) = by_source.get_mut(destination) {
                existing.retain(|r| !rules.contains(r));
                if existing.is_empty() {
                    by_source.remove(destination);
                }
            }
        }
        PermissionUpdate::ReplaceRules {
            destination,
            behavior,
            rules,
        } => {
            validate_all(rules)?;
            let by_source = next.rules_for_mut(*behavior);
            if rules.is_empty() {
                by_source.remove(destination);
            } else {
                by_source.insert(*destination, rules.clone());
            }
        }
        PermissionUpdate::SetMode { mode, .. } => next.mode = *mode,
        PermissionUpdate::AddDirectories { directories, .. } => {
            for dir in directories {
                if !next.additional_directories.contains(dir) {
                    next.additional_directories.push(dir.clone());
                }
            }
        }
        PermissionUpdate::RemoveDirectories { directories, .. } => {
            next.additional_directories.retain(|d| !directories.contains(d));
        }
    }

    tracing::debug!(destination = %update.destination(), "Applied permission update");
    Ok(next)
}

fn validate_all(rules: &[PermissionRuleValue]) -> Result<()> {
    for rule in rules {
        let text = rule.to_string();
        validate_rule(&text).map_err(|e| {
            let mut message = format!("invalid rule '{text}': {}", e.message);
            if let Some(suggestion) = &e.suggestion {
                message.push_str(&format!(" (did you mean '{suggestion}'?)"));
            }
            Error::Validation(message)
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(s: &str) -> PermissionRuleValue {
        PermissionRuleValue::parse(s).unwrap()
    }

    #[test]
    fn test_add_rules_dedups() {
        let ctx = ToolPermissionContext::default();
        let update = PermissionUpdate::AddRules {
            destination: RuleSource::Session,
            behavior: PermissionBehavior::Allow,
            rules: vec![rule("Bash(git:*)"), rule("Bash(git:*)"), rule("Read")],
        };
        let next = apply_update(&ctx, &update).unwrap();
        assert_eq!(next.allow[&RuleSource::Session].len(), 2);
        assert!(ctx.allow.is_empty());
    }

    #[test]
    fn test_invalid_rule_rejects_whole_update() {
        let ctx = ToolPermissionContext::default();
        let update = PermissionUpdate::AddRules {
            destination: RuleSource::LocalSettings,
            behavior: PermissionBehavior::Deny,
            rules: vec![rule("Read"), rule("bash(ls)")],
        };
        let err = apply_update(&ctx, &update).unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m.contains("Bash(ls)")));
    }

    #[test]
    fn test_remove_and_replace() {
        let ctx = ToolPermissionContext::default()
            .with_rule(RuleSource::UserSettings, PermissionBehavior::Ask, rule("Write"))
            .with_rule(RuleSource::UserSettings, PermissionBehavior::Ask, rule("Edit"));

        let removed = apply_update(
            &ctx,
            &PermissionUpdate::RemoveRules {
                destination: RuleSource::UserSettings,
                behavior: PermissionBehavior::Ask,
                rules: vec![rule("Write")],
            },
        )
        .unwrap();
        assert_eq!(removed.ask[&RuleSource::UserSettings], vec![rule("Edit")]);

        let replaced = apply_update(
            &removed,
            &PermissionUpdate::ReplaceRules {
                destination: RuleSource::UserSettings,
                behavior: PermissionBehavior::Ask,
                rules: vec![],
            },
        )
        .unwrap();
        assert!(replaced.ask.is_empty());
    }

    #[test]
    fn test_mode_and_directories() {
        let ctx = ToolPermissionContext::default();
        let next = apply_update(
            &ctx,
            &PermissionUpdate::SetMode {
                destination: RuleSource::Session,
                mode: PermissionMode::Allow,
            },
        )
        .unwrap();
        assert_eq!(next.mode, PermissionMode::Allow);

        let add = PermissionUpdate::AddDirectories {
            destination: RuleSource::Session,
            directories: vec!["/tmp/a".into(), "/tmp/a".into(), "/tmp/b".into()],
        };
        let next = apply_update(&next, &add).unwrap();
        assert_eq!(next.additional_directories.len(), 2);

        let remove = PermissionUpdate::RemoveDirectories {
            destination: RuleSource::Session,
            directories: vec!["/tmp/a".into()],
        };
        let next = apply_update(&next, &remove).unwrap();
        assert_eq!(next.additional_directories, vec![PathBuf::from("/tmp/b")]);
    }

    #[test]
    fn test_update_serializes_with_camel_case_tags() {
        let update = PermissionUpdate::AddRules {
            destination: RuleSource::CliArg,
            behavior: PermissionBehavior::Allow,
            rules: vec![rule("Bash(git:*)")],
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["type"], "addRules");
        assert_eq!(value["destination"], "cliArg");
        assert_eq!(value["rules"][0], "Bash(git:*)");
    }
}
