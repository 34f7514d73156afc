//! Permission-gated tool access
//!
//! Rules come from several sources with a fixed precedence. A call is decided
//! by deny rules first, then allow, then ask, and finally the mode.

pub mod engine;
pub mod rule;
pub mod shell;
pub mod update;

pub use engine::{
    ArgumentSignature, PermissionDecision, PermissionEngine, PermissionStore, RulesBySource,
    ToolPermissionContext, rule_matches,
};
pub use rule::{
    PermissionBehavior, PermissionMode, PermissionRule, PermissionRuleValue, RuleSource,
    RuleValidationError, validate_rule,
};
pub use shell::{CompoundCommand, split_command};
pub use update::{PermissionUpdate, apply_update};
