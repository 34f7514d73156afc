//! Tool capability trait and registry

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tern_ai::ToolDefinition;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::{EngineEvent, EventSink};

/// What a tool reports back. `is_error` marks a reported (not thrown) failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    /// Create a successful text result
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Create a reported error result
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A thrown tool failure. These are retried by the coordinator.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Execution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The tool observed cancellation; never retried
    #[error("Cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

/// A sender for tool progress updates during execution.
#[derive(Clone)]
pub struct ProgressSender {
    sink: EventSink,
    tool_use_id: String,
    tool_name: String,
}

impl ProgressSender {
    pub fn new(sink: EventSink, tool_use_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            sink,
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
        }
    }

    /// Send a progress update.
    pub fn send(&self, content: impl Into<String>) {
        self.sink.emit(EngineEvent::ToolProgress {
            tool_use_id: self.tool_use_id.clone(),
            tool_name: self.tool_name.clone(),
            content: content.into(),
        });
    }
}

/// Per-invocation context handed to [`Tool::execute`]
#[derive(Clone)]
pub struct ToolContext {
    pub tool_use_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Cancelled when the turn is aborted
    pub cancel: CancellationToken,
    pub progress: ProgressSender,
}

/// Trait for executable tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls and permission rules)
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for the input
    fn input_schema(&self) -> Value;

    /// Read-only tools may run in parallel with each other
    fn is_read_only(&self) -> bool {
        false
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.input_schema())
    }

    /// Run the tool. `Err` is a thrown failure and may be retried.
    async fn execute(&self, input: Value, ctx: ToolContext) -> Result<ToolOutput, ToolError>;
}

/// Type alias for a shared tool
pub type BoxedTool = Arc<dyn Tool>;

/// Registered tools with their compiled input validators
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, BoxedTool>,
    order: Vec<String>,
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: BoxedTool) {
        let name = tool.name().to_string();
        let schema = tool.input_schema();
        match jsonschema::validator_for(&schema) {
            Ok(validator) => {
                self.schema_cache.insert(name.clone(), Arc::new(validator));
            }
            Err(e) => {
                self.schema_cache.remove(&name);
                tracing::warn!(tool = %name, "Invalid tool input schema, skipping validation: {e}");
            }
        }
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<BoxedTool> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Definitions in registration order
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition())
            .collect()
    }

    /// Unknown tools count as mutating
    pub fn is_read_only(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.is_read_only())
    }

    /// Check a call before dispatch: the tool must exist and the input must match its schema
    pub fn validate_call(&self, name: &str, input: &Value) -> Result<BoxedTool, String> {
        let tool = self.get(name).ok_or_else(|| format!("Unknown tool: {name}"))?;
        if let Some(validator) = self.schema_cache.get(name) {
            if let Some(err) = validate_with_validator(input, validator) {
                return Err(err);
            }
        }
        Ok(tool)
    }
}

/// Validate tool input using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(input: &Value, validator: &jsonschema::Validator) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(input)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{path}: {e}")
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!("Tool input validation failed:\n{}", errors.join("\n")))
    }
}
